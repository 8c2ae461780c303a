use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::net::UdpSocket;
use tracing::{error, trace};

pub const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Datagram transport shared by the master and peer roles. Sending is best effort: there are
///  no retries at this level, lost frames are recovered (if at all) by the ping / login cycle.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn try_send(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()>;

    async fn send(&self, to: SocketAddr, buf: &[u8]) {
        if let Err(e) = self.try_send(to, buf).await {
            error!("error sending datagram to {:?}: {}", to, e);
        }
    }

    /// waits for the next datagram
    async fn recv(&self) -> anyhow::Result<(BytesMut, SocketAddr)>;
}

pub struct UdpTransport {
    socket: UdpSocket,
}

impl Debug for UdpTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "UdpTransport{{{:?}}}", self.socket.local_addr())
    }
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<UdpTransport> {
        Ok(UdpTransport {
            socket: UdpSocket::bind(addr).await?,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn try_send(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        trace!("sending {} bytes to {:?}", buf.len(), to);
        self.socket.send_to(buf, to).await?;
        Ok(())
    }

    async fn recv(&self) -> anyhow::Result<(BytesMut, SocketAddr)> {
        let mut buf = BytesMut::zeroed(MAX_DATAGRAM_SIZE);
        let (len, from) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(len);
        trace!("received {} bytes from {:?}", len, from);
        Ok((buf, from))
    }
}
