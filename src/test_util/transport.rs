use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::fne::frame::FneFrame;
use crate::fne::opcodes::{Function, Tag};
use crate::fne::transport::Transport;
use crate::util::buf::get_u32;

#[derive(Debug, Clone)]
pub struct SentFrame {
    pub to: SocketAddr,
    pub buf: BytesMut,
}

impl SentFrame {
    pub fn frame(&self) -> FneFrame<'_> {
        FneFrame::decode(&self.buf).unwrap()
    }

    pub fn function(&self) -> Function {
        self.frame().function().unwrap()
    }

    pub fn tag(&self) -> Tag {
        Tag::of(self.frame().payload).unwrap()
    }

    /// peer id from the FNE header
    pub fn peer_id(&self) -> u32 {
        self.frame().fne.peer_id
    }

    /// the salt carried by an ACK to a login
    pub fn salt(&self) -> u32 {
        get_u32(self.frame().payload, 8)
    }
}

/// Records sent frames, and returns datagrams injected by the test from `recv`
pub struct TrackingTransport {
    tracker: RwLock<Vec<SentFrame>>,
    inject_send: mpsc::Sender<(BytesMut, SocketAddr)>,
    inject_recv: Mutex<mpsc::Receiver<(BytesMut, SocketAddr)>>,
    failing_recv: AtomicBool,
}

impl TrackingTransport {
    pub fn new() -> TrackingTransport {
        let (inject_send, inject_recv) = mpsc::channel(64);
        TrackingTransport {
            tracker: Default::default(),
            inject_send,
            inject_recv: Mutex::new(inject_recv),
            failing_recv: AtomicBool::new(false),
        }
    }

    pub async fn inject(&self, buf: BytesMut, from: SocketAddr) {
        self.inject_send.send((buf, from)).await.unwrap();
    }

    /// makes every subsequent `recv` fail immediately
    pub fn fail_recv(&self) {
        self.failing_recv.store(true, Ordering::Relaxed);
    }

    /// returns sent frames, clearing the internal buffer
    pub async fn take_all(&self) -> Vec<SentFrame> {
        let mut lock = self.tracker.write().await;
        std::mem::take(&mut *lock)
    }

    /// asserts that exactly one frame was sent, and returns it
    pub async fn take_one(&self) -> SentFrame {
        let mut sent = self.take_all().await;
        assert_eq!(sent.len(), 1, "expected exactly one sent frame, was {:?}", sent);
        sent.remove(0)
    }

    pub async fn assert_nothing_sent(&self) {
        let sent = self.tracker.read().await;
        assert!(sent.is_empty(), "expected no sent frames, was {:?}", sent);
    }
}

#[async_trait]
impl Transport for TrackingTransport {
    async fn try_send(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        self.tracker.write().await.push(SentFrame { to, buf: BytesMut::from(buf) });
        Ok(())
    }

    async fn recv(&self) -> anyhow::Result<(BytesMut, SocketAddr)> {
        if self.failing_recv.load(Ordering::Relaxed) {
            anyhow::bail!("socket error");
        }
        self.inject_recv.lock().await
            .recv().await
            .ok_or_else(|| anyhow::anyhow!("injection channel closed"))
    }
}
