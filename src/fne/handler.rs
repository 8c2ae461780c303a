use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};

use crate::fne::opcodes::{MasterCommand, Tag, TransferSubFunction};
use crate::fne::peer_details::PeerDetails;
use crate::fne::traffic::TrafficFrame;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct GrantRequest {
    pub peer_id: u32,
    pub src_id: u32,
    pub dst_id: u32,
    pub slot: u8,
    pub unit_to_unit: bool,
}

impl GrantRequest {
    pub fn ser(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(18);
        buf.put_slice(&Tag::GRANT_REQUEST.0);
        buf.put_u32(self.peer_id);
        buf.put_u32(self.src_id);
        buf.put_u32(self.dst_id);
        buf.put_u8(self.slot);
        buf.put_u8(if self.unit_to_unit { 1 } else { 0 });
        buf
    }

    pub fn deser(mut buf: &[u8]) -> anyhow::Result<GrantRequest> {
        let _tag = buf.try_get_u32()?;
        Ok(GrantRequest {
            peer_id: buf.try_get_u32()?,
            src_id: buf.try_get_u32()?,
            dst_id: buf.try_get_u32()?,
            slot: buf.try_get_u8()?,
            unit_to_unit: buf.try_get_u8()? != 0,
        })
    }
}

/// Everything a protocol instance hands over to the layer above it: traffic admission and
///  delivery, and notifications about the connection lifecycle. It is injected when the instance
///  is created.
///
/// The defaults are closed for admission: an instance with a handler that does not
///  override [FneHandler::validate] drops all non-terminator traffic. No peer is ignored by
///  default, for any traffic family.
#[async_trait]
pub trait FneHandler: Send + Sync + 'static {
    /// acceptance check for a stream (ACLs, talkgroup activation). Terminator frames bypass it.
    async fn validate(&self, _frame: &TrafficFrame<'_>) -> bool {
        false
    }

    /// traffic from ignored peers is accounted for by the protocol layer, but not delivered
    async fn peer_ignored(&self, _frame: &TrafficFrame<'_>) -> bool {
        false
    }

    async fn on_traffic(&self, _frame: &TrafficFrame<'_>) {}

    /// master role: a peer completed the config exchange
    async fn on_peer_connected(&self, _peer_id: u32, _details: &PeerDetails) {}

    /// master role: a running peer closed its connection or timed out
    async fn on_peer_disconnected(&self, _peer_id: u32) {}

    /// peer role: the connection to the master is established
    async fn on_master_connected(&self) {}

    /// peer role: the master closed the connection, NAKed us or stopped answering pings
    async fn on_master_disconnected(&self) {}

    /// peer role: a list pushed by the master
    async fn on_master_command(&self, _command: MasterCommand, _ids: &[u32]) {}

    /// master role
    async fn on_grant_request(&self, _request: &GrantRequest) {}

    /// master role: activity or diagnostic log text transferred by a peer
    async fn on_transfer(&self, _peer_id: u32, _kind: TransferSubFunction, _text: &str) {}

    /// master role: a peer announced a unit's (un-)affiliation with a talkgroup
    async fn on_affiliation(&self, _peer_id: u32, _src_id: u32, _dst_id: u32, _affiliated: bool) {}
}
