use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::fne::handler::{FneHandler, GrantRequest};
use crate::fne::opcodes::{MasterCommand, TrafficFamily, TransferSubFunction};
use crate::fne::peer_details::PeerDetails;
use crate::fne::traffic::TrafficFrame;

#[derive(Debug, Clone, PartialEq)]
pub enum HandlerEvent {
    /// family, peer id, stream id, source id, destination id
    Traffic(TrafficFamily, u32, u32, u32, u32),
    PeerConnected(u32, PeerDetails),
    PeerDisconnected(u32),
    MasterConnected,
    MasterDisconnected,
    MasterCommand(MasterCommand, Vec<u32>),
    GrantRequest(GrantRequest),
    Transfer(u32, TransferSubFunction, String),
    Affiliation(u32, u32, u32, bool),
}

/// An [FneHandler] with fixed admission answers that records all callbacks
pub struct TrackingHandler {
    validate_result: bool,
    ignore_result: bool,
    events: RwLock<Vec<HandlerEvent>>,
}

impl TrackingHandler {
    fn new(validate_result: bool, ignore_result: bool) -> TrackingHandler {
        TrackingHandler {
            validate_result,
            ignore_result,
            events: Default::default(),
        }
    }

    pub fn accepting() -> TrackingHandler {
        Self::new(true, false)
    }

    pub fn rejecting() -> TrackingHandler {
        Self::new(false, false)
    }

    /// accepts all traffic, but ignores every peer
    pub fn ignoring() -> TrackingHandler {
        Self::new(true, true)
    }

    /// returns recorded events, clearing the internal buffer
    pub async fn take_events(&self) -> Vec<HandlerEvent> {
        let mut lock = self.events.write().await;
        std::mem::take(&mut *lock)
    }

    async fn record(&self, event: HandlerEvent) {
        self.events.write().await.push(event);
    }
}

#[async_trait]
impl FneHandler for TrackingHandler {
    async fn validate(&self, _frame: &TrafficFrame<'_>) -> bool {
        self.validate_result
    }

    async fn peer_ignored(&self, _frame: &TrafficFrame<'_>) -> bool {
        self.ignore_result
    }

    async fn on_traffic(&self, frame: &TrafficFrame<'_>) {
        self.record(HandlerEvent::Traffic(frame.family, frame.peer_id, frame.stream_id, frame.src_id(), frame.dst_id())).await;
    }

    async fn on_peer_connected(&self, peer_id: u32, details: &PeerDetails) {
        self.record(HandlerEvent::PeerConnected(peer_id, details.clone())).await;
    }

    async fn on_peer_disconnected(&self, peer_id: u32) {
        self.record(HandlerEvent::PeerDisconnected(peer_id)).await;
    }

    async fn on_master_connected(&self) {
        self.record(HandlerEvent::MasterConnected).await;
    }

    async fn on_master_disconnected(&self) {
        self.record(HandlerEvent::MasterDisconnected).await;
    }

    async fn on_master_command(&self, command: MasterCommand, ids: &[u32]) {
        self.record(HandlerEvent::MasterCommand(command, ids.to_vec())).await;
    }

    async fn on_grant_request(&self, request: &GrantRequest) {
        self.record(HandlerEvent::GrantRequest(*request)).await;
    }

    async fn on_transfer(&self, peer_id: u32, kind: TransferSubFunction, text: &str) {
        self.record(HandlerEvent::Transfer(peer_id, kind, text.to_string())).await;
    }

    async fn on_affiliation(&self, peer_id: u32, src_id: u32, dst_id: u32, affiliated: bool) {
        self.record(HandlerEvent::Affiliation(peer_id, src_id, dst_id, affiliated)).await;
    }
}
