use std::time::Duration;

use tokio::sync::broadcast;
use tracing::trace;

use crate::fne::opcodes::TrafficFamily;
use crate::routing::contention::RejectReason;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CallEvent {
    CallStart(CallStartData),
    CallEnd(CallEndData),
    /// a second source keyed up on a slot with an active call; its frames are dropped
    Collision(CollisionData),
    /// a frame was not forwarded to one destination because of slot contention
    RouteRejected(RouteRejectedData),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CallStartData {
    pub system: String,
    pub family: TrafficFamily,
    pub slot: u8,
    pub src_id: u32,
    pub tgid: u32,
    pub stream_id: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CallEndData {
    pub system: String,
    pub family: TrafficFamily,
    pub slot: u8,
    pub src_id: u32,
    pub tgid: u32,
    pub stream_id: u32,
    pub duration: Duration,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CollisionData {
    pub system: String,
    pub family: TrafficFamily,
    pub slot: u8,
    pub src_id: u32,
    pub active_src_id: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RouteRejectedData {
    pub source: String,
    pub target: String,
    pub tgid: u32,
    pub slot: u8,
    pub reason: RejectReason,
}

pub struct CallEventNotifier {
    sender: broadcast::Sender<CallEvent>,
}
impl CallEventNotifier {
    pub fn new() -> CallEventNotifier {
        let (sender, _) = broadcast::channel(128);

        CallEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: CallEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}
