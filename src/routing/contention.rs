use std::fmt::{Display, Formatter};
use std::time::Duration;

use tokio::time::Instant;

use crate::routing::slot_status::{is_within, SlotStatus};

/// A frame about to be routed to a target slot, with the talkgroup it will carry there
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RouteCandidate {
    pub tgid: u32,
    pub src_id: u32,
    pub stream_id: u32,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RejectReason {
    /// the target slot is held by another talkgroup it received
    RxHangtime { tgid: u32 },
    /// the target slot is held by another talkgroup we routed to it
    TxHangtime { tgid: u32 },
    /// another source is mid-call on another talkgroup
    RxCollision { tgid: u32, src_id: u32 },
    TxCollision { tgid: u32, src_id: u32 },
    /// another source's stream is being routed to the same talkgroup
    CrossTalk { src_id: u32 },
}

impl Display for RejectReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::RxHangtime { tgid } => write!(f, "slot in hangtime for received TG {}", tgid),
            RejectReason::TxHangtime { tgid } => write!(f, "slot in hangtime for transmitted TG {}", tgid),
            RejectReason::RxCollision { tgid, src_id } => write!(f, "call in progress from {} on received TG {}", src_id, tgid),
            RejectReason::TxCollision { tgid, src_id } => write!(f, "call in progress from {} on transmitted TG {}", src_id, tgid),
            RejectReason::CrossTalk { src_id } => write!(f, "stream from {} is being routed to the same TG", src_id),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Decision {
    /// `new_stream` is set when the target's transmit bookkeeping changes, i.e. link control
    ///  needs to be regenerated
    Forward { new_stream: bool },
    Reject(RejectReason),
}

/// Decides whether a frame may be routed to a target slot. Evaluation never touches the slot;
///  only a forward decision is applied to it afterwards.
#[derive(Debug, Clone)]
pub struct ContentionResolver {
    stream_timeout: Duration,
}

impl ContentionResolver {
    pub fn new(stream_timeout: Duration) -> ContentionResolver {
        ContentionResolver {
            stream_timeout,
        }
    }

    pub fn evaluate(&self, target: &SlotStatus, candidate: &RouteCandidate, hangtime: Duration, now: Instant) -> Decision {
        let rx_other_tg = target.rx_tgid != candidate.tgid;
        let tx_other_tg = target.tx_tgid != candidate.tgid;

        if rx_other_tg && is_within(target.rx_time, now, hangtime) {
            return Decision::Reject(RejectReason::RxHangtime { tgid: target.rx_tgid });
        }
        if tx_other_tg && is_within(target.tx_time, now, hangtime) {
            return Decision::Reject(RejectReason::TxHangtime { tgid: target.tx_tgid });
        }

        if rx_other_tg && candidate.src_id != target.rx_src_id && is_within(target.rx_time, now, self.stream_timeout) {
            return Decision::Reject(RejectReason::RxCollision { tgid: target.rx_tgid, src_id: target.rx_src_id });
        }
        if tx_other_tg && candidate.src_id != target.tx_src_id && is_within(target.tx_time, now, self.stream_timeout) {
            return Decision::Reject(RejectReason::TxCollision { tgid: target.tx_tgid, src_id: target.tx_src_id });
        }

        if !tx_other_tg
            && candidate.src_id != target.tx_src_id
            && candidate.stream_id != target.tx_stream_id
            && is_within(target.tx_time, now, self.stream_timeout)
        {
            return Decision::Reject(RejectReason::CrossTalk { src_id: target.tx_src_id });
        }

        Decision::Forward {
            new_stream: candidate.stream_id != target.tx_stream_id
                || candidate.tgid != target.tx_tgid
                || candidate.src_id != target.tx_src_id,
        }
    }

    /// Records a forwarded frame in the target's transmit bookkeeping. A new stream clears the
    ///  cached link control. A rejection leaves the slot untouched.
    pub fn apply(&self, target: &mut SlotStatus, candidate: &RouteCandidate, decision: Decision, now: Instant) {
        let Decision::Forward { new_stream } = decision else {
            return;
        };

        if new_stream {
            target.tx_tgid = candidate.tgid;
            target.tx_src_id = candidate.src_id;
            target.tx_stream_id = candidate.stream_id;
            target.tx_start = Some(now);
            target.tx_lc = None;
            target.tx_pi_lc = None;
        }
        target.tx_time = Some(now);
    }
}
