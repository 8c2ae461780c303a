use std::time::Duration;

use tokio::time::Instant;

use crate::fne::opcodes::TrafficFamily;
use crate::fne::traffic::{FrameKind, TrafficFrame};
use crate::routing::link_control::{LinkControl, PrivacyLc, RewrittenLc, RewrittenPrivacyLc};

/// Call state of one timeslot of one system. The receive side tracks traffic the system sends
///  us, the transmit side tracks traffic we route to the system.
#[derive(Debug, Clone)]
pub struct SlotStatus {
    pub rx_src_id: u32,
    pub rx_tgid: u32,
    pub rx_stream_id: u32,
    pub rx_start: Option<Instant>,
    pub rx_time: Option<Instant>,
    pub rx_kind: FrameKind,
    /// decoded from the voice header of the current call
    pub rx_lc: Option<LinkControl>,
    /// decoded from the PI header of the current call, if it is encrypted
    pub rx_pi_lc: Option<PrivacyLc>,

    pub tx_src_id: u32,
    pub tx_tgid: u32,
    pub tx_stream_id: u32,
    pub tx_start: Option<Instant>,
    pub tx_time: Option<Instant>,
    pub tx_lc: Option<RewrittenLc>,
    pub tx_pi_lc: Option<RewrittenPrivacyLc>,
}

impl Default for SlotStatus {
    fn default() -> Self {
        SlotStatus {
            rx_src_id: 0,
            rx_tgid: 0,
            rx_stream_id: 0,
            rx_start: None,
            rx_time: None,
            rx_kind: FrameKind::Terminator,
            rx_lc: None,
            rx_pi_lc: None,
            tx_src_id: 0,
            tx_tgid: 0,
            tx_stream_id: 0,
            tx_start: None,
            tx_time: None,
            tx_lc: None,
            tx_pi_lc: None,
        }
    }
}

/// `true` if `t` lies less than `window` before `now`
pub fn is_within(t: Option<Instant>, now: Instant, window: Duration) -> bool {
    t.map(|t| now.saturating_duration_since(t) < window)
        .unwrap_or(false)
}

/// How a received frame relates to the call on its slot
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReceiveOutcome {
    /// first frame of a new stream
    CallStart,
    Continuation,
    /// a different source keyed up while another call was still active
    Collision { active_src_id: u32 },
    CallEnd { duration: Duration },
    /// a terminator for a call that is already closed, or for another stream
    StaleTerminator,
}

impl ReceiveOutcome {
    pub fn is_forwarded(&self) -> bool {
        matches!(self, ReceiveOutcome::CallStart | ReceiveOutcome::Continuation | ReceiveOutcome::CallEnd { .. })
    }
}

impl SlotStatus {
    pub fn is_rx_active(&self) -> bool {
        self.rx_kind != FrameKind::Terminator
    }

    /// Updates the receive side for a frame from this slot's system. Another source keying up
    ///  less than `stream_timeout` after the active call's last frame is a collision.
    pub fn on_receive(&mut self, frame: &TrafficFrame<'_>, now: Instant, stream_timeout: Duration) -> ReceiveOutcome {
        if frame.is_terminator() {
            if !self.is_rx_active() || frame.stream_id != self.rx_stream_id {
                return ReceiveOutcome::StaleTerminator;
            }

            self.rx_kind = FrameKind::Terminator;
            self.rx_time = Some(now);
            let duration = self.rx_start
                .map(|start| now.saturating_duration_since(start))
                .unwrap_or_default();
            return ReceiveOutcome::CallEnd { duration };
        }

        if frame.stream_id != self.rx_stream_id {
            if self.is_rx_active() && frame.src_id() != self.rx_src_id && is_within(self.rx_time, now, stream_timeout) {
                return ReceiveOutcome::Collision { active_src_id: self.rx_src_id };
            }

            self.rx_src_id = frame.src_id();
            self.rx_tgid = frame.dst_id();
            self.rx_stream_id = frame.stream_id;
            self.rx_start = Some(now);
            self.rx_time = Some(now);
            self.rx_kind = frame.kind();
            self.rx_lc = None;
            self.rx_pi_lc = None;
            return ReceiveOutcome::CallStart;
        }

        self.rx_time = Some(now);
        self.rx_kind = frame.kind();
        ReceiveOutcome::Continuation
    }
}

/// Slot states of one system: two DMR timeslots, and one fixed pseudo-slot each for P25 and NXDN
#[derive(Debug, Clone, Default)]
pub struct SystemStatus {
    pub dmr: [SlotStatus; 2],
    pub p25: SlotStatus,
    pub nxdn: SlotStatus,
}

impl SystemStatus {
    /// `slot` is only relevant for DMR
    pub fn slot(&self, family: TrafficFamily, slot: u8) -> &SlotStatus {
        match family {
            TrafficFamily::Dmr => &self.dmr[dmr_slot_index(slot)],
            TrafficFamily::P25 => &self.p25,
            TrafficFamily::Nxdn => &self.nxdn,
        }
    }

    pub fn slot_mut(&mut self, family: TrafficFamily, slot: u8) -> &mut SlotStatus {
        match family {
            TrafficFamily::Dmr => &mut self.dmr[dmr_slot_index(slot)],
            TrafficFamily::P25 => &mut self.p25,
            TrafficFamily::Nxdn => &mut self.nxdn,
        }
    }
}

fn dmr_slot_index(slot: u8) -> usize {
    if slot == 2 { 1 } else { 0 }
}
