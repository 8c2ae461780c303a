use std::sync::Arc;

use bytes::BytesMut;

use crate::fne::opcodes::TrafficFamily;
use crate::fne::traffic::{DmrFrameType, FrameKind, TrafficFrame, DMR_BURST_LENGTH, DMR_FLAG_SLOT_2, DMR_OFFSET_BURST, DMR_OFFSET_FLAGS, OFFSET_DST_ID};
use crate::routing::link_control::{splice_embedded_lc, splice_full_lc, LinkControl, LinkControlCodec, PrivacyLc, RewrittenLc, RewrittenPrivacyLc, FLCO_GROUP, FLCO_PRIVATE};
use crate::util::buf::set_u24;

/// Produces the copy of a frame that is sent to a target: destination id and slot are replaced,
///  and DMR link control and PI headers are regenerated for the new destination.
pub struct FrameRewriter {
    codec: Arc<dyn LinkControlCodec>,
}

impl FrameRewriter {
    pub fn new(codec: Arc<dyn LinkControlCodec>) -> FrameRewriter {
        FrameRewriter {
            codec,
        }
    }

    pub fn codec(&self) -> &dyn LinkControlCodec {
        self.codec.as_ref()
    }

    /// Encodes link control for `frame` routed to `dst_id`. Service options and feature id are
    ///  taken from the link control received with the call, if any.
    pub fn regenerate_lc(&self, frame: &TrafficFrame<'_>, received: Option<&LinkControl>, dst_id: u32) -> anyhow::Result<RewrittenLc> {
        let mut lc = received.copied().unwrap_or_default();
        lc.flco = if frame.is_group_call() { FLCO_GROUP } else { FLCO_PRIVATE };
        lc.src_id = frame.src_id();
        lc.dst_id = dst_id;
        RewrittenLc::encode(self.codec.as_ref(), lc)
    }

    /// Encodes the PI header of an encrypted call routed to `dst_id`
    pub fn regenerate_pi_lc(&self, received: &PrivacyLc, dst_id: u32) -> anyhow::Result<RewrittenPrivacyLc> {
        RewrittenPrivacyLc::encode(self.codec.as_ref(), PrivacyLc { dst_id, ..*received })
    }

    /// Bursts are only touched where regenerated link control is available, otherwise they keep
    ///  what they were received with.
    pub fn rewrite(&self, frame: &TrafficFrame<'_>, dst_id: u32, slot: u8, lc: Option<&RewrittenLc>, pi_lc: Option<&RewrittenPrivacyLc>) -> BytesMut {
        let mut buf = BytesMut::from(frame.payload);
        set_u24(&mut buf, OFFSET_DST_ID, dst_id);

        if frame.family != TrafficFamily::Dmr {
            return buf;
        }

        if slot == 2 {
            buf[DMR_OFFSET_FLAGS] |= DMR_FLAG_SLOT_2;
        }
        else {
            buf[DMR_OFFSET_FLAGS] &= !DMR_FLAG_SLOT_2;
        }

        let burst = &mut buf[DMR_OFFSET_BURST..DMR_OFFSET_BURST + DMR_BURST_LENGTH];
        match (frame.kind(), lc, pi_lc) {
            (FrameKind::VoiceHeader, Some(lc), _) => splice_full_lc(burst, &lc.header),
            (FrameKind::Terminator, Some(lc), _) => splice_full_lc(burst, &lc.terminator),
            (FrameKind::PrivacyHeader, _, Some(pi_lc)) => splice_full_lc(burst, &pi_lc.header),
            (FrameKind::Voice, Some(lc), _) if frame.dmr_frame_type() == Some(DmrFrameType::Voice) => {
                // bursts B to E carry embedded LC, F carries the RC / null fragment
                let vseq = frame.dmr_dtype_vseq() as usize;
                if (1..=4).contains(&vseq) {
                    splice_embedded_lc(burst, &lc.embedded[vseq - 1]);
                }
            }
            _ => {}
        }
        buf
    }
}
