use std::fmt::{Debug, Formatter};

use anyhow::bail;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::fne::opcodes::{Tag, TrafficFamily};
use crate::util::buf::{get_u24, get_u32};

pub const OFFSET_SRC_ID: usize = 5;
pub const OFFSET_DST_ID: usize = 8;

pub const DMR_FRAME_LENGTH: usize = 55;
pub const DMR_OFFSET_SEQ: usize = 4;
pub const DMR_OFFSET_PEER_ID: usize = 11;
pub const DMR_OFFSET_FLAGS: usize = 15;
pub const DMR_OFFSET_STREAM_ID: usize = 16;
pub const DMR_OFFSET_BURST: usize = 20;
pub const DMR_BURST_LENGTH: usize = 33;

pub const DMR_FLAG_SLOT_2: u8 = 0x80;
pub const DMR_FLAG_PRIVATE_CALL: u8 = 0x40;

/// data types in a DMR data sync burst
pub const DMR_DT_PI_HEADER: u8 = 0x00;
pub const DMR_DT_VOICE_LC_HEADER: u8 = 0x01;
pub const DMR_DT_TERMINATOR_WITH_LC: u8 = 0x02;

pub const P25_MIN_LENGTH: usize = 24;
pub const P25_OFFSET_LCO: usize = 4;
pub const P25_OFFSET_DUID: usize = 22;
pub const P25_DUID_HDU: u8 = 0x00;
pub const P25_DUID_TDU: u8 = 0x03;
pub const P25_DUID_LDU1: u8 = 0x05;
pub const P25_DUID_LDU2: u8 = 0x0A;
pub const P25_DUID_TDULC: u8 = 0x0F;
/// LCO for private (unit to unit) voice
pub const P25_LCO_PRIVATE: u8 = 0x03;

pub const NXDN_MIN_LENGTH: usize = 24;
pub const NXDN_OFFSET_MESSAGE_TYPE: usize = 4;
pub const NXDN_OFFSET_GROUP_FLAGS: usize = 15;
pub const NXDN_MESSAGE_TYPE_VCALL: u8 = 0x01;
pub const NXDN_MESSAGE_TYPE_TX_REL: u8 = 0x08;
pub const NXDN_FLAG_PRIVATE_CALL: u8 = 0x40;

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum DmrFrameType {
    Voice = 0,
    VoiceSync = 1,
    DataSync = 2,
}

/// What the routing layer cares about in the last frame observed on a slot
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FrameKind {
    VoiceHeader,
    /// DMR privacy indicator header, following the voice header of an encrypted call
    PrivacyHeader,
    Voice,
    Terminator,
    Data,
}

/// A traffic frame as received in the payload of an FNE protocol message. The payload starts with
///  the family's tag; the fields all families share (source and destination id) are at the same
///  offsets.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct TrafficFrame<'a> {
    pub family: TrafficFamily,
    pub peer_id: u32,
    pub stream_id: u32,
    pub sequence: u16,
    pub payload: &'a [u8],
}

impl Debug for TrafficFrame<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}{{peer:{}, stream:{}, src:{}, dst:{}, slot:{}}}",
               self.family, self.peer_id, self.stream_id, self.src_id(), self.dst_id(), self.slot())
    }
}

impl<'a> TrafficFrame<'a> {
    pub fn new(family: TrafficFamily, peer_id: u32, stream_id: u32, sequence: u16, payload: &'a [u8]) -> anyhow::Result<TrafficFrame<'a>> {
        let (expected_tag, min_length) = match family {
            TrafficFamily::Dmr => (Tag::DMR_DATA, DMR_FRAME_LENGTH),
            TrafficFamily::P25 => (Tag::P25_DATA, P25_MIN_LENGTH),
            TrafficFamily::Nxdn => (Tag::NXDN_DATA, NXDN_MIN_LENGTH),
        };

        if payload.len() < min_length {
            bail!("{:?} frame too short: {} bytes", family, payload.len());
        }
        if Tag::of(payload) != Some(expected_tag) {
            bail!("{:?} frame with tag {:?}", family, Tag::of(payload));
        }

        Ok(TrafficFrame {
            family,
            peer_id,
            stream_id,
            sequence,
            payload,
        })
    }

    pub fn src_id(&self) -> u32 {
        get_u24(self.payload, OFFSET_SRC_ID)
    }

    pub fn dst_id(&self) -> u32 {
        get_u24(self.payload, OFFSET_DST_ID)
    }

    /// DMR timeslot (1 or 2); P25 and NXDN have a single fixed pseudo-slot 1
    pub fn slot(&self) -> u8 {
        match self.family {
            TrafficFamily::Dmr if self.payload[DMR_OFFSET_FLAGS] & DMR_FLAG_SLOT_2 != 0 => 2,
            _ => 1,
        }
    }

    pub fn is_group_call(&self) -> bool {
        match self.family {
            TrafficFamily::Dmr => self.payload[DMR_OFFSET_FLAGS] & DMR_FLAG_PRIVATE_CALL == 0,
            TrafficFamily::P25 => self.payload[P25_OFFSET_LCO] != P25_LCO_PRIVATE,
            TrafficFamily::Nxdn => self.payload[NXDN_OFFSET_GROUP_FLAGS] & NXDN_FLAG_PRIVATE_CALL == 0,
        }
    }

    /// The family-specific 'end of transmission' indicator
    pub fn is_terminator(&self) -> bool {
        self.kind() == FrameKind::Terminator
    }

    pub fn kind(&self) -> FrameKind {
        match self.family {
            TrafficFamily::Dmr => match self.dmr_frame_type() {
                Some(DmrFrameType::DataSync) => match self.dmr_dtype_vseq() {
                    DMR_DT_VOICE_LC_HEADER => FrameKind::VoiceHeader,
                    DMR_DT_PI_HEADER => FrameKind::PrivacyHeader,
                    DMR_DT_TERMINATOR_WITH_LC => FrameKind::Terminator,
                    _ => FrameKind::Data,
                },
                Some(DmrFrameType::Voice) | Some(DmrFrameType::VoiceSync) => FrameKind::Voice,
                None => FrameKind::Data,
            },
            TrafficFamily::P25 => match self.payload[P25_OFFSET_DUID] {
                P25_DUID_HDU => FrameKind::VoiceHeader,
                P25_DUID_LDU1 | P25_DUID_LDU2 => FrameKind::Voice,
                P25_DUID_TDU | P25_DUID_TDULC => FrameKind::Terminator,
                _ => FrameKind::Data,
            },
            TrafficFamily::Nxdn => match self.payload[NXDN_OFFSET_MESSAGE_TYPE] {
                NXDN_MESSAGE_TYPE_VCALL => FrameKind::Voice,
                NXDN_MESSAGE_TYPE_TX_REL => FrameKind::Terminator,
                _ => FrameKind::Data,
            },
        }
    }

    pub fn dmr_frame_type(&self) -> Option<DmrFrameType> {
        DmrFrameType::try_from((self.payload[DMR_OFFSET_FLAGS] >> 4) & 0x03).ok()
    }

    /// data type for data sync bursts, voice sequence (0 = burst A .. 5 = burst F) for voice
    pub fn dmr_dtype_vseq(&self) -> u8 {
        self.payload[DMR_OFFSET_FLAGS] & 0x0F
    }

    pub fn dmr_stream_id(&self) -> u32 {
        get_u32(self.payload, DMR_OFFSET_STREAM_ID)
    }

    pub fn dmr_burst(&self) -> &'a [u8] {
        &self.payload[DMR_OFFSET_BURST..DMR_OFFSET_BURST + DMR_BURST_LENGTH]
    }
}
