use std::fmt::{Debug, Formatter};

use anyhow::{anyhow, bail};
use bytes::BytesMut;
use crc::{Crc, CRC_16_IBM_3740};
use tokio::time::Instant;

use crate::fne::opcodes::{Function, RTP_PAYLOAD_TYPE_CONTROL, RTP_PAYLOAD_TYPE_TRAFFIC};

pub const RTP_VERSION: u8 = 2;
pub const RTP_HEADER_LENGTH: usize = 12;
pub const FNE_HEADER_LENGTH: usize = 20;
pub const FRAME_HEADER_LENGTH: usize = RTP_HEADER_LENGTH + FNE_HEADER_LENGTH;

/// Marks the RTP extension as an FNE header
pub const FNE_FRAME_START: u16 = 0xFE;
/// length of the FNE header's fields in 32-bit words, excluding the 4 byte sub-header
pub const FNE_HEADER_WORDS: u16 = 4;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// CRC-16 (CCITT polynomial, initial value 0xFFFF) over the FNE payload
pub fn crc16(payload: &[u8]) -> u16 {
    CRC16.checksum(payload)
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct RtpHeader {
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    /// the stream id
    pub ssrc: u32,
}

impl RtpHeader {
    pub fn new(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32) -> RtpHeader {
        RtpHeader {
            padding: false,
            extension: true,
            csrc_count: 0,
            marker: false,
            payload_type,
            sequence,
            timestamp,
            ssrc,
        }
    }

    pub fn ser(&self, buf: &mut [u8]) {
        buf[0] = (RTP_VERSION << 6)
            | if self.padding { 0x20 } else { 0 }
            | if self.extension { 0x10 } else { 0 }
            | (self.csrc_count & 0x0F);
        buf[1] = if self.marker { 0x80 } else { 0 } | (self.payload_type & 0x7F);
        buf[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
    }

    pub fn deser(buf: &[u8]) -> anyhow::Result<RtpHeader> {
        if buf.len() < RTP_HEADER_LENGTH {
            bail!("buffer too short for an RTP header: {} bytes", buf.len());
        }

        let version = buf[0] >> 6;
        if version != RTP_VERSION {
            bail!("invalid RTP version {}", version);
        }

        let header = RtpHeader {
            padding: buf[0] & 0x20 != 0,
            extension: buf[0] & 0x10 != 0,
            csrc_count: buf[0] & 0x0F,
            marker: buf[1] & 0x80 != 0,
            payload_type: buf[1] & 0x7F,
            sequence: u16::from_be_bytes([buf[2], buf[3]]),
            timestamp: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            ssrc: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        };

        if !header.extension {
            bail!("RTP header without extension");
        }
        if header.payload_type != RTP_PAYLOAD_TYPE_TRAFFIC && header.payload_type != RTP_PAYLOAD_TYPE_CONTROL {
            bail!("unsupported RTP payload type 0x{:02X}", header.payload_type);
        }
        Ok(header)
    }
}

/// The FNE extension header, following the RTP header
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct FneHeader {
    pub crc: u16,
    pub function: u8,
    pub sub_function: u8,
    pub stream_id: u32,
    pub peer_id: u32,
    pub message_length: u32,
}

impl FneHeader {
    pub fn ser(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&FNE_FRAME_START.to_be_bytes());
        buf[2..4].copy_from_slice(&FNE_HEADER_WORDS.to_be_bytes());
        buf[4..6].copy_from_slice(&self.crc.to_be_bytes());
        buf[6] = self.function;
        buf[7] = self.sub_function;
        buf[8..12].copy_from_slice(&self.stream_id.to_be_bytes());
        buf[12..16].copy_from_slice(&self.peer_id.to_be_bytes());
        buf[16..20].copy_from_slice(&self.message_length.to_be_bytes());
    }

    pub fn deser(buf: &[u8]) -> anyhow::Result<FneHeader> {
        if buf.len() < FNE_HEADER_LENGTH {
            bail!("buffer too short for an FNE header: {} bytes", buf.len());
        }

        let payload_type = u16::from_be_bytes([buf[0], buf[1]]);
        if payload_type != FNE_FRAME_START {
            bail!("invalid FNE header payload type 0x{:04X}", payload_type);
        }
        let words = u16::from_be_bytes([buf[2], buf[3]]);
        if words != FNE_HEADER_WORDS {
            bail!("invalid FNE header length {}", words);
        }

        Ok(FneHeader {
            crc: u16::from_be_bytes([buf[4], buf[5]]),
            function: buf[6],
            sub_function: buf[7],
            stream_id: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            peer_id: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            message_length: u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]),
        })
    }
}

/// A decoded datagram. The payload borrows from the receive buffer.
#[derive(Clone, Eq, PartialEq)]
pub struct FneFrame<'a> {
    pub rtp: RtpHeader,
    pub fne: FneHeader,
    pub payload: &'a [u8],
}

impl Debug for FneFrame<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "FneFrame{{func:0x{:02X}/0x{:02X}, peer:{}, stream:{}, seq:{}, len:{}}}",
               self.fne.function, self.fne.sub_function, self.fne.peer_id, self.fne.stream_id, self.rtp.sequence, self.payload.len())
    }
}

impl<'a> FneFrame<'a> {
    pub fn decode(buf: &'a [u8]) -> anyhow::Result<FneFrame<'a>> {
        if buf.len() < FRAME_HEADER_LENGTH {
            bail!("frame too short: {} bytes", buf.len());
        }

        let rtp = RtpHeader::deser(&buf[..RTP_HEADER_LENGTH])?;
        let fne = FneHeader::deser(&buf[RTP_HEADER_LENGTH..FRAME_HEADER_LENGTH])?;

        let message_length = usize::try_from(fne.message_length)?;
        let payload = buf[FRAME_HEADER_LENGTH..].get(..message_length)
            .ok_or_else(|| anyhow!("truncated payload: header declares {} bytes, {} available", message_length, buf.len() - FRAME_HEADER_LENGTH))?;

        let actual_crc = crc16(payload);
        if actual_crc != fne.crc {
            bail!("CRC mismatch: expected 0x{:04X}, was 0x{:04X}", fne.crc, actual_crc);
        }

        Ok(FneFrame {
            rtp,
            fne,
            payload,
        })
    }

    pub fn function(&self) -> Option<Function> {
        Function::try_from(self.fne.function).ok()
    }

    /// Writes a complete datagram for the given header fields and payload. The CRC and message
    ///  length are derived from the payload.
    pub fn encode(rtp: &RtpHeader, function: u8, sub_function: u8, stream_id: u32, peer_id: u32, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::zeroed(FRAME_HEADER_LENGTH + payload.len());

        rtp.ser(&mut buf[..RTP_HEADER_LENGTH]);
        FneHeader {
            crc: crc16(payload),
            function,
            sub_function,
            stream_id,
            peer_id,
            message_length: payload.len() as u32,
        }.ser(&mut buf[RTP_HEADER_LENGTH..FRAME_HEADER_LENGTH]);
        buf[FRAME_HEADER_LENGTH..].copy_from_slice(payload);

        buf
    }
}

/// Generates RTP timestamps and sequence numbers for outbound frames towards one destination.
///
/// Timestamps run on an 8kHz clock relative to the sequencer's creation. Sequence numbers are
///  per stream, restarting at 0 whenever the stream id changes; control frames (stream id 0) have
///  a separate counter so that interleaved pings don't disturb a running stream's sequence.
#[derive(Clone, Debug)]
pub struct OutboundSequencer {
    start: Instant,
    stream_id: u32,
    stream_sequence: u16,
    control_sequence: u16,
}

impl OutboundSequencer {
    pub fn new() -> OutboundSequencer {
        OutboundSequencer {
            start: Instant::now(),
            stream_id: 0,
            stream_sequence: 0,
            control_sequence: 0,
        }
    }

    pub fn timestamp(&self) -> u32 {
        let micros = self.start.elapsed().as_micros();
        ((micros * 8 / 1000) & 0xFFFF_FFFF) as u32
    }

    pub fn next_sequence(&mut self, stream_id: u32) -> u16 {
        if stream_id == 0 {
            let result = self.control_sequence;
            self.control_sequence = self.control_sequence.wrapping_add(1);
            return result;
        }

        if stream_id != self.stream_id {
            self.stream_id = stream_id;
            self.stream_sequence = 0;
        }
        let result = self.stream_sequence;
        self.stream_sequence = self.stream_sequence.wrapping_add(1);
        result
    }

    pub fn encode(&mut self, function: Function, sub_function: u8, stream_id: u32, peer_id: u32, payload: &[u8]) -> BytesMut {
        let rtp = RtpHeader::new(
            function.rtp_payload_type(),
            self.next_sequence(stream_id),
            self.timestamp(),
            stream_id,
        );
        FneFrame::encode(&rtp, function.into(), sub_function, stream_id, peer_id, payload)
    }
}
