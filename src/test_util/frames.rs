use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use bytes::BytesMut;

use crate::fne::auth::auth_hash;
use crate::fne::frame::{FneFrame, RtpHeader};
use crate::fne::master::{control_payload, FneMaster};
use crate::fne::opcodes::{Function, Tag, TrafficFamily, SUB_FUNCTION_NONE};
use crate::fne::peer_details::PeerDetails;
use crate::fne::traffic::*;
use crate::test_util::transport::TrackingTransport;
use crate::util::buf::{set_u24, set_u32};

/// convenience for unit tests: the same number always gives the same address, different numbers
///  give different addresses
pub fn test_addr(number: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, number))
}

/// a control frame with a `tag ‖ peer id ‖ fields` payload
pub fn control_frame(function: Function, peer_id: u32, tag: Tag, fields: &[u8]) -> BytesMut {
    control_frame_raw(function, SUB_FUNCTION_NONE, peer_id, &control_payload(tag, peer_id, fields))
}

pub fn control_frame_raw(function: Function, sub_function: u8, peer_id: u32, payload: &[u8]) -> BytesMut {
    let rtp = RtpHeader::new(function.rtp_payload_type(), 0, 0, 0);
    FneFrame::encode(&rtp, function.into(), sub_function, 0, peer_id, payload)
}

pub fn config_frame(peer_id: u32, details: &PeerDetails) -> BytesMut {
    control_frame_raw(Function::Config, SUB_FUNCTION_NONE, peer_id, &details.to_rptc_payload(peer_id).unwrap())
}

pub fn traffic_frame(family: TrafficFamily, peer_id: u32, stream_id: u32, sequence: u16, payload: &[u8]) -> BytesMut {
    let rtp = RtpHeader::new(Function::Protocol.rtp_payload_type(), sequence, 0, stream_id);
    FneFrame::encode(&rtp, Function::Protocol.into(), family.into(), stream_id, peer_id, payload)
}

pub fn dmr_frame(peer_id: u32, stream_id: u32, sequence: u16, payload: &[u8]) -> BytesMut {
    traffic_frame(TrafficFamily::Dmr, peer_id, stream_id, sequence, payload)
}

pub fn dmr_payload(src_id: u32, dst_id: u32, slot: u8, frame_type: DmrFrameType, dtype_vseq: u8, stream_id: u32) -> Vec<u8> {
    let mut payload = vec![0u8; DMR_FRAME_LENGTH];
    payload[..4].copy_from_slice(&Tag::DMR_DATA.0);
    set_u24(&mut payload, OFFSET_SRC_ID, src_id);
    set_u24(&mut payload, OFFSET_DST_ID, dst_id);

    let mut flags = (u8::from(frame_type) << 4) | (dtype_vseq & 0x0F);
    if slot == 2 {
        flags |= DMR_FLAG_SLOT_2;
    }
    payload[DMR_OFFSET_FLAGS] = flags;
    set_u32(&mut payload, DMR_OFFSET_STREAM_ID, stream_id);

    // a recognizable burst pattern so that tests can tell which bits were rewritten
    for (i, b) in payload[DMR_OFFSET_BURST..DMR_OFFSET_BURST + DMR_BURST_LENGTH].iter_mut().enumerate() {
        *b = 0xA5 ^ i as u8;
    }
    payload
}

pub fn dmr_header_payload(src_id: u32, dst_id: u32, slot: u8, stream_id: u32) -> Vec<u8> {
    dmr_payload(src_id, dst_id, slot, DmrFrameType::DataSync, DMR_DT_VOICE_LC_HEADER, stream_id)
}

pub fn dmr_pi_header_payload(src_id: u32, dst_id: u32, slot: u8, stream_id: u32) -> Vec<u8> {
    dmr_payload(src_id, dst_id, slot, DmrFrameType::DataSync, DMR_DT_PI_HEADER, stream_id)
}

pub fn dmr_voice_payload(src_id: u32, dst_id: u32, slot: u8, stream_id: u32) -> Vec<u8> {
    dmr_payload(src_id, dst_id, slot, DmrFrameType::VoiceSync, 0, stream_id)
}

pub fn dmr_terminator_payload(src_id: u32, dst_id: u32, slot: u8, stream_id: u32) -> Vec<u8> {
    dmr_payload(src_id, dst_id, slot, DmrFrameType::DataSync, DMR_DT_TERMINATOR_WITH_LC, stream_id)
}

pub fn p25_payload(src_id: u32, dst_id: u32, duid: u8) -> Vec<u8> {
    let mut payload = vec![0u8; P25_MIN_LENGTH];
    payload[..4].copy_from_slice(&Tag::P25_DATA.0);
    set_u24(&mut payload, OFFSET_SRC_ID, src_id);
    set_u24(&mut payload, OFFSET_DST_ID, dst_id);
    payload[P25_OFFSET_DUID] = duid;
    payload
}

pub fn nxdn_payload(src_id: u32, dst_id: u32, message_type: u8) -> Vec<u8> {
    let mut payload = vec![0u8; NXDN_MIN_LENGTH];
    payload[..4].copy_from_slice(&Tag::NXDN_DATA.0);
    payload[NXDN_OFFSET_MESSAGE_TYPE] = message_type;
    set_u24(&mut payload, OFFSET_SRC_ID, src_id);
    set_u24(&mut payload, OFFSET_DST_ID, dst_id);
    payload
}

/// Drives a peer through login, authentication and config on `master`, discarding the frames
///  the master sends in the process
pub async fn connect_peer(master: &FneMaster, transport: &TrackingTransport, peer_id: u32, addr: SocketAddr, passphrase: &str) {
    master.on_datagram(&control_frame(Function::Login, peer_id, Tag::LOGIN, &[]), addr).await;
    let salt = transport.take_one().await.salt();
    master.on_datagram(&control_frame(Function::Auth, peer_id, Tag::AUTH, &auth_hash(salt, passphrase)), addr).await;
    master.on_datagram(&config_frame(peer_id, &PeerDetails::default()), addr).await;
    transport.take_all().await;
}
