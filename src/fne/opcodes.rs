use std::fmt::{Debug, Formatter};

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// RTP payload type for voice / data traffic frames
pub const RTP_PAYLOAD_TYPE_TRAFFIC: u8 = 0x56;
/// RTP payload type for everything that is not traffic (login, ping, commands, ...)
pub const RTP_PAYLOAD_TYPE_CONTROL: u8 = 0x5D;

/// The 'function' byte of the FNE extension header
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum Function {
    Protocol = 0x00,
    MasterCommand = 0x01,
    Login = 0x60,
    Auth = 0x61,
    Config = 0x62,
    RepeaterClosing = 0x70,
    MasterClosing = 0x71,
    Ping = 0x74,
    Pong = 0x75,
    GrantRequest = 0x7A,
    Ack = 0x7E,
    Nak = 0x7F,
    Transfer = 0x90,
    Announce = 0x91,
}

impl Function {
    pub fn rtp_payload_type(&self) -> u8 {
        match self {
            Function::Protocol => RTP_PAYLOAD_TYPE_TRAFFIC,
            _ => RTP_PAYLOAD_TYPE_CONTROL,
        }
    }
}

/// sub-functions of [Function::Protocol], i.e. the digital radio protocol a traffic frame carries
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum TrafficFamily {
    Dmr = 0x00,
    P25 = 0x01,
    Nxdn = 0x02,
}

/// sub-functions of [Function::MasterCommand]
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum MasterCommand {
    WhitelistRids = 0x00,
    BlacklistRids = 0x01,
    ActiveTgids = 0x02,
    DeactiveTgids = 0x03,
}

/// sub-functions of [Function::Transfer]
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum TransferSubFunction {
    ActivityLog = 0x01,
    DiagnosticLog = 0x02,
}

/// sub-functions of [Function::Announce]
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum AnnounceSubFunction {
    GroupAffiliation = 0x00,
    GroupUnaffiliation = 0x03,
}

pub const SUB_FUNCTION_NONE: u8 = 0x00;

/// Every control payload and every traffic payload starts with a four character ASCII tag.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Tag(pub [u8; 4]);

impl Tag {
    pub const DMR_DATA: Tag = Tag(*b"DMRD");
    pub const P25_DATA: Tag = Tag(*b"P25D");
    pub const NXDN_DATA: Tag = Tag(*b"NXDD");
    pub const LOGIN: Tag = Tag(*b"RPTL");
    pub const AUTH: Tag = Tag(*b"RPTK");
    pub const CONFIG: Tag = Tag(*b"RPTC");
    pub const PING: Tag = Tag(*b"RPTP");
    pub const GRANT_REQUEST: Tag = Tag(*b"RPTG");
    pub const TRANSFER: Tag = Tag(*b"TRNS");
    pub const REPEATER_CLOSING: Tag = Tag(*b"RPTX");
    pub const MASTER_CLOSING: Tag = Tag(*b"MSTC");
    pub const PONG: Tag = Tag(*b"MSTP");
    pub const ACK: Tag = Tag(*b"RPTA");
    pub const NAK: Tag = Tag(*b"MSTN");

    pub fn of(payload: &[u8]) -> Option<Tag> {
        payload.get(..4)
            .map(|t| Tag([t[0], t[1], t[2], t[3]]))
    }
}

impl Debug for Tag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::protocol(0x00, Some(Function::Protocol))]
    #[case::login(0x60, Some(Function::Login))]
    #[case::ack(0x7E, Some(Function::Ack))]
    #[case::nak(0x7F, Some(Function::Nak))]
    #[case::transfer(0x90, Some(Function::Transfer))]
    #[case::unknown(0x55, None)]
    fn test_function_from_byte(#[case] raw: u8, #[case] expected: Option<Function>) {
        assert_eq!(Function::try_from(raw).ok(), expected);
    }

    #[rstest]
    #[case::dmr(b"DMRD\x01\x02", Some(Tag::DMR_DATA))]
    #[case::login(b"RPTL\0\0\0\x01", Some(Tag::LOGIN))]
    #[case::too_short(b"RPT", None)]
    fn test_tag_of(#[case] payload: &[u8], #[case] expected: Option<Tag>) {
        assert_eq!(Tag::of(payload), expected);
    }

    #[test]
    fn test_tag_debug() {
        assert_eq!(format!("{:?}", Tag::PONG), "\"MSTP\"");
    }
}
