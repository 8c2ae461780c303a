use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::fne::opcodes::Tag;

/// Offset of the JSON document in an RPTC payload (after tag and peer id)
pub const PEER_DETAILS_OFFSET: usize = 8;

pub const OUT_OF_DATE_IDENTITY: &str = "OUT OF DATE PEER";
pub const OUT_OF_DATE_SOFTWARE: &str = "OUT_OF_DATE";

/// The metadata a peer declares about itself during the config phase. Everything is optional
///  on the wire; missing fields deserialize to their defaults.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PeerDetails {
    pub identity: String,
    pub rx_frequency: u32,
    pub tx_frequency: u32,
    pub info: SiteInfo,
    pub channel: ChannelInfo,
    pub rcon: RemoteControl,
    pub software: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SiteInfo {
    pub latitude: f64,
    pub longitude: f64,
    pub height: i32,
    pub location: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelInfo {
    pub tx_power: u32,
    pub tx_offset_mhz: f32,
    pub ch_bandwidth_khz: f32,
    pub channel_id: u8,
    pub channel_no: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteControl {
    pub password: String,
    pub port: u16,
}

impl PeerDetails {
    /// stands in for the details of a peer whose config document could not be parsed
    pub fn out_of_date() -> PeerDetails {
        PeerDetails {
            identity: OUT_OF_DATE_IDENTITY.to_string(),
            software: OUT_OF_DATE_SOFTWARE.to_string(),
            ..Default::default()
        }
    }

    pub fn is_out_of_date(&self) -> bool {
        self.identity == OUT_OF_DATE_IDENTITY && self.software == OUT_OF_DATE_SOFTWARE
    }

    pub fn to_rptc_payload(&self, peer_id: u32) -> anyhow::Result<BytesMut> {
        let json = serde_json::to_vec(self)?;

        let mut buf = BytesMut::with_capacity(PEER_DETAILS_OFFSET + json.len());
        buf.put_slice(&Tag::CONFIG.0);
        buf.put_u32(peer_id);
        buf.put_slice(&json);
        Ok(buf)
    }

    pub fn from_rptc_payload(payload: &[u8]) -> anyhow::Result<PeerDetails> {
        let json = payload.get(PEER_DETAILS_OFFSET..)
            .ok_or_else(|| anyhow::anyhow!("RPTC payload too short: {} bytes", payload.len()))?;
        Ok(serde_json::from_slice(json)?)
    }
}
