use anyhow::bail;

use crate::routing::link_control::{LinkControl, LinkControlCodec, PrivacyLc, EMBEDDED_LC_FRAGMENTS, EMBEDDED_LC_FRAGMENT_LENGTH, FLCO_GROUP, FULL_LC_LENGTH};
use crate::util::buf::{get_u24, get_u32, set_u24, set_u32};

/// A link control 'codec' without FEC: the full LC starts with the destination id followed by
///  the source id, the rest is filled with the data type. Since the first 98 bits of a burst
///  are spliced unchanged, tests can read the destination id from the first three burst bytes.
///  A PI header likewise starts with the destination id, followed by algorithm, key and MI.
pub struct FakeLinkControlCodec;

impl LinkControlCodec for FakeLinkControlCodec {
    fn encode_full(&self, lc: &LinkControl, data_type: u8) -> anyhow::Result<[u8; FULL_LC_LENGTH]> {
        let mut result = [data_type; FULL_LC_LENGTH];
        set_u24(&mut result, 0, lc.dst_id);
        set_u24(&mut result, 3, lc.src_id);
        result[6] = lc.service_options;
        Ok(result)
    }

    fn encode_embedded(&self, lc: &LinkControl) -> anyhow::Result<[[u8; EMBEDDED_LC_FRAGMENT_LENGTH]; EMBEDDED_LC_FRAGMENTS]> {
        let dst = lc.dst_id.to_be_bytes();
        Ok([dst; EMBEDDED_LC_FRAGMENTS])
    }

    fn decode_full(&self, burst: &[u8], _data_type: u8) -> anyhow::Result<LinkControl> {
        if burst.len() < 33 {
            bail!("burst too short: {} bytes", burst.len());
        }
        Ok(LinkControl {
            flco: FLCO_GROUP,
            feature_id: 0,
            service_options: burst[6],
            dst_id: get_u24(burst, 0),
            src_id: get_u24(burst, 3),
        })
    }

    fn encode_pi_header(&self, lc: &PrivacyLc) -> anyhow::Result<[u8; FULL_LC_LENGTH]> {
        let mut result = [0u8; FULL_LC_LENGTH];
        set_u24(&mut result, 0, lc.dst_id);
        result[3] = lc.algorithm_id;
        result[4] = lc.key_id;
        set_u32(&mut result, 5, lc.mi);
        result[9] = lc.group as u8;
        Ok(result)
    }

    fn decode_pi_header(&self, burst: &[u8]) -> anyhow::Result<PrivacyLc> {
        if burst.len() < 33 {
            bail!("burst too short: {} bytes", burst.len());
        }
        Ok(PrivacyLc {
            group: burst[9] != 0,
            algorithm_id: burst[3],
            key_id: burst[4],
            mi: get_u32(burst, 5),
            dst_id: get_u24(burst, 0),
        })
    }
}
