#[cfg(test)] use mockall::automock;

use crate::fne::traffic::{DMR_DT_TERMINATOR_WITH_LC, DMR_DT_VOICE_LC_HEADER};
use crate::util::buf::copy_bits;

/// full link control, BPTC(196,96) encoded
pub const FULL_LC_LENGTH: usize = 25;
/// embedded link control fragments, one per voice burst B to E
pub const EMBEDDED_LC_FRAGMENTS: usize = 4;
pub const EMBEDDED_LC_FRAGMENT_LENGTH: usize = 4;

/// the first half of the full LC, before the sync / slot type pattern in the middle of the burst
const FULL_LC_FIRST_HALF: (usize, usize) = (0, 98);
const FULL_LC_SECOND_HALF: (usize, usize) = (166, 98);
const EMBEDDED_LC_BITS: (usize, usize) = (116, 32);

/// FLCO for group voice and unit to unit voice
pub const FLCO_GROUP: u8 = 0x00;
pub const FLCO_PRIVATE: u8 = 0x03;

/// The DMR link control fields a forwarded call needs to carry
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct LinkControl {
    pub flco: u8,
    pub feature_id: u8,
    pub service_options: u8,
    pub dst_id: u32,
    pub src_id: u32,
}

impl LinkControl {
    pub fn group(src_id: u32, dst_id: u32) -> LinkControl {
        LinkControl {
            flco: FLCO_GROUP,
            src_id,
            dst_id,
            ..Default::default()
        }
    }
}

/// Contents of a DMR privacy indicator (PI) header. It names the destination, so it has to be
///  regenerated like the link control when a call changes talkgroup.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct PrivacyLc {
    pub group: bool,
    pub algorithm_id: u8,
    pub key_id: u8,
    /// message indicator, the initialisation vector of the current superframe
    pub mi: u32,
    pub dst_id: u32,
}

/// The forward error correction for link control is an external library. This is the contract
///  the router needs from it: encoding the full LC for voice headers and terminators, encoding
///  the embedded LC fragments for voice bursts, decoding the full LC of a received header, and
///  the same for privacy indicator headers.
#[cfg_attr(test, automock)]
pub trait LinkControlCodec: Send + Sync + 'static {
    /// `data_type` is the burst's data type, which selects the CRC mask
    fn encode_full(&self, lc: &LinkControl, data_type: u8) -> anyhow::Result<[u8; FULL_LC_LENGTH]>;

    fn encode_embedded(&self, lc: &LinkControl) -> anyhow::Result<[[u8; EMBEDDED_LC_FRAGMENT_LENGTH]; EMBEDDED_LC_FRAGMENTS]>;

    /// decodes the full LC from a 33 byte burst
    fn decode_full(&self, burst: &[u8], data_type: u8) -> anyhow::Result<LinkControl>;

    /// encodes a PI header with the same BPTC(196,96) layout as the full LC
    fn encode_pi_header(&self, lc: &PrivacyLc) -> anyhow::Result<[u8; FULL_LC_LENGTH]>;

    fn decode_pi_header(&self, burst: &[u8]) -> anyhow::Result<PrivacyLc>;
}

/// Link control regenerated for a target, cached per transmitted stream
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RewrittenLc {
    pub lc: LinkControl,
    pub header: [u8; FULL_LC_LENGTH],
    pub terminator: [u8; FULL_LC_LENGTH],
    pub embedded: [[u8; EMBEDDED_LC_FRAGMENT_LENGTH]; EMBEDDED_LC_FRAGMENTS],
}

impl RewrittenLc {
    pub fn encode(codec: &dyn LinkControlCodec, lc: LinkControl) -> anyhow::Result<RewrittenLc> {
        Ok(RewrittenLc {
            lc,
            header: codec.encode_full(&lc, DMR_DT_VOICE_LC_HEADER)?,
            terminator: codec.encode_full(&lc, DMR_DT_TERMINATOR_WITH_LC)?,
            embedded: codec.encode_embedded(&lc)?,
        })
    }
}

/// A PI header regenerated for a target, cached per transmitted stream
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RewrittenPrivacyLc {
    pub lc: PrivacyLc,
    pub header: [u8; FULL_LC_LENGTH],
}

impl RewrittenPrivacyLc {
    pub fn encode(codec: &dyn LinkControlCodec, lc: PrivacyLc) -> anyhow::Result<RewrittenPrivacyLc> {
        Ok(RewrittenPrivacyLc {
            lc,
            header: codec.encode_pi_header(&lc)?,
        })
    }
}

/// Replaces the full LC bits of a 33 byte DMR burst, leaving the sync and slot type bits alone
pub fn splice_full_lc(burst: &mut [u8], encoded: &[u8; FULL_LC_LENGTH]) {
    copy_bits(encoded, 0, burst, FULL_LC_FIRST_HALF.0, FULL_LC_FIRST_HALF.1);
    copy_bits(encoded, FULL_LC_FIRST_HALF.1, burst, FULL_LC_SECOND_HALF.0, FULL_LC_SECOND_HALF.1);
}

pub fn splice_embedded_lc(burst: &mut [u8], fragment: &[u8; EMBEDDED_LC_FRAGMENT_LENGTH]) {
    copy_bits(fragment, 0, burst, EMBEDDED_LC_BITS.0, EMBEDDED_LC_BITS.1);
}
