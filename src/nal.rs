//! H.264 Annex-B NAL unit scanning, narrowly for Stream Access Point classification.
//!
//! This does not parse slice headers, SPS, or PPS — it only finds the first NAL unit
//! after a start code and reads its `nal_unit_type` field, following the scanning idiom
//! of the H.264 module in the example pack's codec crate.

use num_derive::{FromPrimitive, ToPrimitive};

/// The Stream Access Point type inferred from a video access unit's leading NAL unit,
/// numbered to match a `sidx` reference's `sap_type` field (ISO/IEC 14496-12 8.16.3.3).
#[derive(Debug, Copy, Clone, Eq, PartialEq, FromPrimitive, ToPrimitive)]
pub enum SapType {
    /// The access unit's leading NAL unit was neither an IDR nor a non-IDR slice.
    Unknown = 0,
    /// NAL type 5 (IDR slice): a closed, fully decodable random access point.
    Type1 = 1,
    /// NAL type 1 (non-IDR slice): an open random access point.
    Type2 = 2,
}

const NAL_TYPE_NON_IDR_SLICE: u8 = 1;
const NAL_TYPE_IDR_SLICE: u8 = 5;

fn find_next_start_code(bytes: &[u8], from: usize) -> Option<usize> {
    let mut i = from;
    while i + 3 <= bytes.len() {
        if bytes[i] == 0 && bytes[i + 1] == 0 && bytes[i + 2] == 1 {
            return Some(i);
        }
        i += 1;
    }
    None
}

/// Classifies the first slice NAL unit found in `bytes`, an Annex-B access unit.
///
/// Returns [`SapType::Unknown`] if no start code is found or the first NAL unit found is
/// neither an IDR nor non-IDR slice (parameter sets, SEI, AUDs, etc. are skipped over).
pub fn classify_au(bytes: &[u8]) -> SapType {
    let mut pos = 0;
    while let Some(start) = find_next_start_code(bytes, pos) {
        let nal_header_pos = start + 3;
        if nal_header_pos >= bytes.len() {
            break;
        }
        let nal_unit_type = bytes[nal_header_pos] & 0x1F;
        match nal_unit_type {
            NAL_TYPE_IDR_SLICE => return SapType::Type1,
            NAL_TYPE_NON_IDR_SLICE => return SapType::Type2,
            _ => {}
        }
        pos = nal_header_pos + 1;
    }
    SapType::Unknown
}
