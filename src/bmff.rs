//! ISO BMFF box parsing for the boxes a DASH segment index cares about: `styp`, `sidx`,
//! `ssix`, `pcrb`, and `emsg`.
//!
//! The box-by-box structure (read a 32-bit size/type, promote to a 64-bit `largesize`
//! when `size == 1`, dispatch on type, skip unknown types with a warning) follows
//! `original_source/tslib/isobmff.c`'s `parse_box`; the per-box field layouts follow its
//! `parse_styp`/`parse_sidx`/`parse_pcrb`/`parse_ssix`/`parse_emsg`. Reads are bounds
//! checked the way the rest of this crate's parsers are, via [`crate::reader::Reader`].

use crate::error::{ErrorDetails, Result};
use crate::reader::Reader;
use log::warn;

const BOX_TYPE_STYP: u32 = 0x73747970; // "styp"
const BOX_TYPE_SIDX: u32 = 0x73696478; // "sidx"
const BOX_TYPE_SSIX: u32 = 0x73736978; // "ssix"
const BOX_TYPE_PCRB: u32 = 0x70637262; // "pcrb"
const BOX_TYPE_EMSG: u32 = 0x656D7367; // "emsg"

/// Segment type box: brands declared for a DASH segment (§3.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Styp {
    pub major_brand: u32,
    pub minor_version: u32,
    pub compatible_brands: Vec<u32>,
}

/// One reference entry within a `sidx` box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SidxReference {
    /// `false` for a media reference, `true` for a reference to another `sidx`.
    pub reference_type: bool,
    pub referenced_size: u32,
    pub subsegment_duration: u32,
    pub starts_with_sap: bool,
    pub sap_type: u8,
    pub sap_delta_time: u32,
}

/// Segment index box: maps a representation into a list of byte-addressable subsegments.
#[derive(Debug, Clone, PartialEq)]
pub struct Sidx {
    pub version: u8,
    pub reference_id: u32,
    pub timescale: u32,
    pub earliest_presentation_time: u64,
    /// Widened to 64 bits per the REDESIGN FLAG in `spec.md` §9 (the original's 32-bit
    /// `version == 0` cursor cannot address segments beyond 4 GiB).
    pub first_offset: u64,
    pub references: Vec<SidxReference>,
}

/// One subsegment's byte-range partition, inside an `ssix` box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsixSubsegment {
    pub ranges: Vec<(u8, u32)>,
}

/// Subsegment index box: a finer byte-range partition layered over a `sidx`'s subsegments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ssix {
    pub subsegments: Vec<SsixSubsegment>,
}

/// Producer reference time box: per-subsegment 42-bit PCR snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pcrb {
    pub pcr: Vec<u64>,
}

/// DASH event message box, carried on PID 0x0004 inside a PES payload (§4.10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Emsg {
    pub version: u8,
    pub scheme_id_uri: String,
    pub value: String,
    pub timescale: u32,
    pub presentation_time_delta: u32,
    pub event_duration: u32,
    pub id: u32,
    pub message_data: Vec<u8>,
}

/// The decoded contents of one top-level box this crate understands.
#[derive(Debug, Clone, PartialEq)]
pub enum BoxData {
    Styp(Styp),
    Sidx(Sidx),
    Ssix(Ssix),
    Pcrb(Pcrb),
    Emsg(Emsg),
    /// A box type outside this crate's vocabulary; its bytes were skipped.
    Unknown(u32),
}

/// One parsed box: its declared total size (header + body) and decoded contents.
#[derive(Debug, Clone, PartialEq)]
pub struct BmffBox {
    pub size: u64,
    pub data: BoxData,
}

fn read_full_box_header(reader: &mut Reader) -> Result<(u8, u32)> {
    if reader.bytes_left() < 4 {
        return Err(reader.error_here(ErrorDetails::UnexpectedEof));
    }
    let version = reader.read_u8()?;
    let flags = reader.read_u24()?;
    Ok((version, flags))
}

fn parse_styp(reader: &mut Reader) -> Result<Styp> {
    let major_brand = reader.read_u32()?;
    let minor_version = reader.read_u32()?;
    let mut compatible_brands = Vec::with_capacity(reader.bytes_left() / 4);
    while reader.bytes_left() >= 4 {
        compatible_brands.push(reader.read_u32()?);
    }
    Ok(Styp {
        major_brand,
        minor_version,
        compatible_brands,
    })
}

fn parse_sidx(reader: &mut Reader) -> Result<Sidx> {
    let (version, _flags) = read_full_box_header(reader)?;
    let reference_id = reader.read_u32()?;
    let timescale = reader.read_u32()?;
    let (earliest_presentation_time, first_offset) = if version == 0 {
        (reader.read_u32()? as u64, reader.read_u32()? as u64)
    } else {
        (reader.read_u64()?, reader.read_u64()?)
    };
    let _reserved = reader.read_u16()?;
    let reference_count = reader.read_u16()?;
    let mut references = Vec::with_capacity(reference_count as usize);
    for _ in 0..reference_count {
        let word0 = reader.read_u32()?;
        let subsegment_duration = reader.read_u32()?;
        let word1 = reader.read_u32()?;
        references.push(SidxReference {
            reference_type: (word0 >> 31) != 0,
            referenced_size: word0 & 0x7FFF_FFFF,
            subsegment_duration,
            starts_with_sap: (word1 >> 31) != 0,
            sap_type: ((word1 >> 28) & 0x7) as u8,
            sap_delta_time: word1 & 0x0FFF_FFFF,
        });
    }
    Ok(Sidx {
        version,
        reference_id,
        timescale,
        earliest_presentation_time,
        first_offset,
        references,
    })
}

fn parse_pcrb(reader: &mut Reader) -> Result<Pcrb> {
    let subsegment_count = reader.read_u32()?;
    let expected_48bit_size = subsegment_count as usize * 6;
    let remaining = reader.bytes_left();
    if remaining != expected_48bit_size {
        // A known encoder bug (GPAC#34) writes 64-bit entries instead of 48-bit ones;
        // surface a more specific diagnostic for that case, otherwise a bare size error.
        let expected_64bit_size = subsegment_count as usize * 8;
        if remaining == expected_64bit_size {
            warn!(
                "pcrb box has {} subsegments and {} remaining bytes: matches a known encoder bug that writes 64-bit entries instead of 48-bit (see GPAC#34)",
                subsegment_count, remaining
            );
        }
        return Err(reader.error_here(ErrorDetails::BadBoxSize));
    }
    let mut pcr = Vec::with_capacity(subsegment_count as usize);
    for _ in 0..subsegment_count {
        let bytes = reader.read_array_ref::<6>()?;
        let packed = (u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64) << 16
            | ((bytes[4] as u64) << 8)
            | bytes[5] as u64;
        pcr.push(packed >> 6);
    }
    Ok(Pcrb { pcr })
}

fn parse_ssix(reader: &mut Reader) -> Result<Ssix> {
    read_full_box_header(reader)?;
    let subsegment_count = reader.read_u32()?;
    let mut subsegments = Vec::with_capacity(subsegment_count as usize);
    for _ in 0..subsegment_count {
        let ranges_count = reader.read_u32()?;
        let mut ranges = Vec::with_capacity(ranges_count as usize);
        for _ in 0..ranges_count {
            let level = reader.read_u8()?;
            let range_size = reader.read_u24()?;
            ranges.push((level, range_size));
        }
        subsegments.push(SsixSubsegment { ranges });
    }
    Ok(Ssix { subsegments })
}

fn read_nul_terminated_string(reader: &mut Reader) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        let b = reader.read_u8()?;
        if b == 0 {
            break;
        }
        bytes.push(b);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn parse_emsg(reader: &mut Reader) -> Result<Emsg> {
    let (version, _flags) = read_full_box_header(reader)?;
    let scheme_id_uri = read_nul_terminated_string(reader)?;
    let value = read_nul_terminated_string(reader)?;
    let timescale = reader.read_u32()?;
    let presentation_time_delta = reader.read_u32()?;
    let event_duration = reader.read_u32()?;
    let id = reader.read_u32()?;
    let message_data = reader.read_to_end()?.to_vec();
    Ok(Emsg {
        version,
        scheme_id_uri,
        value,
        timescale,
        presentation_time_delta,
        event_duration,
        id,
        message_data,
    })
}

/// Reads one box from `reader`, returning `None` at end of input (mirrors `parse_box`
/// returning a null box when the stream is exhausted).
pub fn parse_box(reader: &mut Reader) -> Result<Option<BmffBox>> {
    if reader.eof() {
        return Ok(None);
    }
    if reader.bytes_left() < 8 {
        return Err(reader.error_here(ErrorDetails::UnexpectedEof));
    }
    let mut size = reader.read_u32()? as u64;
    let box_type = reader.read_u32()?;
    if size == 1 {
        if reader.bytes_left() < 8 {
            return Err(reader.error_here(ErrorDetails::UnexpectedEof));
        }
        size = reader.read_u64()?;
    }

    let inner_size = size
        .checked_sub(8)
        .ok_or_else(|| reader.error_here(ErrorDetails::BadBoxSize))? as usize;
    if inner_size > reader.bytes_left() {
        return Err(reader.error_here(ErrorDetails::BadBoxSize));
    }
    let mut body = reader.new_sub_reader(inner_size)?;

    let data = match box_type {
        BOX_TYPE_STYP => BoxData::Styp(parse_styp(&mut body)?),
        BOX_TYPE_SIDX => BoxData::Sidx(parse_sidx(&mut body)?),
        BOX_TYPE_SSIX => BoxData::Ssix(parse_ssix(&mut body)?),
        BOX_TYPE_PCRB => BoxData::Pcrb(parse_pcrb(&mut body)?),
        BOX_TYPE_EMSG => BoxData::Emsg(parse_emsg(&mut body)?),
        other => {
            warn!("unknown box type: {:08x}", other);
            BoxData::Unknown(other)
        }
    };

    if !body.eof() {
        return Err(reader.error_here(ErrorDetails::BadBoxSize));
    }

    Ok(Some(BmffBox { size, data }))
}

/// Parses every box in `reader` until end of input.
pub fn parse_boxes(reader: &mut Reader) -> Result<Vec<BmffBox>> {
    let mut out = Vec::new();
    while let Some(b) = parse_box(reader)? {
        out.push(b);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn styp_decodes_brands() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&20u32.to_be_bytes());
        bytes.extend_from_slice(b"styp");
        bytes.extend_from_slice(b"msdh");
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes.extend_from_slice(b"msix");
        let mut reader = Reader::new(&bytes);
        let b = parse_box(&mut reader).unwrap().unwrap();
        match b.data {
            BoxData::Styp(styp) => {
                assert_eq!(styp.major_brand, u32::from_be_bytes(*b"msdh"));
                assert_eq!(styp.compatible_brands, vec![u32::from_be_bytes(*b"msix")]);
            }
            _ => panic!("expected styp"),
        }
    }

    #[test]
    fn sidx_decodes_one_reference() {
        let mut bytes = Vec::new();
        let body_len = 4 + 4 + 4 + 4 + 4 + 2 + 2 + 12;
        bytes.extend_from_slice(&((8 + body_len) as u32).to_be_bytes());
        bytes.extend_from_slice(b"sidx");
        bytes.extend_from_slice(&[0, 0, 0, 0]); // version/flags
        bytes.extend_from_slice(&1u32.to_be_bytes()); // reference_id
        bytes.extend_from_slice(&90000u32.to_be_bytes()); // timescale
        bytes.extend_from_slice(&0u32.to_be_bytes()); // earliest_presentation_time
        bytes.extend_from_slice(&100u32.to_be_bytes()); // first_offset
        bytes.extend_from_slice(&0u16.to_be_bytes()); // reserved
        bytes.extend_from_slice(&1u16.to_be_bytes()); // reference_count
        bytes.extend_from_slice(&((1u32 << 31) | 1000u32).to_be_bytes());
        bytes.extend_from_slice(&180000u32.to_be_bytes());
        bytes.extend_from_slice(&((1u32 << 31) | (1u32 << 28) | 0).to_be_bytes());
        let mut reader = Reader::new(&bytes);
        let b = parse_box(&mut reader).unwrap().unwrap();
        match b.data {
            BoxData::Sidx(sidx) => {
                assert_eq!(sidx.reference_id, 1);
                assert_eq!(sidx.first_offset, 100);
                let r = &sidx.references[0];
                assert!(r.reference_type);
                assert_eq!(r.referenced_size, 1000);
                assert!(r.starts_with_sap);
                assert_eq!(r.sap_type, 1);
            }
            _ => panic!("expected sidx"),
        }
    }

    #[test]
    fn pcrb_rejects_64_bit_entries_with_encoder_bug_hint() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&((8 + 4 + 8) as u32).to_be_bytes());
        bytes.extend_from_slice(b"pcrb");
        bytes.extend_from_slice(&1u32.to_be_bytes()); // subsegment_count = 1
        bytes.extend_from_slice(&[0_u8; 8]); // 64-bit entry instead of 48-bit
        let mut reader = Reader::new(&bytes);
        assert!(parse_box(&mut reader).unwrap_err().details.to_string().contains("size"));
    }

    #[test]
    fn emsg_decodes_strings_and_payload() {
        let mut bytes = Vec::new();
        let mut body = Vec::new();
        body.extend_from_slice(&[0, 0, 0, 0]);
        body.extend_from_slice(b"urn:example\0");
        body.extend_from_slice(b"1\0");
        body.extend_from_slice(&1000u32.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes());
        body.extend_from_slice(&500u32.to_be_bytes());
        body.extend_from_slice(&42u32.to_be_bytes());
        body.extend_from_slice(&[0xAA, 0xBB]);
        bytes.extend_from_slice(&((8 + body.len()) as u32).to_be_bytes());
        bytes.extend_from_slice(b"emsg");
        bytes.extend_from_slice(&body);
        let mut reader = Reader::new(&bytes);
        let b = parse_box(&mut reader).unwrap().unwrap();
        match b.data {
            BoxData::Emsg(emsg) => {
                assert_eq!(emsg.scheme_id_uri, "urn:example");
                assert_eq!(emsg.value, "1");
                assert_eq!(emsg.event_duration, 500);
                assert_eq!(emsg.message_data, vec![0xAA, 0xBB]);
            }
            _ => panic!("expected emsg"),
        }
    }

    #[test]
    fn unknown_box_type_is_skipped() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&12u32.to_be_bytes());
        bytes.extend_from_slice(b"mdat");
        bytes.extend_from_slice(&[1, 2, 3, 4]);
        let mut reader = Reader::new(&bytes);
        let b = parse_box(&mut reader).unwrap().unwrap();
        assert!(matches!(b.data, BoxData::Unknown(t) if t == u32::from_be_bytes(*b"mdat")));
    }
}
