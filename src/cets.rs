//! Common Encryption (CETS) ECM box parsing.
//!
//! Not wired into any profile's conformance verdict — DASH's MPEG-2 TS profiles make no
//! statement about CETS presence. Kept as a standalone, directly testable parser,
//! mirroring the relationship [`crate::nal::classify_au`] has to the segment validator.
//! The bit layout follows `original_source/tslib/cets_ecm.c`'s `cets_ecm_read`,
//! including its byte-misalignment after `num_states`/`next_key_id_flag`/reserved.

use crate::error::{ErrorDetails, Result};
use crate::reader::Reader;

/// One access unit's encryption metadata within a [`CetsEcmState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CetsEcmAu {
    pub key_id: Option<[u8; 16]>,
    pub byte_offset: Vec<u8>,
    pub initialization_vector: Vec<u8>,
}

/// One scrambling-control state's list of access units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CetsEcmState {
    pub transport_scrambling_control: u8,
    pub au: Vec<CetsEcmAu>,
}

/// A decoded CETS ECM (Entitlement Control Message).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CetsEcm {
    pub iv_size: u8,
    pub default_key_id: [u8; 16],
    pub states: Vec<CetsEcmState>,
    pub next_key_id: Option<(u8, [u8; 16])>,
}

fn read_bytes(reader: &mut Reader, count: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(reader.read_bits(8)? as u8);
    }
    Ok(out)
}

fn read_fixed_16(reader: &mut Reader) -> Result<[u8; 16]> {
    let mut out = [0_u8; 16];
    for b in out.iter_mut() {
        *b = reader.read_bits(8)? as u8;
    }
    Ok(out)
}

/// Parses one CETS ECM from `data`, a pure function over the raw ECM bytes.
pub fn parse(data: &[u8]) -> Result<CetsEcm> {
    if data.is_empty() {
        return Err(Reader::new(data).error_here(ErrorDetails::UnexpectedEof));
    }
    let mut reader = Reader::new(data);

    let num_states = reader.read_bits(2)?;
    let next_key_id_flag = reader.read_bit()?;
    reader.skip_bits(3)?; // reserved

    let iv_size = reader.read_bits(8)? as u8;
    let default_key_id = read_fixed_16(&mut reader)?;

    let mut states = Vec::with_capacity(num_states as usize);
    for _ in 0..num_states {
        let transport_scrambling_control = reader.read_bits(2)? as u8;
        let num_au = reader.read_bits(6)?;
        let mut au_list = Vec::with_capacity(num_au as usize);
        for _ in 0..num_au {
            let key_id_flag = reader.read_bit()?;
            reader.skip_bits(3)?; // reserved
            let byte_offset_size = reader.read_bits(4)? as usize;
            let key_id = if key_id_flag {
                Some(read_fixed_16(&mut reader)?)
            } else {
                None
            };
            let byte_offset = read_bytes(&mut reader, byte_offset_size)?;
            let initialization_vector = read_bytes(&mut reader, iv_size as usize)?;
            au_list.push(CetsEcmAu {
                key_id,
                byte_offset,
                initialization_vector,
            });
        }
        states.push(CetsEcmState {
            transport_scrambling_control,
            au: au_list,
        });
    }

    let next_key_id = if next_key_id_flag {
        let countdown_sec = reader.read_bits(4)? as u8;
        reader.skip_bits(4)?; // reserved
        let next_key_id = read_fixed_16(&mut reader)?;
        Some((countdown_sec, next_key_id))
    } else {
        None
    };

    Ok(CetsEcm {
        iv_size,
        default_key_id,
        states,
        next_key_id,
    })
}
