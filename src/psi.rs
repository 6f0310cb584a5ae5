//! PSI (PAT/CAT/PMT) section parsing with CRC-32/MPEG-2 verification.
//!
//! Bitfield layouts and the descriptor-walking idiom are adapted from the teacher
//! crate's `psi.rs`; CRC handling follows its use of `crc::Crc<u32>` over
//! `CRC_32_MPEG_2`.

use crate::error::{ErrorDetails, Result};
use crate::reader::Reader;
use crc::{Crc, CRC_32_MPEG_2};
use modular_bitfield_msb::prelude::*;
use smallvec::SmallVec;

const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// Computes the MPEG-2 CRC-32 (polynomial 0x04C11DB7, init 0xFFFFFFFF, no reflection, no
/// final XOR) over `bytes`, matching the §8 `crc32_mpeg2` invariant.
pub fn crc32_mpeg2(bytes: &[u8]) -> u32 {
    CRC.checksum(bytes)
}

/// Common three-byte PSI section header.
#[bitfield]
#[derive(Debug, Copy, Clone)]
pub struct PsiHeader {
    pub table_id: B8,
    pub section_syntax_indicator: bool,
    pub private_bit: bool,
    pub reserved_bits: B2,
    pub section_length: B12,
}

/// The five-byte table-syntax extension present whenever `section_length > 0`.
#[bitfield]
#[derive(Debug, Copy, Clone)]
pub struct PsiTableSyntax {
    pub table_id_extension: B16,
    pub reserved_bits: B2,
    pub version: B5,
    pub current_next_indicator: bool,
    pub section_num: B8,
    pub last_section_num: B8,
}

/// One PAT entry: a program number mapped to its PMT PID (or, for program 0, the NIT PID).
#[bitfield]
#[derive(Debug, Copy, Clone)]
pub struct PatEntry {
    pub program_num: B16,
    pub reserved: B3,
    pub program_map_pid: B13,
}

/// A generic descriptor, walked in a nested byte budget per §4.5.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// Descriptor tag (e.g. 9 = CA descriptor, 5 = registration, 10 = language).
    pub tag: u8,
    /// Raw descriptor payload.
    pub data: SmallVec<[u8; 8]>,
}

/// A decoded `ca_descriptor` (tag 9): `(ca_system_id, ca_pid, private_data)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaDescriptor {
    pub ca_system_id: u16,
    pub ca_pid: u16,
    pub private_data: SmallVec<[u8; 8]>,
}

/// A decoded `registration_descriptor` (tag 5): a four-byte format identifier plus any
/// additional identification info.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationDescriptor {
    pub format_identifier: u32,
    pub additional_identification_info: SmallVec<[u8; 8]>,
}

/// One language entry of an `ISO_639_language_descriptor` (tag 10): a three-character
/// language code and an audio type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageDescriptor {
    pub language_code: [u8; 3],
    pub audio_type: u8,
}

impl Descriptor {
    fn read_from(reader: &mut Reader) -> Result<Self> {
        let tag = reader.read_u8()?;
        let len = reader.read_u8()? as usize;
        let mut data = SmallVec::<[u8; 8]>::new();
        data.extend_from_slice(reader.read(len)?);
        Ok(Self { tag, data })
    }

    /// Decodes this descriptor as a `ca_descriptor` if its tag is 9.
    pub fn as_ca_descriptor(&self) -> Option<CaDescriptor> {
        if self.tag != 9 || self.data.len() < 4 {
            return None;
        }
        let mut r = Reader::new(&self.data);
        let ca_system_id = r.read_u16().ok()?;
        let ca_pid = r.read_u16().ok()? & 0x1FFF;
        let mut private_data = SmallVec::new();
        private_data.extend_from_slice(r.read_to_end().ok()?);
        Some(CaDescriptor {
            ca_system_id,
            ca_pid,
            private_data,
        })
    }

    /// Decodes this descriptor as a `registration_descriptor` if its tag is 5.
    pub fn as_registration_descriptor(&self) -> Option<RegistrationDescriptor> {
        if self.tag != 5 || self.data.len() < 4 {
            return None;
        }
        let mut r = Reader::new(&self.data);
        let format_identifier = u32::from_be_bytes(r.read_array_ref::<4>().ok()?);
        let mut additional_identification_info = SmallVec::new();
        additional_identification_info.extend_from_slice(r.read_to_end().ok()?);
        Some(RegistrationDescriptor {
            format_identifier,
            additional_identification_info,
        })
    }

    /// Decodes this descriptor as an `ISO_639_language_descriptor` if its tag is 10.
    pub fn as_language_descriptors(&self) -> Option<Vec<LanguageDescriptor>> {
        if self.tag != 10 || self.data.len() % 4 != 0 {
            return None;
        }
        Some(
            self.data
                .chunks_exact(4)
                .map(|chunk| LanguageDescriptor {
                    language_code: [chunk[0], chunk[1], chunk[2]],
                    audio_type: chunk[3],
                })
                .collect(),
        )
    }
}

fn read_descriptor_list(reader: &mut Reader, budget: usize) -> Result<Vec<Descriptor>> {
    let mut sub = reader.new_sub_reader(budget)?;
    let mut out = Vec::new();
    while !sub.eof() {
        out.push(Descriptor::read_from(&mut sub)?);
    }
    Ok(out)
}

/// Four-byte PMT-specific header following the table-syntax extension.
#[bitfield]
#[derive(Debug, Copy, Clone)]
pub struct PmtHeader {
    pub reserved: B3,
    pub pcr_pid: B13,
    pub reserved2: B4,
    pub program_info_length: B12,
}

/// Five-byte per-stream header inside a PMT.
#[bitfield]
#[derive(Debug, Copy, Clone)]
pub struct ElementaryStreamInfoHeader {
    pub stream_type: B8,
    pub reserved: B3,
    pub elementary_pid: B13,
    pub reserved2: B4,
    pub es_info_length: B12,
}

/// One elementary stream entry in a PMT.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementaryStreamInfo {
    pub header: ElementaryStreamInfoHeader,
    pub descriptors: Vec<Descriptor>,
}

/// Decoded Program Map Table.
#[derive(Debug, Clone, PartialEq)]
pub struct Pmt {
    pub header: PmtHeader,
    pub program_descriptors: Vec<Descriptor>,
    pub es_info: Vec<ElementaryStreamInfo>,
}

impl PartialEq for PmtHeader {
    fn eq(&self, other: &Self) -> bool {
        self.pcr_pid() == other.pcr_pid()
    }
}

impl PartialEq for ElementaryStreamInfoHeader {
    fn eq(&self, other: &Self) -> bool {
        self.stream_type() == other.stream_type() && self.elementary_pid() == other.elementary_pid()
    }
}

/// The decoded contents of one PSI table, discriminated by table type.
#[derive(Debug, Clone, PartialEq)]
pub enum PsiData {
    /// `(program_number, program_map_pid)` pairs from a PAT.
    Pat(Vec<(u16, u16)>),
    /// A decoded PMT.
    Pmt(Pmt),
    /// A CAT's descriptor list; semantic interpretation is out of scope (§4.5).
    Cat(Vec<Descriptor>),
}

/// One complete, CRC-verified PSI section.
#[derive(Debug, Clone)]
pub struct Psi {
    pub header: PsiHeader,
    pub table_syntax: Option<PsiTableSyntax>,
    pub data: PsiData,
}

impl Psi {
    /// Whether `self`, freshly parsed, supersedes `prior` per §4.5: they are *equal*
    /// (and so `prior` stands) iff table id, version, and canonical fields coincide.
    pub fn supersedes(&self, prior: &Psi) -> bool {
        !(self.header.table_id() == prior.header.table_id()
            && self.table_syntax.map(|t| t.version()) == prior.table_syntax.map(|t| t.version())
            && self.data == prior.data)
    }
}

/// Which table a PSI section should be interpreted as.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PsiKind {
    Pat,
    Pmt,
    Cat,
}

/// Reads and CRC-verifies one PSI section starting at a `pointer_field`, per §4.5.
///
/// `classify` tells the parser how to interpret the table past the syntax extension;
/// the caller (the demultiplexer) knows this from the PID the section arrived on.
pub fn read_psi_section(reader: &mut Reader, classify: impl FnOnce(&PsiHeader) -> PsiKind) -> Result<Psi> {
    if reader.bytes_left() < 1 {
        return Err(reader.error_here(ErrorDetails::BadPsiHeader));
    }
    let pointer_field = reader.read_u8()? as usize;
    reader.skip_bytes(pointer_field)?;

    if reader.bytes_left() < 3 {
        return Err(reader.error_here(ErrorDetails::BadPsiHeader));
    }
    let header_bytes = reader.read_array_ref::<3>()?;
    let header = PsiHeader::from_bytes(header_bytes);
    let section_length = header.section_length() as usize;

    if header.section_syntax_indicator() && section_length == 0 {
        return Err(reader.error_here(ErrorDetails::BadPsiHeader));
    }
    if section_length < 4 {
        return Err(reader.error_here(ErrorDetails::BadPsiHeader));
    }

    let kind = classify(&header);

    let mut crc_input = Vec::with_capacity(3 + section_length);
    crc_input.extend_from_slice(&header_bytes);

    let mut body = reader.new_sub_reader(section_length)?;
    crc_input.extend_from_slice(body.peek(body.bytes_left())?);

    let table_syntax = if section_length >= 9 {
        Some(PsiTableSyntax::from_bytes(body.read_array_ref::<5>()?))
    } else {
        None
    };

    let payload_len = body.bytes_left() - 4;
    let mut payload = body.new_sub_reader(payload_len)?;
    let expected_crc = u32::from_be_bytes(body.read_array_ref::<4>()?);
    let len_minus_crc = crc_input.len() - 4;
    let actual_crc = crc32_mpeg2(&crc_input[..len_minus_crc]);
    if actual_crc != expected_crc {
        return Err(reader.error_here(ErrorDetails::PsiCrcMismatch));
    }

    let data = match kind {
        PsiKind::Pat => {
            let mut entries = Vec::with_capacity(payload.bytes_left() / 4);
            while payload.bytes_left() >= 4 {
                let e = PatEntry::from_bytes(payload.read_array_ref::<4>()?);
                entries.push((e.program_num(), e.program_map_pid()));
            }
            PsiData::Pat(entries)
        }
        PsiKind::Pmt => {
            let header = PmtHeader::from_bytes(payload.read_array_ref::<4>()?);
            let program_descriptors =
                read_descriptor_list(&mut payload, header.program_info_length() as usize)?;
            let mut es_info = Vec::new();
            while !payload.eof() {
                let es_header = ElementaryStreamInfoHeader::from_bytes(payload.read_array_ref::<5>()?);
                let descriptors = read_descriptor_list(&mut payload, es_header.es_info_length() as usize)?;
                es_info.push(ElementaryStreamInfo {
                    header: es_header,
                    descriptors,
                });
            }
            PsiData::Pmt(Pmt {
                header,
                program_descriptors,
                es_info,
            })
        }
        PsiKind::Cat => {
            let mut descriptors = Vec::new();
            while !payload.eof() {
                descriptors.push(Descriptor::read_from(&mut payload)?);
            }
            PsiData::Cat(descriptors)
        }
    };

    Ok(Psi {
        header,
        table_syntax,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_association_table_decodes_and_crc_matches() {
        // From spec.md §8 scenario 5.
        let payload: [u8; 17] = [
            0, 0, 0xB0, 0x0D, 0x00, 0x01, 0xC1, 0x00, 0x00, 0x00, 0x01, 0xF0, 0x00, 0x2A, 0xB1, 0x04, 0xB2,
        ];
        let mut reader = Reader::new(&payload);
        let psi = read_psi_section(&mut reader, |_| PsiKind::Pat).unwrap();
        match psi.data {
            PsiData::Pat(entries) => assert_eq!(entries, vec![(1, 4096)]),
            _ => panic!("expected PAT"),
        }
    }

    #[test]
    fn crc_mismatch_is_rejected() {
        let mut payload: [u8; 17] = [
            0, 0, 0xB0, 0x0D, 0x00, 0x01, 0xC1, 0x00, 0x00, 0x00, 0x01, 0xF0, 0x00, 0x2A, 0xB1, 0x04, 0xB2,
        ];
        *payload.last_mut().unwrap() ^= 0xFF;
        let mut reader = Reader::new(&payload);
        assert!(read_psi_section(&mut reader, |_| PsiKind::Pat).is_err());
    }

    #[test]
    fn ca_descriptor_decodes_system_id_and_pid() {
        let d = Descriptor {
            tag: 9,
            data: SmallVec::from_slice(&[0x10, 0x01, 0x1F, 0xFF, 0xAB]),
        };
        let ca = d.as_ca_descriptor().unwrap();
        assert_eq!(ca.ca_system_id, 0x1001);
        assert_eq!(ca.ca_pid, 0x1FFF);
        assert_eq!(&ca.private_data[..], &[0xAB]);
    }

    #[test]
    fn registration_descriptor_decodes_format_identifier() {
        let d = Descriptor {
            tag: 5,
            data: SmallVec::from_slice(b"HEVC\x01\x02"),
        };
        let reg = d.as_registration_descriptor().unwrap();
        assert_eq!(reg.format_identifier, u32::from_be_bytes(*b"HEVC"));
        assert_eq!(&reg.additional_identification_info[..], &[0x01, 0x02]);
    }

    #[test]
    fn language_descriptor_decodes_repeated_entries() {
        let mut data = SmallVec::<[u8; 8]>::new();
        data.extend_from_slice(b"eng");
        data.push(0x00); // undefined audio type
        data.extend_from_slice(b"spa");
        data.push(0x02); // visually impaired commentary
        let d = Descriptor { tag: 10, data };
        let langs = d.as_language_descriptors().unwrap();
        assert_eq!(langs.len(), 2);
        assert_eq!(&langs[0].language_code, b"eng");
        assert_eq!(langs[0].audio_type, 0);
        assert_eq!(&langs[1].language_code, b"spa");
        assert_eq!(langs[1].audio_type, 2);
    }
}
