//! PES packet parsing and the per-PID assembler that turns buffered TS payloads into
//! complete PES packets, per §4.6.
//!
//! Header bitfield layouts follow the teacher crate's `pes.rs`; PTS/DTS decoding follows
//! [`crate::reader::Reader::read_90khz_timestamp`].

use crate::error::{ErrorDetails, Result};
use crate::read_bitfield;
use crate::reader::Reader;
use crate::ts::TransportScramblingControl;
use modular_bitfield_msb::prelude::*;

/// The fixed six-byte PES start code, stream id, and declared packet length.
#[bitfield]
#[derive(Debug, Copy, Clone)]
pub struct PesHeader {
    pub start_code: B24,
    pub stream_id: B8,
    pub packet_length: B16,
}

/// The three-byte PES optional header flags, present for all stream ids except the
/// padding stream (`0xBF`) and a handful of others the demultiplexer never routes here.
#[bitfield]
#[derive(Debug, Copy, Clone)]
pub struct PesOptionalHeader {
    pub marker_bits: B2,
    pub scrambling_control: B2,
    pub priority: bool,
    pub data_alignment_indicator: bool,
    pub copyright: bool,
    pub original: bool,
    pub has_pts: bool,
    pub has_dts: bool,
    pub escr: bool,
    pub es_rate: bool,
    pub dsm_trick_mode: bool,
    pub has_additional_copy_info: bool,
    pub has_crc: bool,
    pub has_extension: bool,
    pub additional_header_length: B8,
}

/// One fully assembled PES packet (§4.6).
#[derive(Debug, Clone)]
pub struct Pes {
    pub header: PesHeader,
    pub optional_header: Option<PesOptionalHeader>,
    pub pts: Option<u64>,
    pub dts: Option<u64>,
    pub data: Vec<u8>,
    /// Byte offset in the enclosing file of this PES's first payload byte.
    pub payload_pos_in_stream: u64,
    /// Whether every TS packet that contributed to this PES had
    /// `transport_scrambling_control == 0`. `true` when assembled outside a
    /// [`PesAssembler`], which has no per-packet TSC to observe.
    pub all_tsc_not_scrambled: bool,
}

/// Parses a complete PES packet from `bytes`, the concatenated payloads of one buffered
/// TS packet run, per §4.6.
pub fn pes_read(bytes: &[u8], payload_pos_in_stream: u64) -> Result<Pes> {
    let mut reader = Reader::new(bytes);
    if reader.bytes_left() < 6 {
        return Err(reader.error_here(ErrorDetails::BadPesHeader));
    }
    let header = read_bitfield!(reader, PesHeader);

    let mut pts = None;
    let mut dts = None;
    let optional_header = if reader.bytes_left() >= 3 && header.stream_id() != 0xBF {
        let optional = read_bitfield!(reader, PesOptionalHeader);
        let additional_length = optional.additional_header_length() as usize;
        let mut sub = reader.new_sub_reader(additional_length)?;

        if optional.has_pts() {
            if sub.bytes_left() < 5 {
                return Err(sub.error_here(ErrorDetails::BadPesHeader));
            }
            pts = Some(sub.read_90khz_timestamp()?);
        }
        if optional.has_dts() {
            if sub.bytes_left() < 5 {
                return Err(sub.error_here(ErrorDetails::BadPesHeader));
            }
            dts = Some(sub.read_90khz_timestamp()?);
        }
        // ESCR, ES rate, trick mode, additional copy info, CRC, and extension fields
        // carry no conformance-relevant data for this validator and are left unparsed.
        Some(optional)
    } else {
        None
    };

    let data = reader.read_to_end()?.to_vec();
    Ok(Pes {
        header,
        optional_header,
        pts,
        dts,
        data,
        payload_pos_in_stream,
        all_tsc_not_scrambled: true,
    })
}

/// Result of feeding one TS packet's payload into a [`PesAssembler`].
#[derive(Debug)]
pub enum PesEmission {
    /// A complete PES packet was assembled from the prior buffered run.
    Pes(Pes),
    /// A buffered run's first packet lacked `PUSI = 1`; the run is discarded unparsed.
    Malformed,
}

/// Per-PID state machine that buffers TS packet payloads between `PUSI` boundaries and
/// emits a [`Pes`] (or a [`PesEmission::Malformed`] marker) on the next boundary, per §4.6.
#[derive(Debug, Default)]
pub struct PesAssembler {
    buffer: Vec<u8>,
    first_position: u64,
    first_pusi: bool,
    started: bool,
    /// Whether every packet fed into the run currently being buffered has had
    /// `transport_scrambling_control == NotScrambled`.
    all_tsc_not_scrambled: bool,
}

impl PesAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one TS packet's payload bytes, observed at file byte offset `position` with
    /// the given `payload_unit_start_indicator` and `transport_scrambling_control`.
    /// Returns an emission if this packet's `PUSI` closed out a previously buffered run.
    pub fn feed(
        &mut self,
        payload: &[u8],
        pusi: bool,
        position: u64,
        tsc: TransportScramblingControl,
    ) -> Result<Option<PesEmission>> {
        let emission = if pusi && self.started {
            Some(self.drain()?)
        } else {
            None
        };

        if !self.started {
            self.first_position = position;
            self.first_pusi = pusi;
            self.started = true;
            self.all_tsc_not_scrambled = true;
        }
        if tsc != TransportScramblingControl::NotScrambled {
            self.all_tsc_not_scrambled = false;
        }
        self.buffer.extend_from_slice(payload);
        Ok(emission)
    }

    /// Flushes any buffered run at stream end, per §4.7's `mpeg2ts_stream_reset`.
    pub fn flush(&mut self) -> Result<Option<PesEmission>> {
        if !self.started {
            return Ok(None);
        }
        Ok(Some(self.drain()?))
    }

    fn drain(&mut self) -> Result<PesEmission> {
        let buffer = std::mem::take(&mut self.buffer);
        let position = self.first_position;
        let first_pusi = self.first_pusi;
        let all_tsc_not_scrambled = self.all_tsc_not_scrambled;
        self.started = false;
        if !first_pusi {
            return Ok(PesEmission::Malformed);
        }
        let mut pes = pes_read(&buffer, position)?;
        pes.all_tsc_not_scrambled = all_tsc_not_scrambled;
        Ok(PesEmission::Pes(pes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pts_only_pes(pts: u64, payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0x00, 0x00, 0x01, 0xE0, 0x00, 0x00];
        bytes.push(0b1000_0000); // marker bits
        bytes.push(0b1000_0000); // has_pts
        bytes.push(5); // additional_header_length
        let mut ts_bytes = [0_u8; 5];
        ts_bytes[0] = 0x20 | (((pts >> 29) & 0x0E) as u8) | 1;
        ts_bytes[1] = ((pts >> 22) & 0xFF) as u8;
        ts_bytes[2] = (((pts >> 14) & 0xFE) as u8) | 1;
        ts_bytes[3] = ((pts >> 7) & 0xFF) as u8;
        ts_bytes[4] = (((pts << 1) & 0xFE) as u8) | 1;
        bytes.extend_from_slice(&ts_bytes);
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn decodes_pts_and_payload() {
        let bytes = pts_only_pes(90000, &[0xAA, 0xBB]);
        let pes = pes_read(&bytes, 1000).unwrap();
        assert_eq!(pes.pts, Some(90000));
        assert_eq!(pes.dts, None);
        assert_eq!(pes.data, vec![0xAA, 0xBB]);
        assert_eq!(pes.payload_pos_in_stream, 1000);
    }

    fn encode_90khz(prefix: u8, ts: u64) -> [u8; 5] {
        [
            (prefix << 4) | (((ts >> 29) & 0x0E) as u8) | 1,
            ((ts >> 22) & 0xFF) as u8,
            (((ts >> 14) & 0xFE) as u8) | 1,
            ((ts >> 7) & 0xFF) as u8,
            (((ts << 1) & 0xFE) as u8) | 1,
        ]
    }

    #[test]
    fn pts_and_dts_with_no_payload_is_a_19_byte_pes() {
        // From spec.md §8 scenario 4.
        let mut bytes = vec![0x00, 0x00, 0x01, 0xE0, 0x00, 0x00]; // packet_length = 0
        bytes.push(0b1000_0000); // marker bits
        bytes.push(0b1100_0000); // has_pts, has_dts
        bytes.push(10); // additional_header_length
        bytes.extend_from_slice(&encode_90khz(0b0011, 133500));
        bytes.extend_from_slice(&encode_90khz(0b0001, 126000));
        assert_eq!(bytes.len(), 19);

        let pes = pes_read(&bytes, 0).unwrap();
        assert_eq!(pes.pts, Some(133500));
        assert_eq!(pes.dts, Some(126000));
        assert!(pes.data.is_empty());
    }

    #[test]
    fn assembler_emits_on_next_pusi_and_flushes_at_end() {
        let mut asm = PesAssembler::new();
        let full = pts_only_pes(90000, &[0xAA, 0xBB, 0xCC]);
        let (first, second) = full.split_at(6);

        assert!(asm.feed(first, true, 0, TransportScramblingControl::NotScrambled).unwrap().is_none());
        assert!(asm.feed(second, false, 188, TransportScramblingControl::NotScrambled).unwrap().is_none());

        let next_unit = [0x00, 0x00, 0x01, 0xE0, 0x00, 0x00, 0x80, 0x00, 0x00];
        let emission = asm.feed(&next_unit, true, 376, TransportScramblingControl::NotScrambled).unwrap().unwrap();
        match emission {
            PesEmission::Pes(pes) => {
                assert_eq!(pes.payload_pos_in_stream, 0);
                assert_eq!(pes.pts, Some(90000));
                assert!(pes.all_tsc_not_scrambled);
            }
            PesEmission::Malformed => panic!("expected a complete PES"),
        }

        let flushed = asm.flush().unwrap().unwrap();
        assert!(matches!(flushed, PesEmission::Pes(_)));
    }

    #[test]
    fn pes_spanning_six_ts_packets_assembles_into_one_emission() {
        // From spec.md §8 scenario 6.
        const PAYLOAD_PER_PACKET: usize = 184;
        let media_payload: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
        let full = pts_only_pes(45000, &media_payload);
        // 14 header bytes + 1000 payload bytes spans exactly six 184-byte TS payloads,
        // the last one short (no adaptation-field stuffing modeled here).
        assert_eq!(full.chunks(PAYLOAD_PER_PACKET).count(), 6);

        let mut asm = PesAssembler::new();
        let mut emission = None;
        for (i, chunk) in full.chunks(PAYLOAD_PER_PACKET).enumerate() {
            let position = (i * 188) as u64;
            let pusi = i == 0;
            let e = asm.feed(chunk, pusi, position, TransportScramblingControl::NotScrambled).unwrap();
            if e.is_some() {
                emission = e;
            }
        }
        assert!(emission.is_none()); // no next PUSI arrived to close the run out
        let emission = asm.flush().unwrap().unwrap();
        match emission {
            PesEmission::Pes(pes) => {
                assert_eq!(pes.payload_pos_in_stream, 0);
                assert_eq!(pes.pts, Some(45000));
                assert_eq!(pes.data, media_payload);
            }
            PesEmission::Malformed => panic!("expected a complete PES"),
        }
    }

    #[test]
    fn first_packet_without_pusi_is_malformed() {
        let mut asm = PesAssembler::new();
        asm.feed(&[0xAA, 0xBB], false, 0, TransportScramblingControl::NotScrambled).unwrap();
        let next = [0x00, 0x00, 0x01, 0xE0, 0x00, 0x00];
        let emission = asm.feed(&next, true, 188, TransportScramblingControl::NotScrambled).unwrap().unwrap();
        assert!(matches!(emission, PesEmission::Malformed));
    }

    #[test]
    fn scrambled_contributing_packet_marks_the_pes_as_scrambled() {
        let mut asm = PesAssembler::new();
        let full = pts_only_pes(90000, &[0xAA, 0xBB, 0xCC]);
        let (first, second) = full.split_at(6);
        asm.feed(first, true, 0, TransportScramblingControl::NotScrambled).unwrap();
        asm.feed(second, false, 188, TransportScramblingControl::ScrambledEvenKey).unwrap();
        let flushed = asm.flush().unwrap().unwrap();
        match flushed {
            PesEmission::Pes(pes) => assert!(!pes.all_tsc_not_scrambled),
            PesEmission::Malformed => panic!("expected a complete PES"),
        }
    }
}
