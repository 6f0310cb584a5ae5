//! TS packet parsing: the 188-byte constant-size transport unit of MPEG-2 Systems.
//!
//! Field layout follows the teacher crate's `PacketHeader`/`AdaptationFieldHeader`
//! bitfields; PCR decoding follows its `parse_pcr`.

use crate::error::{Error, ErrorDetails};
use crate::reader::Reader;
use crate::read_bitfield;
use modular_bitfield_msb::prelude::*;

/// Size in bytes of one MPEG-2 TS packet.
pub const TS_PACKET_SIZE: usize = 188;

/// The fixed PID used for the Program Association Table.
pub const PID_PAT: u16 = 0x0000;
/// The fixed PID used for the Conditional Access Table.
pub const PID_CAT: u16 = 0x0001;
/// The fixed PID carrying DASH `emsg` event messages, per ISO/IEC 23009-1 §5.10.3.3.
pub const PID_EMSG: u16 = 0x0004;
/// The null packet PID; payload is stuffing and must be discarded.
pub const PID_NULL: u16 = 0x1FFF;

/// TSC information used in a packet's payload.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, BitfieldSpecifier)]
#[bits = 2]
pub enum TransportScramblingControl {
    /// Not scrambled.
    NotScrambled,
    /// Reserved value; must not be used by a conformant encoder.
    Reserved,
    /// Scrambled with the even key.
    ScrambledEvenKey,
    /// Scrambled with the odd key.
    ScrambledOddKey,
}

/// Link-layer header found at the start of every 188-byte MPEG-TS packet.
#[bitfield]
#[derive(Debug, Copy, Clone)]
pub struct PacketHeader {
    pub sync_byte: B8,
    pub transport_error_indicator: bool,
    pub payload_unit_start_indicator: bool,
    pub transport_priority: bool,
    pub pid: B13,
    pub tsc: TransportScramblingControl,
    pub has_adaptation_field: bool,
    pub has_payload: bool,
    pub continuity_counter: B4,
}

/// Adaptation field header describing which optional fields follow.
#[bitfield]
#[derive(Debug, Copy, Clone)]
pub struct AdaptationFieldHeader {
    pub length: B8,
    pub discontinuity_indicator: bool,
    pub random_access_indicator: bool,
    pub elementary_stream_priority_indicator: bool,
    pub has_pcr: bool,
    pub has_opcr: bool,
    pub has_splice_countdown: bool,
    pub has_transport_private_data: bool,
    pub has_adaptation_field_extension: bool,
}

/// Program Clock Reference: 33-bit 90 kHz base plus 9-bit 27 MHz extension.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct PcrTimestamp {
    /// 33 bits of a 90kHz base clock.
    pub base: u64,
    /// 9 bits of a 27MHz clock rolling over every 300 counts to the base.
    pub extension: u16,
}

impl PcrTimestamp {
    /// The full 42-bit value `base * 300 + extension`, as used by `pcrb` boxes.
    pub fn as_42_bit(&self) -> u64 {
        self.base * 300 + self.extension as u64
    }

    fn parse(b: [u8; 6]) -> Self {
        let mut base: u64 = (b[0] as u64) << 25;
        base |= (b[1] as u64) << 17;
        base |= (b[2] as u64) << 9;
        base |= (b[3] as u64) << 1;
        base |= (b[4] as u64) >> 7;

        let mut extension: u16 = ((b[4] & 0x1) as u16) << 8;
        extension |= b[5] as u16;
        PcrTimestamp { base, extension }
    }
}

/// Non-payload packet metadata found in the adaptation field.
#[derive(Debug, Clone)]
pub struct AdaptationField {
    /// Header describing which fields are present.
    pub header: AdaptationFieldHeader,
    /// Program Clock Reference, if present.
    pub pcr: Option<PcrTimestamp>,
    /// Original Program Clock Reference, if present.
    pub opcr: Option<PcrTimestamp>,
}

/// One fully parsed 188-byte TS packet.
#[derive(Debug, Clone)]
pub struct TsPacket<'a> {
    /// Link-layer header.
    pub header: PacketHeader,
    /// Optional adaptation field.
    pub adaptation_field: Option<AdaptationField>,
    /// Raw payload bytes, if `header.has_payload()`.
    pub payload: Option<&'a [u8]>,
    /// Byte offset of this packet's first byte within the enclosing file.
    pub position: u64,
}

fn read_adaptation_field(reader: &mut Reader) -> Result<AdaptationField, Error> {
    let header = read_bitfield!(reader, AdaptationFieldHeader);
    let mut out = AdaptationField {
        header,
        pcr: None,
        opcr: None,
    };
    let length = header.length() as usize;
    if length == 0 {
        return Ok(out);
    }
    let mut sub = reader.new_sub_reader(length)?;
    if header.has_pcr() {
        if sub.bytes_left() < 6 {
            return Err(sub.error_here(ErrorDetails::BadAdaptationHeader));
        }
        out.pcr = Some(PcrTimestamp::parse(sub.read_array_ref::<6>()?));
    }
    if header.has_opcr() {
        if sub.bytes_left() < 6 {
            return Err(sub.error_here(ErrorDetails::BadAdaptationHeader));
        }
        out.opcr = Some(PcrTimestamp::parse(sub.read_array_ref::<6>()?));
    }
    // Splice countdown, transport private data, and the adaptation extension carry no
    // conformance-relevant fields for this validator and are left unparsed (TODO: decode
    // them if a profile ever needs splice_countdown). When none are present the remaining
    // bytes must all be stuffing, per §4.4.
    if !header.has_splice_countdown()
        && !header.has_transport_private_data()
        && !header.has_adaptation_field_extension()
    {
        while !sub.eof() {
            if sub.read_u8()? != 0xFF {
                return Err(sub.error_here(ErrorDetails::BadAdaptationHeader));
            }
        }
    }
    Ok(out)
}

/// Parses exactly one 188-byte TS packet at file byte offset `position`.
///
/// Pure function: does not retain any state between calls (§4.4). Rejects a packet
/// without the `0x47` sync byte. A `transport_error_indicator` of 1 is accepted but is
/// the caller's responsibility to flag as an advisory.
pub fn parse_ts_packet(packet: &[u8; TS_PACKET_SIZE], position: u64) -> Result<TsPacket, Error> {
    let mut reader = Reader::new(packet);
    let header = read_bitfield!(reader, PacketHeader);
    if header.sync_byte() != 0x47 {
        return Err(reader.error_here(ErrorDetails::LostSync));
    }

    let mut out = TsPacket {
        header,
        adaptation_field: None,
        payload: None,
        position,
    };

    if header.pid() == PID_NULL {
        return Ok(out);
    }

    if header.has_adaptation_field() {
        out.adaptation_field = Some(read_adaptation_field(&mut reader)?);
    }

    if header.has_payload() {
        out.payload = Some(reader.read_to_end()?);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet_with_pusi(pid: u16, pusi: bool) -> [u8; TS_PACKET_SIZE] {
        let mut p = [0xFF_u8; TS_PACKET_SIZE];
        p[0] = 0x47;
        p[1] = ((pusi as u8) << 6) | (((pid >> 8) & 0x1F) as u8);
        p[2] = (pid & 0xFF) as u8;
        p[3] = 0x10; // no adaptation field, has payload, CC = 0
        p
    }

    #[test]
    fn rejects_bad_sync_byte() {
        let mut p = packet_with_pusi(0x100, true);
        p[0] = 0x00;
        assert!(parse_ts_packet(&p, 0).is_err());
    }

    #[test]
    fn parses_188_bytes_with_sync_byte() {
        let p = packet_with_pusi(0x100, true);
        let parsed = parse_ts_packet(&p, 1880).unwrap();
        assert_eq!(parsed.header.sync_byte(), 0x47);
        assert_eq!(parsed.header.pid(), 0x100);
        assert!(parsed.header.payload_unit_start_indicator());
        assert_eq!(parsed.position, 1880);
        assert_eq!(parsed.payload.unwrap().len(), 184);
    }

    #[test]
    fn null_packets_are_discarded_early() {
        let p = packet_with_pusi(PID_NULL, false);
        let parsed = parse_ts_packet(&p, 0).unwrap();
        assert!(parsed.payload.is_none());
        assert!(parsed.adaptation_field.is_none());
    }

    #[test]
    fn pcr_decodes_as_base_times_300_plus_extension() {
        let mut p = [0xFF_u8; TS_PACKET_SIZE];
        p[0] = 0x47;
        p[1] = 0x01;
        p[2] = 0x00;
        p[3] = 0x20; // has_adaptation_field, no payload
        p[4] = 183; // adaptation field length
        p[5] = 0x10; // has_pcr
        // PCR base=1, extension=1 => bytes encode base<<1 in first 33 bits then ext in low 9
        p[6] = 0x00;
        p[7] = 0x00;
        p[8] = 0x00;
        p[9] = 0x02;
        p[10] = 0x7E; // low bit of base (0) | reserved(6 bits=1) | ext bit8
        p[11] = 0x01;
        let parsed = parse_ts_packet(&p, 0).unwrap();
        let pcr = parsed.adaptation_field.unwrap().pcr.unwrap();
        assert_eq!(pcr.base, 1);
        assert_eq!(pcr.extension, 1);
        assert_eq!(pcr.as_42_bit(), 301);
    }
}
