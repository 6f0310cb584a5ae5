//! EMSG PES handler (§4.10): applies PID 0x0004's event-message-specific rules to the
//! PES packets [`crate::demux::Demux`] assembles there.

use crate::bmff::{self, BoxData};
use crate::index_validator::Subsegment;
use crate::pes::PesEmission;
use crate::reader::Reader;
use crate::report::Report;

const BOX_TYPE_EMSG: u32 = 0x656D7367; // "emsg"

/// Checks one PES run assembled on PID 0x0004 (§4.10).
///
/// `subsegments` is the enclosing segment's subsegment list; containment is only
/// enforced when `bitstream_switching` is set and the list is non-empty.
pub fn check(emission: &PesEmission, segment_duration: u64, bitstream_switching: bool, subsegments: &[Subsegment], report: &mut Report) {
    let pes = match emission {
        PesEmission::Malformed => {
            report.fail("ISO/IEC 23009-1 5.10.3.3", "emsg PES run did not begin with PUSI");
            return;
        }
        PesEmission::Pes(pes) => pes,
    };

    if pes.data.len() < 8 {
        report.fail(
            "ISO/IEC 23009-1 5.10.3.3",
            "emsg PES packet's first payload is too short to contain a box header",
        );
        return;
    }

    if !pes.all_tsc_not_scrambled {
        report.fail(
            "ISO/IEC 23009-1 5.10.3.3",
            "transport_scrambling_control is nonzero on a packet carrying an emsg",
        );
    }

    let boxes = match bmff::parse_boxes(&mut Reader::new(&pes.data)) {
        Ok(boxes) => boxes,
        Err(e) => {
            report.fail("ISO/IEC 23009-1 5.10.3.3", format!("emsg PES payload failed to parse: {}", e));
            return;
        }
    };

    let mut cursor = pes.payload_pos_in_stream;
    for b in &boxes {
        if !matches!(b.data, BoxData::Emsg(_)) {
            report.fail(
                "ISO/IEC 23009-1 5.10.3.3",
                "PES on PID 0x0004 decodes to a box type other than emsg",
            );
            cursor += b.size;
            continue;
        }
        let BoxData::Emsg(emsg) = &b.data else { unreachable!() };

        if emsg.presentation_time_delta as u64 + emsg.event_duration as u64 > segment_duration {
            report.fail(
                "ISO/IEC 23009-1 5.10.3.3",
                "emsg presentation_time_delta + event_duration exceeds the segment duration",
            );
        }

        if bitstream_switching && !subsegments.is_empty() {
            let box_end = cursor + b.size;
            let contained = subsegments
                .iter()
                .any(|s| cursor >= s.start_byte && box_end <= s.end_byte);
            if !contained {
                report.fail(
                    "ISO/IEC 23009-1 5.10.3.3",
                    "emsg box is not wholly contained within one subsegment",
                );
            }
        }

        cursor += b.size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pes::pes_read;

    fn emsg_box(scheme: &str, value: &str, timescale: u32, delta: u32, duration: u32, id: u32) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&[0, 0, 0, 0]);
        body.extend_from_slice(scheme.as_bytes());
        body.push(0);
        body.extend_from_slice(value.as_bytes());
        body.push(0);
        body.extend_from_slice(&timescale.to_be_bytes());
        body.extend_from_slice(&delta.to_be_bytes());
        body.extend_from_slice(&duration.to_be_bytes());
        body.extend_from_slice(&id.to_be_bytes());
        let mut out = Vec::new();
        out.extend_from_slice(&((8 + body.len()) as u32).to_be_bytes());
        out.extend_from_slice(b"emsg");
        out.extend_from_slice(&body);
        out
    }

    fn wrap_pes(payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0x00, 0x00, 0x01, 0xFC, 0x00, 0x00];
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn emsg_within_duration_passes() {
        let payload = emsg_box("urn:example", "1", 1000, 0, 500, 1);
        let pes = pes_read(&wrap_pes(&payload), 0).unwrap();
        let emission = PesEmission::Pes(pes);
        let mut report = Report::new();
        check(&emission, 90000, false, &[], &mut report);
        assert!(report.findings().is_empty());
    }

    #[test]
    fn emsg_exceeding_segment_duration_fails() {
        let payload = emsg_box("urn:example", "1", 1000, 80000, 20000, 1);
        let pes = pes_read(&wrap_pes(&payload), 0).unwrap();
        let emission = PesEmission::Pes(pes);
        let mut report = Report::new();
        check(&emission, 90000, false, &[], &mut report);
        assert_eq!(report.verdict(), crate::report::Verdict::Fail);
    }

    #[test]
    fn malformed_run_is_a_failure() {
        let mut report = Report::new();
        check(&PesEmission::Malformed, 90000, false, &[], &mut report);
        assert_eq!(report.verdict(), crate::report::Verdict::Fail);
    }

    #[test]
    fn scrambled_contributing_packet_is_a_failure() {
        let payload = emsg_box("urn:example", "1", 1000, 0, 500, 1);
        let mut pes = pes_read(&wrap_pes(&payload), 0).unwrap();
        pes.all_tsc_not_scrambled = false;
        let emission = PesEmission::Pes(pes);
        let mut report = Report::new();
        check(&emission, 90000, false, &[], &mut report);
        assert_eq!(report.verdict(), crate::report::Verdict::Fail);
    }
}
