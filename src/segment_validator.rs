//! Per-media-segment conformance checks (§4.8): feeds a segment's TS packets through a
//! fresh [`Demux`], enforcing PAT/PMT occurrence, single-program, PCR/bitstream-switching
//! ordering, PES completeness, and subsegment boundary rules.

use crate::demux::{Demux, DemuxEvent};
use crate::emsg;
use crate::index_validator::Subsegment;
use crate::nal::{classify_au, SapType};
use crate::pes::{Pes, PesEmission};
use crate::psi::Psi;
use crate::report::Report;
use crate::ts::TS_PACKET_SIZE;
use crate::Profile;
use num_traits::ToPrimitive;
use std::collections::HashMap;

/// Whether a byte range is an initialization segment (template PMT only, no media) or a
/// media segment.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SegmentKind {
    Initialization,
    Media,
}

/// A random access point observed while validating a segment, for subsegment correlation.
#[derive(Debug, Clone, Copy)]
struct Rap {
    position: u64,
    pts: u64,
    sap: SapType,
}

/// Everything the cross-segment checker and the orchestrator need out of one segment's
/// validation (§4.8, §4.9).
#[derive(Debug, Default)]
pub struct SegmentResult {
    /// The segment's PMT, to be adopted as the template for the next media segment when
    /// this was an initialization segment.
    pub pmt_template: Option<Psi>,
    pub program_count: usize,
    pub earliest_pts: Option<u64>,
    pub latest_pts: Option<u64>,
    /// Earliest observed video presentation time, the segment's actual start (§4.9).
    pub actual_start: Option<u64>,
    /// Latest observed video presentation time, the segment's actual end (§4.9).
    pub actual_end: Option<u64>,
    pub video_pid: Option<u16>,
    pub audio_pid: Option<u16>,
    pub pcr_pid: Option<u16>,
}

fn adts_frame_lengths(data: &[u8], report: &mut Report) -> Vec<usize> {
    let mut frames = Vec::new();
    let mut pos = 0;
    while pos + 7 <= data.len() {
        let frame = &data[pos..];
        let frame_length =
            (((frame[3] & 0x03) as usize) << 11) | ((frame[4] as usize) << 3) | ((frame[5] >> 5) as usize);
        if frame_length == 0 {
            report.fail("ISO/IEC 13818-7 Annex A", "ADTS frame has a zero-length frame_length field");
            break;
        }
        frames.push(frame_length);
        pos += frame_length;
    }
    frames
}

/// Validates one segment's TS packets (§4.8).
///
/// `template` is the initialization segment's parsed PMT, adopted as the segment's sole
/// program so no new PAT/PMT may legally appear. `subsegments` is the index validator's
/// output for this segment, empty when no index is associated.
#[allow(clippy::too_many_arguments)]
pub fn validate(
    bytes: &[u8],
    profile: Profile,
    kind: SegmentKind,
    template: Option<&Psi>,
    subsegments: &mut [Subsegment],
    bitstream_switching: bool,
    segment_alignment: bool,
    segment_duration: u64,
    report: &mut Report,
) -> SegmentResult {
    let mut demux = Demux::new();
    if let Some(pmt) = template {
        demux.install_template_program(1, pmt.clone());
    }
    let template_installed = template.is_some();

    let mut pcr_seen = false;
    let mut first_pusi_pids: std::collections::HashSet<u16> = std::collections::HashSet::new();
    let mut first_pes_of_segment_seen = false;
    let mut per_pid_pts: HashMap<u16, (u64, u64)> = HashMap::new();
    let mut raps: Vec<Rap> = Vec::new();
    let mut video_pid = None;
    let mut audio_pid = None;
    let mut pcr_pid = None;

    let num_packets = bytes.len() / TS_PACKET_SIZE;
    for i in 0..num_packets {
        let start = i * TS_PACKET_SIZE;
        let mut raw = [0_u8; TS_PACKET_SIZE];
        raw.copy_from_slice(&bytes[start..start + TS_PACKET_SIZE]);
        let position = start as u64;

        let (packet, event) = match demux.feed(&raw, position) {
            Ok(v) => v,
            Err(e) => {
                report.fail("ISO/IEC 13818-1 2.4.3.3", format!("TS packet failed to parse: {}", e));
                continue;
            }
        };

        if template_installed && matches!(event, DemuxEvent::Pat(_) | DemuxEvent::Pmt { .. }) {
            report.fail(
                "ISO/IEC 23009-1 5.3.9.2",
                "media segment carries a new PAT/PMT while an initialization template is installed",
            );
        }

        if demux.take_pending_pcr().is_some() {
            if kind == SegmentKind::Initialization {
                report.fail("ISO/IEC 23009-1 5.3.9.2", "initialization segment carries a PCR");
            }
            pcr_seen = true;
        }

        if let Some(sub) = subsegments.iter_mut().find(|s| position >= s.start_byte && position < s.end_byte) {
            sub.ts_count += 1;
        }

        let pid = packet.header.pid();
        if packet.header.payload_unit_start_indicator()
            && packet.payload.is_some()
            && demux.programs().any(|p| p.streams.iter().any(|s| s.elementary_pid == pid))
            && first_pusi_pids.insert(pid)
            && bitstream_switching
            && !pcr_seen
        {
            report.fail(
                "ISO/IEC 23009-1 5.3.9.2",
                "first payload-unit-start of a media PID is not preceded by a PCR",
            );
        }

        match event {
            DemuxEvent::Emsg(emission) => {
                emsg::check(&emission, segment_duration, bitstream_switching, subsegments, report);
            }
            DemuxEvent::Pes { pid, emission, .. } => {
                if let PesEmission::Malformed = &emission {
                    if matches!(profile, Profile::Mp2tMain | Profile::Mp2tSimple) {
                        report.fail(
                            "ISO/IEC 23009-1 5.3.9.2",
                            "media PID's PES run did not begin with PUSI",
                        );
                    }
                    continue;
                }
                let PesEmission::Pes(pes) = emission else { continue };
                if let Some(sub) = subsegments
                    .iter_mut()
                    .find(|s| pes.payload_pos_in_stream >= s.start_byte && pes.payload_pos_in_stream < s.end_byte)
                {
                    sub.pes_count += 1;
                }
                handle_pes(
                    &pes,
                    pid,
                    &mut video_pid,
                    &mut audio_pid,
                    &mut pcr_pid,
                    kind,
                    segment_alignment,
                    bitstream_switching,
                    &mut first_pes_of_segment_seen,
                    &mut per_pid_pts,
                    &mut raps,
                    packet.adaptation_field.as_ref().map(|af| af.header.random_access_indicator()).unwrap_or(false),
                    report,
                );
            }
            _ => {}
        }

        if let Some(&known_pcr_pid) = demux.programs().filter_map(|p| p.pcr_pid.as_ref()).next() {
            pcr_pid.get_or_insert(known_pcr_pid);
        }
    }

    for event in demux.flush().unwrap_or_default() {
        match event {
            DemuxEvent::Emsg(emission) => {
                emsg::check(&emission, segment_duration, bitstream_switching, subsegments, report);
            }
            DemuxEvent::Pes { pid, emission: PesEmission::Pes(pes), .. } => {
                if let Some(sub) = subsegments
                    .iter_mut()
                    .find(|s| pes.payload_pos_in_stream >= s.start_byte && pes.payload_pos_in_stream < s.end_byte)
                {
                    sub.pes_count += 1;
                }
                handle_pes(
                    &pes,
                    pid,
                    &mut video_pid,
                    &mut audio_pid,
                    &mut pcr_pid,
                    kind,
                    segment_alignment,
                    bitstream_switching,
                    &mut first_pes_of_segment_seen,
                    &mut per_pid_pts,
                    &mut raps,
                    false,
                    report,
                );
            }
            _ => {}
        }
    }

    let program_count = demux.programs().count();
    if kind == SegmentKind::Media && program_count != 1 {
        report.fail("ISO/IEC 23009-1 5.3.9.2", "media segment does not carry exactly one program");
    }

    if !subsegments.is_empty() {
        check_subsegments(subsegments, &raps, report);
    }

    let earliest_pts = per_pid_pts.values().map(|(e, _)| *e).min();
    let latest_pts = per_pid_pts.values().map(|(_, l)| *l).max();
    let pmt_template = demux.programs().next().and_then(|p| p.pmt.clone());

    SegmentResult {
        pmt_template,
        program_count,
        earliest_pts,
        latest_pts,
        actual_start: earliest_pts,
        actual_end: latest_pts,
        video_pid,
        audio_pid,
        pcr_pid,
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_pes(
    pes: &Pes,
    pid: u16,
    video_pid: &mut Option<u16>,
    audio_pid: &mut Option<u16>,
    _pcr_pid: &mut Option<u16>,
    kind: SegmentKind,
    segment_alignment: bool,
    bitstream_switching: bool,
    first_pes_of_segment_seen: &mut bool,
    per_pid_pts: &mut HashMap<u16, (u64, u64)>,
    raps: &mut Vec<Rap>,
    random_access_indicator: bool,
    report: &mut Report,
) {
    if kind == SegmentKind::Initialization && (pes.pts.is_some() || pes.dts.is_some()) {
        report.fail("ISO/IEC 23009-1 5.3.9.2", "initialization segment PES carries PTS or DTS");
    }

    if !*first_pes_of_segment_seen {
        *first_pes_of_segment_seen = true;
        if (segment_alignment || bitstream_switching) && pes.pts.is_none() {
            report.fail(
                "ISO/IEC 23009-1 5.3.9.2",
                "first PES packet of an aligned or bitstream-switching segment lacks a PTS",
            );
        }
    }

    if let Some(pts) = pes.pts {
        let entry = per_pid_pts.entry(pid).or_insert((pts, pts));
        entry.0 = entry.0.min(pts);
        entry.1 = entry.1.max(pts);
    }

    let is_video_stream_id = pes.header.stream_id() & 0xF0 == 0xE0;
    let is_audio_stream_id = pes.header.stream_id() & 0xE0 == 0xC0;

    if is_video_stream_id {
        video_pid.get_or_insert(pid);
        if random_access_indicator {
            let sap = classify_au(&pes.data);
            if let Some(pts) = pes.pts {
                raps.push(Rap {
                    position: pes.payload_pos_in_stream,
                    pts,
                    sap,
                });
            }
        }
    } else if is_audio_stream_id {
        audio_pid.get_or_insert(pid);
        let frames = adts_frame_lengths(&pes.data, report);
        if let Some(pts) = pes.pts {
            let audio_duration_90khz = frames.len() as u64 * 1920;
            let entry = per_pid_pts.entry(pid).or_insert((pts, pts));
            entry.1 = entry.1.max(pts + audio_duration_90khz);
        }
    }
}

fn check_subsegments(subsegments: &mut [Subsegment], raps: &[Rap], report: &mut Report) {
    for sub in subsegments {
        if sub.start_byte % TS_PACKET_SIZE as u64 != 0 {
            report.fail(
                "ISO/IEC 14496-12 8.16.3",
                "sidx subsegment start offset does not land on a TS sync byte",
            );
        }

        if sub.ts_count == 0 {
            report.fail("ISO/IEC 23009-1 5.3.9.2", "subsegment contains no TS packets");
        }

        let within: Vec<&Rap> = raps.iter().filter(|r| r.position >= sub.start_byte && r.position < sub.end_byte).collect();
        match within.len() {
            0 => {
                report.fail(
                    "ISO/IEC 23009-1 5.3.9.2",
                    "subsegment has no random access point within its declared byte range",
                );
            }
            1 => {
                sub.saw_random_access = true;
                let rap = within[0];
                if rap.position != sub.start_byte || rap.pts != sub.start_time {
                    report.fail(
                        "ISO/IEC 23009-1 5.3.9.2",
                        "subsegment's sole random access point is not at its declared start byte and time",
                    );
                }
                let expected_type: u8 = rap.sap.to_u8().unwrap_or(0);
                if sub.starts_with_sap && expected_type != 0 && expected_type != sub.sap_type {
                    report.fail(
                        "ISO/IEC 14496-12 8.16.3",
                        "subsegment's random access point SAP type disagrees with the sidx reference",
                    );
                }
            }
            _ => {
                report.fail(
                    "ISO/IEC 23009-1 5.3.9.2",
                    "subsegment contains more than one random access point",
                );
            }
        }

        while let Some(&offset) = sub.ssix_offsets.get(sub.ssix_offset_index) {
            if offset % TS_PACKET_SIZE as u64 != 0 {
                report.fail(
                    "ISO/IEC 14496-12 8.16.4.3",
                    "ssix byte range offset does not land on a TS sync byte",
                );
            }
            sub.ssix_offset_index += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psi::{crc32_mpeg2, read_psi_section, PsiKind};

    fn psi_section(table_id: u8, table_id_extension: u16, version: u8, body: &[u8]) -> Vec<u8> {
        let section_length = 5 + body.len() + 4;
        let header_bytes = [table_id, 0xB0 | ((section_length >> 8) & 0x0F) as u8, (section_length & 0xFF) as u8];
        let table_syntax = [
            (table_id_extension >> 8) as u8,
            table_id_extension as u8,
            0xC0 | (version << 1) | 1,
            0x00,
            0x00,
        ];
        let mut crc_input = Vec::new();
        crc_input.extend_from_slice(&header_bytes);
        crc_input.extend_from_slice(&table_syntax);
        crc_input.extend_from_slice(body);
        let crc = crc32_mpeg2(&crc_input);

        let mut section = vec![0x00]; // pointer_field
        section.extend_from_slice(&header_bytes);
        section.extend_from_slice(&table_syntax);
        section.extend_from_slice(body);
        section.extend_from_slice(&crc.to_be_bytes());
        section
    }

    fn pat_section(program_number: u16, pmt_pid: u16) -> Vec<u8> {
        let body = [
            (program_number >> 8) as u8,
            program_number as u8,
            0xE0 | ((pmt_pid >> 8) & 0x1F) as u8,
            pmt_pid as u8,
        ];
        psi_section(0x00, 1, 0, &body)
    }

    fn pmt_section(pcr_pid: u16, video_pid: u16) -> Vec<u8> {
        let mut body = vec![
            0xE0 | ((pcr_pid >> 8) & 0x1F) as u8,
            pcr_pid as u8,
            0xF0,
            0x00,
        ];
        body.extend_from_slice(&[
            0x1B, // H.264 stream type
            0xE0 | ((video_pid >> 8) & 0x1F) as u8,
            video_pid as u8,
            0xF0,
            0x00,
        ]);
        psi_section(0x02, 1, 0, &body)
    }

    fn pmt_psi(pcr_pid: u16, video_pid: u16) -> Psi {
        let section = pmt_section(pcr_pid, video_pid);
        // Skip the pointer_field byte that read_psi_section's caller (the demux's
        // SectionAccumulator) otherwise consumes before the CRC-verified body.
        read_psi_section(&mut crate::reader::Reader::new(&section), |_| PsiKind::Pmt).unwrap()
    }

    fn ts_packet(pid: u16, pusi: bool, payload: &[u8]) -> [u8; TS_PACKET_SIZE] {
        let mut p = [0xFF_u8; TS_PACKET_SIZE];
        p[0] = 0x47;
        p[1] = ((pusi as u8) << 6) | (((pid >> 8) & 0x1F) as u8);
        p[2] = (pid & 0xFF) as u8;
        p[3] = 0x10;
        p[4..4 + payload.len()].copy_from_slice(payload);
        p
    }

    fn concat(packets: &[[u8; TS_PACKET_SIZE]]) -> Vec<u8> {
        packets.concat()
    }

    fn ts_packet_with_rai(pid: u16, pusi: bool, payload: &[u8]) -> [u8; TS_PACKET_SIZE] {
        let mut p = [0xFF_u8; TS_PACKET_SIZE];
        p[0] = 0x47;
        p[1] = ((pusi as u8) << 6) | (((pid >> 8) & 0x1F) as u8);
        p[2] = (pid & 0xFF) as u8;
        p[3] = 0x30; // adaptation_field_control == 3: AF + payload
        p[4] = 0x00; // adaptation_field length: no PCR/OPCR/stuffing beyond the flags byte
        p[5] = 0x40; // random_access_indicator
        p[6..6 + payload.len()].copy_from_slice(payload);
        p
    }

    fn bare_subsegment(start_byte: u64, end_byte: u64, start_time: u64) -> Subsegment {
        Subsegment {
            reference_id: 0x100,
            start_time,
            start_byte,
            end_byte,
            starts_with_sap: true,
            sap_type: 1,
            ssix_offsets: vec![start_byte],
            saw_random_access: false,
            ts_count: 0,
            pes_count: 0,
            ssix_offset_index: 0,
        }
    }

    #[test]
    fn new_pat_while_template_installed_is_a_failure() {
        let template = pmt_psi(0x100, 0x100);
        let bytes = concat(&[ts_packet(0, true, &pat_section(1, 0x20))]);
        let mut report = Report::new();
        validate(&bytes, Profile::Full, SegmentKind::Media, Some(&template), &mut [], false, false, 90000, &mut report);
        assert_eq!(report.verdict(), crate::report::Verdict::Fail);
    }

    #[test]
    fn media_segment_requires_exactly_one_program() {
        let bytes = concat(&[ts_packet(0, true, &pat_section(1, 0x20))]);
        let mut report = Report::new();
        let result = validate(&bytes, Profile::Full, SegmentKind::Media, None, &mut [], false, false, 90000, &mut report);
        assert_eq!(result.program_count, 1);

        // A second program number in the same PAT makes the program count diverge from one.
        let body = [0x00, 0x01, 0xE0, 0x20, 0x00, 0x02, 0xE0, 0x21];
        let bytes = concat(&[ts_packet(0, true, &psi_section(0x00, 1, 0, &body))]);
        let mut report = Report::new();
        validate(&bytes, Profile::Full, SegmentKind::Media, None, &mut [], false, false, 90000, &mut report);
        assert_eq!(report.verdict(), crate::report::Verdict::Fail);
    }

    #[test]
    fn malformed_pes_run_fails_under_mp2t_main() {
        let template = pmt_psi(0x100, 0x100);
        let video_pid = 0x100;
        let first = ts_packet(video_pid, false, &[0xAA; 4]);
        let second = ts_packet(video_pid, true, &[0x00, 0x00, 0x01, 0xE0, 0x00, 0x00]);
        let bytes = concat(&[first, second]);
        let mut report = Report::new();
        validate(&bytes, Profile::Mp2tMain, SegmentKind::Media, Some(&template), &mut [], false, false, 90000, &mut report);
        assert_eq!(report.verdict(), crate::report::Verdict::Fail);
    }

    #[test]
    fn clean_media_segment_with_template_passes() {
        let template = pmt_psi(0x100, 0x100);
        let video_pid = 0x100;
        let pes = {
            let mut bytes = vec![0x00, 0x00, 0x01, 0xE0, 0x00, 0x00, 0x80, 0x80, 0x05];
            bytes.extend_from_slice(&[0x21, 0x00, 0x01, 0x00, 0x01]); // PTS = 0
            bytes.extend_from_slice(&[0x00, 0x00, 0x01, 0x65, 0x88]); // IDR slice NAL
            bytes
        };
        let packet = ts_packet(video_pid, true, &pes);
        let bytes = concat(&[packet]);
        let mut report = Report::new();
        let result = validate(&bytes, Profile::Full, SegmentKind::Media, Some(&template), &mut [], false, false, 90000, &mut report);
        assert_eq!(report.verdict(), crate::report::Verdict::Pass);
        assert_eq!(result.video_pid, Some(video_pid));
    }

    #[test]
    fn subsegment_with_one_rap_and_a_ts_packet_passes_and_fills_in_runtime_fields() {
        let template = pmt_psi(0x100, 0x100);
        let video_pid = 0x100;
        let pes = {
            let mut bytes = vec![0x00, 0x00, 0x01, 0xE0, 0x00, 0x00, 0x80, 0x80, 0x05];
            bytes.extend_from_slice(&[0x21, 0x00, 0x01, 0x00, 0x01]); // PTS = 0
            bytes.extend_from_slice(&[0x00, 0x00, 0x01, 0x65, 0x88]); // IDR slice NAL
            bytes
        };
        let packet = ts_packet_with_rai(video_pid, true, &pes);
        let bytes = concat(&[packet]);

        let mut subsegments = vec![bare_subsegment(0, TS_PACKET_SIZE as u64, 0)];
        let mut report = Report::new();
        let result = validate(
            &bytes,
            Profile::Full,
            SegmentKind::Media,
            Some(&template),
            &mut subsegments,
            false,
            false,
            90000,
            &mut report,
        );
        assert_eq!(report.verdict(), crate::report::Verdict::Pass, "{:?}", report.findings());
        assert_eq!(result.video_pid, Some(video_pid));
        assert!(subsegments[0].saw_random_access);
        assert_eq!(subsegments[0].ts_count, 1);
        assert_eq!(subsegments[0].pes_count, 1);
        assert_eq!(subsegments[0].ssix_offset_index, 1);
    }

    #[test]
    fn subsegment_with_no_random_access_point_fails() {
        let template = pmt_psi(0x100, 0x100);
        let video_pid = 0x100;
        let pes = {
            let mut bytes = vec![0x00, 0x00, 0x01, 0xE0, 0x00, 0x00, 0x80, 0x80, 0x05];
            bytes.extend_from_slice(&[0x21, 0x00, 0x01, 0x00, 0x01]); // PTS = 0
            bytes.extend_from_slice(&[0x00, 0x00, 0x01, 0x65, 0x88]); // IDR slice NAL
            bytes
        };
        let packet = ts_packet(video_pid, true, &pes); // no adaptation field, so no RAI
        let bytes = concat(&[packet]);

        let mut subsegments = vec![bare_subsegment(0, TS_PACKET_SIZE as u64, 0)];
        let mut report = Report::new();
        validate(
            &bytes,
            Profile::Full,
            SegmentKind::Media,
            Some(&template),
            &mut subsegments,
            false,
            false,
            90000,
            &mut report,
        );
        assert_eq!(report.verdict(), crate::report::Verdict::Fail);
        assert!(!subsegments[0].saw_random_access);
    }

    #[test]
    fn subsegment_with_no_ts_packets_fails() {
        let mut subsegments = vec![bare_subsegment(0, TS_PACKET_SIZE as u64, 0)];
        let mut report = Report::new();
        validate(&[], Profile::Full, SegmentKind::Media, None, &mut subsegments, false, false, 90000, &mut report);
        assert_eq!(report.verdict(), crate::report::Verdict::Fail);
        assert_eq!(subsegments[0].ts_count, 0);
    }
}
