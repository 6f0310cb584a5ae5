//! Cross-segment checker (§4.9): after every segment of a representation has been
//! validated, compares declared vs. actual timing across the adaptation set's
//! representations and segment indices, and (for `mp2t-simple`) checks identity of the
//! stream-mapping PIDs and PMT version across the whole adaptation set.

use crate::report::Report;
use crate::Profile;

/// One representation's one segment's declared and observed timing and stream mapping,
/// as recorded by [`crate::segment_validator::validate`] and the owning manifest segment.
#[derive(Debug, Clone, Default)]
pub struct SegmentTiming {
    pub declared_start: u64,
    pub declared_end: u64,
    pub actual_start: Option<u64>,
    pub actual_end: Option<u64>,
    pub video_pid: Option<u16>,
    pub audio_pid: Option<u16>,
    pub pcr_pid: Option<u16>,
    pub pmt_program_number: Option<u16>,
    pub pmt_version: Option<u8>,
}

/// Checks timing and (for `mp2t-simple`) identity invariants across `representations`, a
/// `[representation][segment index]` matrix for one adaptation set.
pub fn check(representations: &[Vec<SegmentTiming>], profile: Profile, report: &mut Report) {
    check_timing_matrix(representations, report);
    check_gap_matrix(representations, report);
    if profile == Profile::Mp2tSimple {
        check_identity(representations, report);
    }
}

fn check_timing_matrix(representations: &[Vec<SegmentTiming>], report: &mut Report) {
    for (rep_idx, segments) in representations.iter().enumerate() {
        for (seg_idx, timing) in segments.iter().enumerate() {
            let Some(actual_start) = timing.actual_start else { continue };
            let start_delta = actual_start as i64 - timing.declared_start as i64;
            if start_delta != 0 {
                report.advise(format!(
                    "representation {} segment {}: actual start differs from declared start by {} ticks",
                    rep_idx, seg_idx, start_delta
                ));
                if timing.video_pid.is_some() {
                    report.fail(
                        "ISO/IEC 23009-1 5.3.9.2",
                        format!("representation {} segment {}: video start time disagrees with the manifest", rep_idx, seg_idx),
                    );
                }
            }
            let Some(actual_end) = timing.actual_end else { continue };
            let end_delta = actual_end as i64 - timing.declared_end as i64;
            if end_delta != 0 {
                report.advise(format!(
                    "representation {} segment {}: actual end differs from declared end by {} ticks",
                    rep_idx, seg_idx, end_delta
                ));
                if timing.video_pid.is_some() {
                    report.fail(
                        "ISO/IEC 23009-1 5.3.9.2",
                        format!("representation {} segment {}: video end time disagrees with the manifest", rep_idx, seg_idx),
                    );
                }
            }
        }
    }
}

fn check_gap_matrix(representations: &[Vec<SegmentTiming>], report: &mut Report) {
    for rep1 in representations {
        for rep2 in representations {
            for i in 0..rep1.len().saturating_sub(1) {
                let (Some(end1), Some(next)) = (rep1[i].actual_end, rep2.get(i + 1)) else { continue };
                let Some(start2) = next.actual_start else { continue };
                let gap = start2 as i64 - end1 as i64;
                if gap != 0 {
                    report.advise(format!("gap of {} ticks between segment {} and {}", gap, i, i + 1));
                }
            }
        }
    }
}

fn check_identity(representations: &[Vec<SegmentTiming>], report: &mut Report) {
    let mut video_pids = std::collections::HashSet::new();
    let mut audio_pids = std::collections::HashSet::new();
    let mut pcr_pids = std::collections::HashSet::new();
    let mut pmts = std::collections::HashSet::new();

    for segments in representations {
        for timing in segments {
            if let Some(v) = timing.video_pid {
                video_pids.insert(v);
            }
            if let Some(a) = timing.audio_pid {
                audio_pids.insert(a);
            }
            if let Some(p) = timing.pcr_pid {
                pcr_pids.insert(p);
            }
            if let (Some(program), Some(version)) = (timing.pmt_program_number, timing.pmt_version) {
                pmts.insert((program, version));
            }
        }
    }

    if video_pids.len() > 1 {
        report.fail("ISO/IEC 23009-1 8.6", "video_pid is not identical across all representations and segments");
    }
    if audio_pids.len() > 1 {
        report.fail("ISO/IEC 23009-1 8.6", "audio_pid is not identical across all representations and segments");
    }
    if pcr_pids.len() > 1 {
        report.fail("ISO/IEC 23009-1 8.6", "pcr_pid is not identical across all representations and segments");
    }
    if pmts.len() > 1 {
        report.fail(
            "ISO/IEC 23009-1 8.6",
            "PMT program number/version is not identical across all representations and segments",
        );
    }
}
