//! Top-level control flow (§2, §5): walks periods → adaptation sets → representations,
//! drives the index and segment validators with the right oracles, and folds every
//! unit's findings into one [`Report`].
//!
//! Single-threaded and cooperative, per §5: one representation at a time, one segment at
//! a time, each segment owning its own demultiplexer and PES assemblers for the duration
//! of its validation and nothing else.

use crate::cross_segment::{self, SegmentTiming};
use crate::index_validator::{self, IndexKind, Subsegment};
use crate::manifest::{AdaptationSet, FileRef, Mpd, Representation};
use crate::report::Report;
use crate::segment_validator::{self, SegmentKind};
use crate::Profile;
use log::info;
use std::fs;
use std::io;
use std::path::Path;

fn read_file_ref(base_dir: &Path, file_ref: &FileRef) -> io::Result<Vec<u8>> {
    let bytes = fs::read(base_dir.join(&file_ref.path))?;
    Ok(match &file_ref.byte_range {
        Some(range) => bytes
            .get(range.start as usize..=range.end as usize)
            .unwrap_or(&bytes)
            .to_vec(),
        None => bytes,
    })
}

fn truthy(flag: crate::manifest::TriState) -> bool {
    matches!(flag, crate::manifest::TriState::Bool(true) | crate::manifest::TriState::Integer(_))
}

fn validate_representation(
    base_dir: &Path,
    adaptation_set: &AdaptationSet,
    representation: &Representation,
    profile: Profile,
    report: &mut Report,
) -> Vec<SegmentTiming> {
    let bitstream_switching = truthy(adaptation_set.bitstream_switching);
    let segment_alignment = truthy(adaptation_set.segment_alignment);

    let pmt_template = match &representation.initialization {
        Some(init_ref) => match read_file_ref(base_dir, init_ref) {
            Ok(bytes) => {
                info!("validating initialization segment {}", init_ref.path);
                let result = segment_validator::validate(
                    &bytes,
                    profile,
                    SegmentKind::Initialization,
                    None,
                    &mut [],
                    bitstream_switching,
                    segment_alignment,
                    0,
                    report,
                );
                result.pmt_template
            }
            Err(e) => {
                report.fail("ISO/IEC 23009-1 5.3.9.2", format!("failed to read initialization segment: {}", e));
                None
            }
        },
        None => None,
    };

    let representation_subsegments: Option<Vec<Vec<Subsegment>>> = match &representation.index {
        Some(index_ref) => match read_file_ref(base_dir, index_ref) {
            Ok(bytes) => {
                let video_pid = adaptation_set.video_pid.unwrap_or(0) as u32;
                let result = index_validator::validate(
                    &bytes,
                    &representation.segments,
                    video_pid,
                    representation.timescale,
                    representation.presentation_time_offset,
                    profile,
                    IndexKind::Representation,
                    report,
                );
                Some(result.segment_subsegments)
            }
            Err(e) => {
                report.fail("ISO/IEC 14496-12 8.16.3", format!("failed to read representation index: {}", e));
                None
            }
        },
        None => None,
    };

    let mut timings = Vec::with_capacity(representation.segments.len());

    for (seg_idx, segment) in representation.segments.iter().enumerate() {
        let mut subsegments: Vec<Subsegment> = if let Some(per_rep) = &representation_subsegments {
            per_rep.get(seg_idx).cloned().unwrap_or_default()
        } else if let Some(index_ref) = &segment.index {
            match read_file_ref(base_dir, index_ref) {
                Ok(bytes) => {
                    let video_pid = adaptation_set.video_pid.unwrap_or(0) as u32;
                    let result = index_validator::validate(
                        &bytes,
                        std::slice::from_ref(segment),
                        video_pid,
                        representation.timescale,
                        representation.presentation_time_offset,
                        profile,
                        IndexKind::Single,
                        report,
                    );
                    result.segment_subsegments.into_iter().next().unwrap_or_default()
                }
                Err(e) => {
                    report.fail("ISO/IEC 14496-12 8.16.3", format!("failed to read segment index: {}", e));
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let bytes = match read_file_ref(base_dir, &segment.media) {
            Ok(b) => b,
            Err(e) => {
                report.fail("ISO/IEC 23009-1 5.3.9.2", format!("failed to read media segment: {}", e));
                continue;
            }
        };

        info!("validating media segment {}", segment.media.path);
        let result = segment_validator::validate(
            &bytes,
            profile,
            SegmentKind::Media,
            pmt_template.as_ref(),
            &mut subsegments,
            bitstream_switching,
            segment_alignment,
            segment.duration,
            report,
        );

        let (pmt_program_number, pmt_version) = result
            .pmt_template
            .as_ref()
            .map(|pmt| {
                (
                    pmt.table_syntax.map(|t| t.table_id_extension()),
                    pmt.table_syntax.map(|t| t.version()),
                )
            })
            .unwrap_or((None, None));

        timings.push(SegmentTiming {
            declared_start: segment.start,
            declared_end: segment.start + segment.duration,
            actual_start: result.actual_start,
            actual_end: result.actual_end,
            video_pid: result.video_pid,
            audio_pid: result.audio_pid,
            pcr_pid: result.pcr_pid,
            pmt_program_number,
            pmt_version,
        });
    }

    timings
}

/// Validates every representation of every adaptation set of every period in `mpd`,
/// enforcing `profile` (the CLI-selected override per §6), and returns the aggregate
/// [`Report`].
pub fn run(base_dir: &Path, mpd: &Mpd, profile: Profile) -> Report {
    let mut report = Report::new();

    for period in &mpd.periods {
        for adaptation_set in &period.adaptation_sets {
            let mut representation_timings = Vec::with_capacity(adaptation_set.representations.len());
            for representation in &adaptation_set.representations {
                let timings = validate_representation(base_dir, adaptation_set, representation, profile, &mut report);
                representation_timings.push(timings);
            }
            cross_segment::check(&representation_timings, profile, &mut report);
        }
    }

    report
}
