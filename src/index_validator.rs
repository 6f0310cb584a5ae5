//! Index-segment validator (§4.3): walks a flat `styp`/`sidx`/`ssix`/`pcrb` box list and
//! builds the per-segment [`Subsegment`] lists the segment validator consumes.

use crate::bmff::{self, BoxData, Sidx};
use crate::manifest::Segment;
use crate::reader::Reader;
use crate::report::Report;
use crate::Profile;

const BRAND_SISX: u32 = 0x73697378; // "sisx"
const BRAND_RISX: u32 = 0x72697378; // "risx"
const BRAND_SSSS: u32 = 0x73737373; // "ssss"

/// Which kind of index file is being validated: one per representation, or one per
/// single media segment.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IndexKind {
    Single,
    Representation,
}

/// One derived subsegment, consumed by the segment validator (§3.5).
///
/// `saw_random_access`, `ts_count`, `pes_count`, and `ssix_offset_index` start at their
/// defaults here and are filled in by the segment validator as it walks the subsegment's
/// actual TS packets; the index validator only has the byte/time layout sidx declares.
#[derive(Debug, Clone, PartialEq)]
pub struct Subsegment {
    pub reference_id: u32,
    pub start_time: u64,
    pub start_byte: u64,
    pub end_byte: u64,
    pub starts_with_sap: bool,
    pub sap_type: u8,
    pub ssix_offsets: Vec<u64>,
    /// Whether exactly one random access point was found at this subsegment's declared
    /// start byte/time while walking its packets.
    pub saw_random_access: bool,
    /// Number of TS packets whose position falls within `[start_byte, end_byte)`.
    pub ts_count: u32,
    /// Number of PES runs whose first payload starts within `[start_byte, end_byte)`.
    pub pes_count: u32,
    /// How many of `ssix_offsets`, in order, have been confirmed to land on a TS sync byte.
    pub ssix_offset_index: usize,
}

/// The result of validating one index file (§4.3).
#[derive(Debug, Default)]
pub struct IndexSegmentValidator {
    pub error: bool,
    pub segment_subsegments: Vec<Vec<Subsegment>>,
}

fn has_brand(compatible_brands: &[u32], brand: u32) -> bool {
    compatible_brands.contains(&brand)
}

/// Converts a value on `timescale` to the 90 kHz presentation clock, mirroring
/// `manifest::scale_to_90khz` for box-native fields that arrive off the manifest's ingest
/// path (§3.1).
fn scale_to_90khz(value: u64, timescale: u32) -> u64 {
    let timescale = timescale.max(1) as u64;
    value * 90000 / timescale
}

/// Checks a top-level sidx's `earliest_presentation_time` against the segment it opens
/// (§4.3 step 4). `sidx`'s own field is on the representation's media timeline; subtracting
/// the (already 90 kHz) `presentation_time_offset` maps it onto the same presentation
/// timeline `segment.start` is expressed on.
fn check_earliest_presentation_time(
    sidx: &Sidx,
    segment: &Segment,
    timescale: u32,
    presentation_time_offset: u64,
    report: &mut Report,
) -> bool {
    let media_time = scale_to_90khz(sidx.earliest_presentation_time, timescale);
    let presentation_time = media_time.saturating_sub(presentation_time_offset);
    if presentation_time != segment.start {
        report.fail(
            "ISO/IEC 14496-12 8.16.3",
            format!(
                "sidx earliest_presentation_time ({}) disagrees with the segment's declared start ({})",
                presentation_time, segment.start
            ),
        );
        return false;
    }
    true
}

/// Validates `data`, the bytes of an index file, against `segments` (the owning
/// representation's segment list, or a single-element slice for a per-segment index),
/// the adaptation set's `video_pid`, and the representation's declared `timescale` and
/// `presentation_time_offset` (already 90 kHz, per `manifest::load`).
pub fn validate(
    data: &[u8],
    segments: &[Segment],
    video_pid: u32,
    timescale: u32,
    presentation_time_offset: u64,
    profile: Profile,
    kind: IndexKind,
    report: &mut Report,
) -> IndexSegmentValidator {
    let mut reader = Reader::new(data);
    let boxes = match bmff::parse_boxes(&mut reader) {
        Ok(b) => b,
        Err(e) => {
            report.fail("ISO/IEC 14496-12 4.2", format!("index file failed to parse: {}", e));
            return IndexSegmentValidator {
                error: true,
                segment_subsegments: Vec::new(),
            };
        }
    };

    let mut result = IndexSegmentValidator::default();

    let mut iter = boxes.iter();
    let styp = match iter.next() {
        Some(b) => match &b.data {
            BoxData::Styp(styp) => styp,
            _ => {
                report.fail("ISO/IEC 14496-12 8.16.3", "index file does not begin with a styp box");
                result.error = true;
                return result;
            }
        },
        None => {
            report.fail("ISO/IEC 14496-12 8.16.3", "index file is empty");
            result.error = true;
            return result;
        }
    };

    let required_brand = match kind {
        IndexKind::Single => BRAND_SISX,
        IndexKind::Representation => BRAND_RISX,
    };
    if !has_brand(&styp.compatible_brands, required_brand) {
        report.fail(
            "ISO/IEC 23009-1 5.3.9.2",
            "styp compatible_brands does not include the expected index brand",
        );
        result.error = true;
    }
    let ssix_enabled = has_brand(&styp.compatible_brands, BRAND_SSSS);

    let mut remaining = iter;

    let master: Option<&Sidx> = if matches!(kind, IndexKind::Representation) {
        match remaining.next().map(|b| &b.data) {
            Some(BoxData::Sidx(sidx)) => {
                if sidx.references.len() != segments.len() {
                    report.fail(
                        "ISO/IEC 14496-12 8.16.3",
                        "master sidx reference_count does not match the segment list length",
                    );
                    result.error = true;
                }
                if sidx.reference_id != video_pid as u32 {
                    report.fail("ISO/IEC 14496-12 8.16.3", "master sidx reference_id does not match video_pid");
                    result.error = true;
                }
                for (i, r) in sidx.references.iter().enumerate() {
                    if !r.reference_type {
                        report.fail("ISO/IEC 14496-12 8.16.3", "master sidx reference is not a nested reference");
                        result.error = true;
                    }
                    if let Some(segment) = segments.get(i) {
                        if r.subsegment_duration as u64 != segment.duration {
                            report.fail(
                                "ISO/IEC 14496-12 8.16.3",
                                format!("master sidx reference {} duration disagrees with the manifest segment", i),
                            );
                            result.error = true;
                        }
                    }
                }
                if let Some(first_segment) = segments.first() {
                    if !check_earliest_presentation_time(
                        sidx,
                        first_segment,
                        timescale,
                        presentation_time_offset,
                        report,
                    ) {
                        result.error = true;
                    }
                }
                Some(sidx)
            }
            _ => {
                report.fail("ISO/IEC 14496-12 8.16.3", "representation index's second box is not a sidx");
                result.error = true;
                None
            }
        }
    } else {
        None
    };

    let mut segment_idx: usize = 0;
    let mut running_size: u64 = 0;
    let mut num_nested_sidx: i64 = 0;
    let mut byte_cursor: u64 = 0;
    let mut current_time: u64 = segments.get(0).map(|s| s.start).unwrap_or(0);
    let mut current_subsegments: Vec<Subsegment> = Vec::new();
    let mut last_sidx: Option<Sidx> = None;
    let mut ssix_seen_since_sidx = false;
    let mut pcrb_seen_since_sidx = false;

    for b in remaining {
        match &b.data {
            BoxData::Sidx(sidx) => {
                ssix_seen_since_sidx = false;
                pcrb_seen_since_sidx = false;
                let opens_segment = num_nested_sidx == 0;
                if num_nested_sidx > 0 {
                    num_nested_sidx -= 1;
                } else if segment_idx > 0 || !current_subsegments.is_empty() || last_sidx.is_some() {
                    if let Some(master) = master {
                        if let Some(expected) = master.references.get(segment_idx) {
                            if running_size != 0 && running_size != expected.referenced_size as u64 {
                                report.fail(
                                    "ISO/IEC 14496-12 8.16.3",
                                    "accumulated segment size disagrees with the master sidx reference",
                                );
                                result.error = true;
                            }
                        }
                    }
                    if !current_subsegments.is_empty() {
                        result.segment_subsegments.push(std::mem::take(&mut current_subsegments));
                        segment_idx += 1;
                    }
                    running_size = 0;
                    current_time = segments.get(segment_idx).map(|s| s.start).unwrap_or(current_time);
                }

                if sidx.reference_id != video_pid as u32 {
                    report.fail("ISO/IEC 14496-12 8.16.3", "sidx reference_id does not match video_pid");
                    result.error = true;
                }

                if opens_segment && master.is_none() {
                    if let Some(segment) = segments.get(segment_idx) {
                        if !check_earliest_presentation_time(sidx, segment, timescale, presentation_time_offset, report)
                        {
                            result.error = true;
                        }
                    }
                }

                let media_refs = sidx.references.iter().filter(|r| !r.reference_type).count();
                let nested_refs = sidx.references.iter().filter(|r| r.reference_type).count();
                if matches!(profile, Profile::Mp2tSimple) && media_refs > 0 && nested_refs > 0 {
                    report.fail(
                        "ISO/IEC 23009-1 8.6",
                        "sidx mixes media and nested references under the mp2t-simple profile",
                    );
                    result.error = true;
                }
                num_nested_sidx += nested_refs as i64;

                byte_cursor += sidx.first_offset;
                for r in &sidx.references {
                    let start_byte = byte_cursor;
                    let end_byte = byte_cursor + r.referenced_size as u64;
                    if !r.reference_type {
                        current_subsegments.push(Subsegment {
                            reference_id: sidx.reference_id,
                            start_time: current_time + r.sap_delta_time as u64,
                            start_byte,
                            end_byte,
                            starts_with_sap: r.starts_with_sap,
                            sap_type: r.sap_type,
                            ssix_offsets: Vec::new(),
                            saw_random_access: false,
                            ts_count: 0,
                            pes_count: 0,
                            ssix_offset_index: 0,
                        });
                        current_time += r.subsegment_duration as u64;
                    }
                    byte_cursor = end_byte;
                }

                running_size += b.size;
                last_sidx = Some(sidx.clone());
            }
            BoxData::Ssix(ssix) => {
                running_size += b.size;
                if !ssix_enabled {
                    report.advise("ssix box present without the ssss brand");
                }
                if ssix_seen_since_sidx {
                    report.fail("ISO/IEC 14496-12 8.16.4.3", "more than one ssix box follows a single sidx");
                    result.error = true;
                }
                if pcrb_seen_since_sidx {
                    report.fail(
                        "ISO/IEC 23009-1 5.3.9.2.5",
                        "pcrb box precedes the ssix documenting the same subsegment run",
                    );
                    result.error = true;
                }
                ssix_seen_since_sidx = true;
                let expected_count = last_sidx
                    .as_ref()
                    .map(|s| s.references.iter().filter(|r| !r.reference_type).count())
                    .unwrap_or(0);
                if ssix.subsegments.len() != expected_count {
                    report.fail(
                        "ISO/IEC 14496-12 8.16.4.3",
                        "ssix subsegment_count disagrees with the preceding sidx's reference count",
                    );
                    result.error = true;
                } else {
                    let offset = current_subsegments.len().saturating_sub(ssix.subsegments.len());
                    for (i, sub) in ssix.subsegments.iter().enumerate() {
                        if let Some(target) = current_subsegments.get_mut(offset + i) {
                            let mut acc = target.start_byte;
                            let mut offsets = Vec::with_capacity(sub.ranges.len());
                            for (_, range_size) in &sub.ranges {
                                offsets.push(acc);
                                acc += *range_size as u64;
                            }
                            target.ssix_offsets = offsets;
                        }
                    }
                }
            }
            BoxData::Pcrb(_) => {
                if pcrb_seen_since_sidx {
                    report.fail("ISO/IEC 23009-1 5.3.9.2.5", "more than one pcrb box follows a single sidx");
                    result.error = true;
                }
                pcrb_seen_since_sidx = true;
                running_size += b.size;
            }
            BoxData::Unknown(t) => {
                report.advise(format!("unknown box type {:08x} in index file", t));
            }
            BoxData::Emsg(_) => {
                report.advise("emsg box unexpected in an index file");
            }
            BoxData::Styp(_) => {
                report.fail("ISO/IEC 14496-12 8.16.3", "unexpected second styp box in index file");
                result.error = true;
            }
        }
    }

    if !current_subsegments.is_empty() {
        result.segment_subsegments.push(current_subsegments);
    }
    if num_nested_sidx != 0 {
        report.fail("ISO/IEC 14496-12 8.16.3", "nested sidx reference count did not balance to zero");
        result.error = true;
    }

    result
}
