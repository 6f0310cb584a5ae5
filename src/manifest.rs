//! DASH manifest (MPD) object model and a minimal best-effort XML reader (§3.1).
//!
//! The reader performs no schema validation — it maps elements/attributes onto the
//! object model, defaulting absent optional attributes, and converts every time value
//! to the 90 kHz presentation clock at ingest. Parent/child links are index handles
//! (`PeriodIdx`, `AdaptationSetIdx`, `RepresentationIdx`) rather than owning
//! back-pointers, per the REDESIGN FLAGS in `spec.md` §9.

use serde::Deserialize;
use std::fmt;

/// A `{unset, bool, integer}` flag, as MPD's `segmentAlignment`/`bitstreamSwitching`
/// attributes may be absent, `"true"`/`"false"`, or an integer grouping id.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TriState {
    Unset,
    Bool(bool),
    Integer(u64),
}

impl TriState {
    fn parse(raw: Option<&str>) -> Self {
        match raw {
            None => TriState::Unset,
            Some("true") => TriState::Bool(true),
            Some("false") => TriState::Bool(false),
            Some(other) => other.parse::<u64>().map(TriState::Integer).unwrap_or(TriState::Unset),
        }
    }
}

/// An inclusive byte range, as found in a `@range` attribute (`"start-end"`).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    fn parse(raw: &str) -> Option<Self> {
        let (start, end) = raw.split_once('-')?;
        Some(Self {
            start: start.parse().ok()?,
            end: end.parse().ok()?,
        })
    }
}

/// A reference to a file (media, initialization, index, or bitstream-switching segment)
/// plus its optional byte range within that file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    pub path: String,
    pub byte_range: Option<ByteRange>,
}

/// One media segment (§3.1).
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub media: FileRef,
    /// Presentation start time, 90 kHz clock.
    pub start: u64,
    /// Duration, 90 kHz clock.
    pub duration: u64,
    pub index: Option<FileRef>,
}

/// Opaque index into [`Mpd::periods`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct PeriodIdx(pub usize);
/// Opaque index into a period's adaptation sets.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct AdaptationSetIdx(pub usize);
/// Opaque index into an adaptation set's representations.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct RepresentationIdx(pub usize);

/// One representation within an adaptation set (§3.1).
#[derive(Debug, Clone, PartialEq)]
pub struct Representation {
    pub bandwidth: u64,
    /// 90 kHz clock.
    pub presentation_time_offset: u64,
    pub timescale: u32,
    /// 0-6, per ISO/IEC 23009-1 Table 4.
    pub start_with_sap: u8,
    pub initialization: Option<FileRef>,
    pub index: Option<FileRef>,
    pub bitstream_switching: Option<FileRef>,
    pub segments: Vec<Segment>,
}

/// One adaptation set within a period (§3.1).
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptationSet {
    pub profile: String,
    pub mime_type: String,
    pub audio_pid: Option<u16>,
    pub video_pid: Option<u16>,
    pub bitstream_switching: TriState,
    pub segment_alignment: TriState,
    pub representations: Vec<Representation>,
}

/// One period within an MPD (§3.1).
#[derive(Debug, Clone, PartialEq)]
pub struct Period {
    /// 90 kHz clock.
    pub duration: u64,
    pub adaptation_sets: Vec<AdaptationSet>,
}

/// The complete, read-only manifest object model (§3.1, §3.6).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Mpd {
    pub periods: Vec<Period>,
}

/// An error encountered while reading or interpreting an MPD file.
#[derive(Debug)]
pub struct ManifestError(pub String);

impl fmt::Display for ManifestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed manifest: {}", self.0)
    }
}

impl std::error::Error for ManifestError {}

/// Parses an ISO 8601 duration of the restricted `PT#H#M#S` form MPD uses, returning
/// 90 kHz presentation-clock ticks. Unrecognised input yields zero rather than an error,
/// matching the manifest reader's best-effort contract.
fn parse_duration_90khz(raw: &str) -> u64 {
    let raw = match raw.strip_prefix("PT") {
        Some(r) => r,
        None => return 0,
    };
    let mut seconds = 0.0_f64;
    let mut number = String::new();
    for c in raw.chars() {
        match c {
            '0'..='9' | '.' => number.push(c),
            'H' => {
                seconds += number.parse::<f64>().unwrap_or(0.0) * 3600.0;
                number.clear();
            }
            'M' => {
                seconds += number.parse::<f64>().unwrap_or(0.0) * 60.0;
                number.clear();
            }
            'S' => {
                seconds += number.parse::<f64>().unwrap_or(0.0);
                number.clear();
            }
            _ => {}
        }
    }
    (seconds * 90000.0).round() as u64
}

#[derive(Debug, Deserialize)]
#[serde(rename = "MPD")]
struct MpdXml {
    #[serde(rename = "Period", default)]
    period: Vec<PeriodXml>,
}

#[derive(Debug, Deserialize)]
struct PeriodXml {
    #[serde(rename = "@duration", default)]
    duration: Option<String>,
    #[serde(rename = "AdaptationSet", default)]
    adaptation_set: Vec<AdaptationSetXml>,
}

#[derive(Debug, Deserialize)]
struct AdaptationSetXml {
    #[serde(rename = "@profiles", default)]
    profiles: Option<String>,
    #[serde(rename = "@mimeType", default)]
    mime_type: Option<String>,
    #[serde(rename = "@audioPid", default)]
    audio_pid: Option<String>,
    #[serde(rename = "@videoPid", default)]
    video_pid: Option<String>,
    #[serde(rename = "@bitstreamSwitching", default)]
    bitstream_switching: Option<String>,
    #[serde(rename = "@segmentAlignment", default)]
    segment_alignment: Option<String>,
    #[serde(rename = "Representation", default)]
    representation: Vec<RepresentationXml>,
}

#[derive(Debug, Deserialize)]
struct RepresentationXml {
    #[serde(rename = "@bandwidth", default)]
    bandwidth: Option<u64>,
    #[serde(rename = "@presentationTimeOffset", default)]
    presentation_time_offset: Option<u64>,
    #[serde(rename = "@timescale", default)]
    timescale: Option<u32>,
    #[serde(rename = "@startWithSAP", default)]
    start_with_sap: Option<u8>,
    #[serde(rename = "Initialization", default)]
    initialization: Option<UrlXml>,
    #[serde(rename = "RepresentationIndex", default)]
    representation_index: Option<UrlXml>,
    #[serde(rename = "BitstreamSwitching", default)]
    bitstream_switching: Option<UrlXml>,
    #[serde(rename = "SegmentURL", default)]
    segment_url: Vec<SegmentUrlXml>,
}

#[derive(Debug, Deserialize)]
struct UrlXml {
    #[serde(rename = "@sourceURL", default)]
    source_url: Option<String>,
    #[serde(rename = "@range", default)]
    range: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SegmentUrlXml {
    #[serde(rename = "@media", default)]
    media: Option<String>,
    #[serde(rename = "@mediaRange", default)]
    media_range: Option<String>,
    #[serde(rename = "@index", default)]
    index: Option<String>,
    #[serde(rename = "@indexRange", default)]
    index_range: Option<String>,
    #[serde(rename = "@startTime", default)]
    start_time: Option<u64>,
    #[serde(rename = "@duration", default)]
    duration: Option<u64>,
}

/// Converts a value expressed on a representation's declared `@timescale` to the 90 kHz
/// presentation clock every timing field in the object model is recorded on (§3.1).
fn scale_to_90khz(value: u64, timescale: u32) -> u64 {
    let timescale = timescale.max(1) as u64;
    value * 90000 / timescale
}

fn url_to_file_ref(url: &UrlXml) -> Option<FileRef> {
    let path = url.source_url.clone()?;
    Some(FileRef {
        path,
        byte_range: url.range.as_deref().and_then(ByteRange::parse),
    })
}

/// Reads and interprets an MPD document's bytes into the object model.
pub fn load(xml: &[u8]) -> Result<Mpd, ManifestError> {
    let raw: MpdXml = quick_xml::de::from_reader(xml).map_err(|e| ManifestError(e.to_string()))?;

    let periods = raw
        .period
        .into_iter()
        .map(|p| Period {
            duration: p.duration.as_deref().map(parse_duration_90khz).unwrap_or(0),
            adaptation_sets: p
                .adaptation_set
                .into_iter()
                .map(|a| AdaptationSet {
                    profile: a.profiles.unwrap_or_default(),
                    mime_type: a.mime_type.unwrap_or_default(),
                    audio_pid: a.audio_pid.as_deref().and_then(|s| s.parse().ok()),
                    video_pid: a.video_pid.as_deref().and_then(|s| s.parse().ok()),
                    bitstream_switching: TriState::parse(a.bitstream_switching.as_deref()),
                    segment_alignment: TriState::parse(a.segment_alignment.as_deref()),
                    representations: a
                        .representation
                        .into_iter()
                        .map(|r| {
                            let timescale = r.timescale.unwrap_or(90000);
                            Representation {
                                bandwidth: r.bandwidth.unwrap_or(0),
                                presentation_time_offset: scale_to_90khz(
                                    r.presentation_time_offset.unwrap_or(0),
                                    timescale,
                                ),
                                timescale,
                                start_with_sap: r.start_with_sap.unwrap_or(0),
                                initialization: r.initialization.as_ref().and_then(url_to_file_ref),
                                index: r.representation_index.as_ref().and_then(url_to_file_ref),
                                bitstream_switching: r.bitstream_switching.as_ref().and_then(url_to_file_ref),
                                segments: r
                                    .segment_url
                                    .into_iter()
                                    .map(|s| Segment {
                                        media: FileRef {
                                            path: s.media.unwrap_or_default(),
                                            byte_range: s.media_range.as_deref().and_then(ByteRange::parse),
                                        },
                                        start: scale_to_90khz(s.start_time.unwrap_or(0), timescale),
                                        duration: scale_to_90khz(s.duration.unwrap_or(0), timescale),
                                        index: {
                                            let index_range = s.index_range.as_deref().and_then(ByteRange::parse);
                                            s.index.map(|path| FileRef {
                                                path,
                                                byte_range: index_range,
                                            })
                                        },
                                    })
                                    .collect(),
                            }
                        })
                        .collect(),
                })
                .collect(),
        })
        .collect();

    Ok(Mpd { periods })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_mpd() {
        let xml = br#"<MPD>
            <Period duration="PT30S">
                <AdaptationSet mimeType="video/mp2t" segmentAlignment="true" videoPid="256">
                    <Representation bandwidth="500000" timescale="90000" startWithSAP="1">
                        <Initialization sourceURL="init.ts" range="0-187"/>
                        <SegmentURL media="seg1.ts" mediaRange="188-4000" startTime="0" duration="2700000"/>
                    </Representation>
                </AdaptationSet>
            </Period>
        </MPD>"#;
        let mpd = load(xml).unwrap();
        assert_eq!(mpd.periods.len(), 1);
        let period = &mpd.periods[0];
        assert_eq!(period.duration, 30 * 90000);
        let aset = &period.adaptation_sets[0];
        assert_eq!(aset.video_pid, Some(256));
        assert_eq!(aset.segment_alignment, TriState::Bool(true));
        let rep = &aset.representations[0];
        assert_eq!(rep.start_with_sap, 1);
        assert_eq!(rep.initialization.as_ref().unwrap().path, "init.ts");
        assert_eq!(rep.segments[0].duration, 2700000);
    }

    #[test]
    fn non_90khz_timescale_is_scaled_to_the_presentation_clock() {
        let xml = br#"<MPD>
            <Period duration="PT30S">
                <AdaptationSet mimeType="audio/mp2t" segmentAlignment="true">
                    <Representation bandwidth="128000" timescale="48000" presentationTimeOffset="48000" startWithSAP="1">
                        <SegmentURL media="seg1.ts" startTime="96000" duration="96000"/>
                    </Representation>
                </AdaptationSet>
            </Period>
        </MPD>"#;
        let mpd = load(xml).unwrap();
        let rep = &mpd.periods[0].adaptation_sets[0].representations[0];
        assert_eq!(rep.timescale, 48000);
        assert_eq!(rep.presentation_time_offset, 90000);
        assert_eq!(rep.segments[0].start, 180000);
        assert_eq!(rep.segments[0].duration, 180000);
    }

    #[test]
    fn tri_state_defaults_to_unset() {
        assert_eq!(TriState::parse(None), TriState::Unset);
        assert_eq!(TriState::parse(Some("7")), TriState::Integer(7));
        assert_eq!(TriState::parse(Some("garbage")), TriState::Unset);
    }

    #[test]
    fn byte_range_parses_start_and_end() {
        assert_eq!(ByteRange::parse("0-187"), Some(ByteRange { start: 0, end: 187 }));
        assert_eq!(ByteRange::parse("nonsense"), None);
    }
}
