//! CLI entry point: validates one media segment file in isolation, with no manifest or
//! initialization-segment context (§6).
//!
//! ```text
//! validate_single_segment [-v] [-d[simple|main]] [-b|--byte-range=START-END] SEGMENT_FILE
//! ```

use dash_ts_conformance::report::Verdict;
use dash_ts_conformance::segment_validator::{self, SegmentKind};
use dash_ts_conformance::Profile;
use log::LevelFilter;
use std::process::ExitCode;

fn parse_dash_flag(raw: &str) -> Profile {
    match raw {
        "" => Profile::Mp2tMain,
        "simple" => Profile::Mp2tSimple,
        "main" => Profile::Mp2tMain,
        other => {
            eprintln!("unrecognised -d profile: {}", other);
            Profile::Mp2tMain
        }
    }
}

fn parse_byte_range(raw: &str) -> Option<(usize, usize)> {
    let (start, end) = raw.split_once('-')?;
    let start: usize = start.parse().ok()?;
    let end: usize = end.parse().ok()?;
    if end < start + 188 {
        return None;
    }
    Some((start, end))
}

fn main() -> ExitCode {
    let mut verbosity = 0_u32;
    let mut profile = Profile::Full;
    let mut byte_range: Option<(usize, usize)> = None;
    let mut segment_path: Option<String> = None;

    for arg in std::env::args().skip(1) {
        if arg == "-v" || arg == "--verbose" {
            verbosity += 1;
        } else if let Some(rest) = arg.strip_prefix("-d") {
            profile = parse_dash_flag(rest);
        } else if let Some(rest) = arg.strip_prefix("-b") {
            byte_range = parse_byte_range(rest);
        } else if let Some(rest) = arg.strip_prefix("--byte-range") {
            let rest = rest.strip_prefix('=').unwrap_or(rest);
            byte_range = parse_byte_range(rest);
        } else {
            segment_path = Some(arg);
        }
    }

    let level = match verbosity {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    env_logger::Builder::new().filter_level(level).init();

    let segment_path = match segment_path {
        Some(p) => p,
        None => {
            eprintln!("usage: validate_single_segment [-v] [-d[simple|main]] [-b START-END] SEGMENT_FILE");
            return ExitCode::FAILURE;
        }
    };

    let bytes = match std::fs::read(&segment_path) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("failed to read {}: {}", segment_path, e);
            return ExitCode::FAILURE;
        }
    };
    let slice = match byte_range {
        Some((start, end)) => match bytes.get(start..end) {
            Some(s) => s,
            None => {
                eprintln!("byte range {}-{} is out of bounds for a {}-byte file", start, end, bytes.len());
                return ExitCode::FAILURE;
            }
        },
        None => &bytes[..],
    };

    let mut report = dash_ts_conformance::report::Report::new();
    // No manifest is available in single-segment mode, so there is no declared segment
    // duration to check emsg events against.
    segment_validator::validate(slice, profile, SegmentKind::Media, None, &mut [], false, false, u64::MAX, &mut report);
    for finding in report.findings() {
        println!("{}", finding);
    }

    match report.verdict() {
        Verdict::Pass => ExitCode::SUCCESS,
        Verdict::Fail => ExitCode::FAILURE,
    }
}
