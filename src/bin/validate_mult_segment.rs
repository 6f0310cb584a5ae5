//! CLI entry point: validates every representation of an MPD against an ISO/IEC 23009-1
//! MPEG-2 TS profile (§6).
//!
//! ```text
//! validate_mult_segment [-v|--verbose] [-d[simple|main]|--dash[=simple|main]] MPD_FILE
//! ```

use dash_ts_conformance::manifest;
use dash_ts_conformance::orchestrator;
use dash_ts_conformance::report::Verdict;
use dash_ts_conformance::Profile;
use log::LevelFilter;
use std::path::Path;
use std::process::ExitCode;

fn parse_dash_flag(raw: &str) -> Profile {
    match raw {
        "" => Profile::Mp2tMain,
        "simple" => Profile::Mp2tSimple,
        "main" => Profile::Mp2tMain,
        other => {
            eprintln!("unrecognised -d/--dash profile: {}", other);
            Profile::Mp2tMain
        }
    }
}

fn main() -> ExitCode {
    let mut verbosity = 0_u32;
    let mut profile = Profile::Full;
    let mut mpd_path: Option<String> = None;

    for arg in std::env::args().skip(1) {
        if arg == "-v" || arg == "--verbose" {
            verbosity += 1;
        } else if let Some(rest) = arg.strip_prefix("-d") {
            profile = parse_dash_flag(rest);
        } else if let Some(rest) = arg.strip_prefix("--dash") {
            let rest = rest.strip_prefix('=').unwrap_or(rest);
            profile = parse_dash_flag(rest);
        } else {
            mpd_path = Some(arg);
        }
    }

    let level = match verbosity {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    env_logger::Builder::new().filter_level(level).init();

    let mpd_path = match mpd_path {
        Some(p) => p,
        None => {
            eprintln!("usage: validate_mult_segment [-v] [-d[simple|main]] MPD_FILE");
            return ExitCode::FAILURE;
        }
    };

    let mpd_bytes = match std::fs::read(&mpd_path) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("failed to read {}: {}", mpd_path, e);
            return ExitCode::FAILURE;
        }
    };
    let mpd = match manifest::load(&mpd_bytes) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("failed to parse {}: {}", mpd_path, e);
            return ExitCode::FAILURE;
        }
    };

    let base_dir = Path::new(&mpd_path).parent().unwrap_or_else(|| Path::new("."));
    let report = orchestrator::run(base_dir, &mpd, profile);
    for finding in report.findings() {
        println!("{}", finding);
    }

    match report.verdict() {
        Verdict::Pass => ExitCode::SUCCESS,
        Verdict::Fail => ExitCode::FAILURE,
    }
}
