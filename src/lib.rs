//! Conformance validator for DASH media presentations built on MPEG-2 Transport Stream
//! segments indexed with ISO BMFF segment-index boxes, checked against ISO/IEC 23009-1
//! Annex E/I's `full`, `mp2t-main`, and `mp2t-simple` profiles.
//!
//! The crate is organised bottom-up: [`reader`] and [`ts`] decode the MPEG-2 Systems
//! substrate, [`psi`]/[`pes`]/[`demux`] reassemble PSI sections and PES packets from
//! raw TS packets, [`bmff`] decodes the ISO BMFF boxes carried in segment-index files
//! and `emsg` event messages, [`manifest`] reads the owning MPD, and
//! [`index_validator`]/[`segment_validator`]/[`cross_segment`]/[`emsg`] apply the
//! profile rules themselves. [`orchestrator`] drives a whole presentation through
//! those checkers and folds their [`report::Report`]s into one process exit code.
//!
//! Conformance failures never abort a run (§7): a parse error aborts only the unit
//! being parsed, and is itself reported as a [`report::Finding`] by its caller.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod bmff;
pub mod cets;
pub mod cross_segment;
pub mod demux;
pub mod emsg;
pub mod error;
pub mod index_validator;
pub mod manifest;
pub mod nal;
pub mod orchestrator;
pub mod pes;
pub mod psi;
pub mod reader;
pub mod report;
pub mod segment_validator;
pub mod ts;

/// Which ISO/IEC 23009-1 MPEG-2 TS profile an adaptation set declares (§3.1, §9 GLOSSARY).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Profile {
    /// `urn:mpeg:dash:profile:full:2011` — no additional MPEG-2 TS constraints.
    Full,
    /// `urn:mpeg:dash:profile:mp2t-main:2011`.
    Mp2tMain,
    /// `urn:mpeg:dash:profile:mp2t-simple:2011` — the most constrained profile.
    Mp2tSimple,
}

impl Profile {
    /// Classifies an adaptation set's `@profiles` attribute. Unrecognised or absent
    /// values fall back to [`Profile::Full`], the least constrained profile.
    pub fn parse(raw: &str) -> Self {
        if raw.contains("mp2t-simple") {
            Profile::Mp2tSimple
        } else if raw.contains("mp2t-main") {
            Profile::Mp2tMain
        } else {
            Profile::Full
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_parses_from_urn_substrings() {
        assert_eq!(Profile::parse("urn:mpeg:dash:profile:mp2t-simple:2011"), Profile::Mp2tSimple);
        assert_eq!(Profile::parse("urn:mpeg:dash:profile:mp2t-main:2011"), Profile::Mp2tMain);
        assert_eq!(Profile::parse("urn:mpeg:dash:profile:full:2011"), Profile::Full);
        assert_eq!(Profile::parse("anything else"), Profile::Full);
    }
}
