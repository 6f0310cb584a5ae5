//! The non-exception conformance channel (§7): `Result<_, Error>` is reserved for parse
//! errors that abort a unit; every conformance check instead pushes a [`Finding`] here
//! and keeps going, so a run reports as many failures as possible.

use log::{info, warn};
use std::fmt;

/// Overall pass/fail outcome of a segment, representation, or run.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Verdict {
    Pass,
    Fail,
}

impl Verdict {
    /// Combines two verdicts: FAIL is absorbing, matching the process exit code being
    /// the logical OR of every segment's verdict.
    pub fn or(self, other: Verdict) -> Verdict {
        if self == Verdict::Fail || other == Verdict::Fail {
            Verdict::Fail
        } else {
            Verdict::Pass
        }
    }

    /// The process exit code for this verdict: zero on PASS, non-zero on FAIL.
    pub fn exit_code(self) -> i32 {
        match self {
            Verdict::Pass => 0,
            Verdict::Fail => 1,
        }
    }
}

/// How serious a [`Finding`] is, and what it does to the enclosing verdict.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Severity {
    /// A conformance failure: flips the verdict to FAIL.
    Critical,
    /// A tolerable anomaly: logged, verdict-neutral.
    Advisory,
}

/// One conformance-engine observation: a clause reference, a message, and a severity.
#[derive(Debug, Clone)]
pub struct Finding {
    pub severity: Severity,
    /// The ISO/IEC 23009-1 (or MPEG-2 Systems) clause this finding references, if any.
    pub clause: Option<&'static str>,
    pub message: String,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.clause {
            Some(clause) => write!(f, "{} ({})", self.message, clause),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Accumulates [`Finding`]s for one validation run and derives the overall [`Verdict`].
#[derive(Debug, Default)]
pub struct Report {
    findings: Vec<Finding>,
    verdict: Option<Verdict>,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a conformance failure: logs at critical level and flips the verdict.
    pub fn fail(&mut self, clause: &'static str, message: impl Into<String>) {
        let message = message.into();
        warn!("FAIL [{}] {}", clause, message);
        self.findings.push(Finding {
            severity: Severity::Critical,
            clause: Some(clause),
            message,
        });
        self.verdict = Some(Verdict::Fail);
    }

    /// Records an advisory: logged, does not affect the verdict.
    pub fn advise(&mut self, message: impl Into<String>) {
        let message = message.into();
        info!("advisory: {}", message);
        self.findings.push(Finding {
            severity: Severity::Advisory,
            clause: None,
            message,
        });
    }

    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    /// The accumulated verdict: PASS unless [`Report::fail`] has been called at least once.
    pub fn verdict(&self) -> Verdict {
        self.verdict.unwrap_or(Verdict::Pass)
    }

    /// Folds another report's findings and verdict into this one.
    pub fn merge(&mut self, other: Report) {
        self.verdict = Some(self.verdict().or(other.verdict()));
        self.findings.extend(other.findings);
    }
}
