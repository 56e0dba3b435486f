//! Deterministic quality scoring of execution results.
//!
//! [`ReportAnalyzer::analyze`] is a pure function of an
//! [`ExecutionResult`] and the session's requirements and test criteria.
//! The same inputs always produce the same [`Report`].
//!
//! # Check markers
//!
//! Generated programs are asked to self-check every requirement and
//! criterion and print one line per check:
//!
//! ```text
//! PASS: factorial(0) == 1
//! FAIL: factorial(5) == 120: got 119
//! ```
//!
//! Markers are matched to checks by normalized text (case, whitespace and
//! trailing punctuation are ignored).
//!
//! # Scoring
//!
//! | Component | Points | Rule |
//! |---|---|---|
//! | execution | 40 | exit code 0 inside the time limit |
//! | checks | 50 | split evenly; PASS = full share, no marker on a clean exit = half, otherwise 0. No checks at all: full 50 on a clean exit |
//! | hygiene | 10 | 5 for empty stderr, 5 for non-empty stdout |
//!
//! Then caps apply: a timeout caps at 20, a non-zero exit or a signal kill
//! caps at 30.

use std::collections::{BTreeMap, HashSet};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::sandbox::ExecutionResult;

/// Points for a clean exit.
pub const EXECUTION_POINTS: f64 = 40.0;
/// Points shared by all checks.
pub const CHECK_POINTS: f64 = 50.0;
/// Points for an empty stderr.
pub const QUIET_STDERR_POINTS: f64 = 5.0;
/// Points for producing any stdout.
pub const STDOUT_POINTS: f64 = 5.0;
/// Score ceiling for timed-out runs.
pub const TIMEOUT_CAP: u8 = 20;
/// Score ceiling for non-zero or signal exits.
pub const CRASH_CAP: u8 = 30;

/// Outcome of one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Fail,
    /// Clean exit but the program never reported on this check
    Unverified,
}

/// Where a check came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckSource {
    Requirement,
    Criterion,
}

/// Per-check verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriterionResult {
    pub status: CheckStatus,
    pub source: CheckSource,
    pub why: String,
}

impl CriterionResult {
    /// Whether this check passed outright.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.status == CheckStatus::Pass
    }
}

/// Points per component before caps.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub execution: f64,
    pub checks: f64,
    pub hygiene: f64,
    /// Ceiling applied, if any
    pub cap: Option<u8>,
}

/// Quality report for one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// 0..=100
    pub score: u8,
    /// Keyed by the check text, ordered
    pub criteria_results: BTreeMap<String, CriterionResult>,
    pub summary_text: String,
    pub breakdown: ScoreBreakdown,
}

impl Report {
    /// Checks that did not pass outright, in key order.
    pub fn unmet(&self) -> impl Iterator<Item = (&String, &CriterionResult)> {
        self.criteria_results.iter().filter(|(_, r)| !r.passed())
    }

    /// Count of passed checks.
    #[must_use]
    pub fn passed_count(&self) -> usize {
        self.criteria_results.values().filter(|r| r.passed()).count()
    }
}

/// What a quick test should check for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TestType {
    /// Only that the program runs cleanly
    #[default]
    Smoke,
    /// The program's own tests pass
    Unit,
    /// Tests and edge cases pass
    Full,
}

impl TestType {
    /// Criteria implied by this test type.
    #[must_use]
    pub fn criteria(&self) -> Vec<String> {
        match self {
            Self::Smoke => Vec::new(),
            Self::Unit => vec!["all tests pass".to_string()],
            Self::Full => vec![
                "all tests pass".to_string(),
                "all edge cases pass".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkerKind {
    Pass,
    Fail,
}

#[derive(Debug, Clone)]
struct Marker {
    kind: MarkerKind,
    text: String,
}

/// `PASS: <text>` or `FAIL: <text>: <why>`, case-insensitive.
const MARKER_PATTERN: &str = r"(?i)^\s*(PASS|FAIL)\s*:\s*(.+?)\s*$";

/// Canonical form of a check text; two checks with the same form are the
/// same check.
pub(crate) fn normalize(text: &str) -> String {
    let collapsed = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    collapsed
        .trim_end_matches(['.', ';', ',', ' '])
        .to_string()
}

fn parse_markers(stdout: &str) -> Vec<Marker> {
    let Ok(re) = Regex::new(MARKER_PATTERN) else {
        return Vec::new();
    };
    stdout
        .lines()
        .filter_map(|line| {
            let caps = re.captures(line)?;
            let kind = if caps[1].eq_ignore_ascii_case("pass") {
                MarkerKind::Pass
            } else {
                MarkerKind::Fail
            };
            Some(Marker {
                kind,
                text: normalize(&caps[2]),
            })
        })
        .collect()
}

/// Find the verdict for `check` among `markers`. Any FAIL wins over PASS.
fn match_check(check: &str, markers: &[Marker]) -> Option<(MarkerKind, String)> {
    let key = normalize(check);
    let prefix = format!("{}:", key);
    let mut verdict: Option<(MarkerKind, String)> = None;
    for marker in markers {
        let detail = if marker.text == key {
            String::new()
        } else if let Some(rest) = marker.text.strip_prefix(&prefix) {
            rest.trim().to_string()
        } else {
            continue;
        };
        match (marker.kind, &verdict) {
            (MarkerKind::Fail, _) => return Some((MarkerKind::Fail, detail)),
            (MarkerKind::Pass, None) => verdict = Some((MarkerKind::Pass, detail)),
            (MarkerKind::Pass, Some(_)) => {}
        }
    }
    verdict
}

fn describe_exit(result: &ExecutionResult) -> String {
    if result.timed_out {
        format!("timed out after {}ms", result.duration_ms)
    } else {
        match result.exit_code {
            Some(code) => format!("exit code {} in {}ms", code, result.duration_ms),
            None => format!("killed by signal after {}ms", result.duration_ms),
        }
    }
}

/// Scores execution results.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportAnalyzer;

impl ReportAnalyzer {
    /// Create an analyzer.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Score `result` against the session's checks.
    #[must_use]
    pub fn analyze(
        &self,
        result: &ExecutionResult,
        requirements: &[String],
        test_criteria: &[String],
    ) -> Report {
        let clean = result.is_clean_exit();
        let markers = parse_markers(&result.stdout);

        // One entry per distinct check; the first occurrence keeps its source.
        let mut seen = HashSet::new();
        let checks: Vec<(&String, CheckSource)> = requirements
            .iter()
            .map(|r| (r, CheckSource::Requirement))
            .chain(test_criteria.iter().map(|c| (c, CheckSource::Criterion)))
            .filter(|(check, _)| seen.insert(normalize(check)))
            .collect();

        let mut criteria_results = BTreeMap::new();
        let mut check_points = 0.0;
        let share = if checks.is_empty() {
            0.0
        } else {
            CHECK_POINTS / checks.len() as f64
        };

        for (check, source) in &checks {
            let (status, why, points) = match match_check(check, &markers) {
                Some((MarkerKind::Pass, detail)) => {
                    let why = if detail.is_empty() {
                        "reported PASS".to_string()
                    } else {
                        format!("reported PASS: {}", detail)
                    };
                    (CheckStatus::Pass, why, share)
                }
                Some((MarkerKind::Fail, detail)) => {
                    let why = if detail.is_empty() {
                        "reported FAIL".to_string()
                    } else {
                        format!("reported FAIL: {}", detail)
                    };
                    (CheckStatus::Fail, why, 0.0)
                }
                None if clean => (
                    CheckStatus::Unverified,
                    "no PASS/FAIL line printed for this check".to_string(),
                    share / 2.0,
                ),
                None => (
                    CheckStatus::Fail,
                    format!("not reported and program {}", describe_exit(result)),
                    0.0,
                ),
            };
            check_points += points;
            criteria_results.insert(
                (*check).clone(),
                CriterionResult {
                    status,
                    source: *source,
                    why,
                },
            );
        }

        if checks.is_empty() && clean {
            check_points = CHECK_POINTS;
        }

        let execution_points = if clean { EXECUTION_POINTS } else { 0.0 };
        let mut hygiene_points = 0.0;
        if result.stderr.trim().is_empty() {
            hygiene_points += QUIET_STDERR_POINTS;
        }
        if !result.stdout.trim().is_empty() {
            hygiene_points += STDOUT_POINTS;
        }

        let cap = if result.timed_out {
            Some(TIMEOUT_CAP)
        } else if result.exit_code != Some(0) {
            Some(CRASH_CAP)
        } else {
            None
        };

        let raw = (execution_points + check_points + hygiene_points).round();
        let mut score = raw.clamp(0.0, 100.0) as u8;
        if let Some(cap) = cap {
            score = score.min(cap);
        }

        let passed = criteria_results
            .values()
            .filter(|r: &&CriterionResult| r.status == CheckStatus::Pass)
            .count();
        let unverified = criteria_results
            .values()
            .filter(|r: &&CriterionResult| r.status == CheckStatus::Unverified)
            .count();

        let mut summary = format!(
            "Program {} ({}); {}/{} checks passed",
            describe_exit(result),
            result.backend_kind,
            passed,
            checks.len()
        );
        if unverified > 0 {
            summary.push_str(&format!(", {} unverified", unverified));
        }
        if result.timed_out {
            summary.push_str("; execution timed out");
        } else if !clean {
            summary.push_str("; execution failed");
        }
        if result.was_truncated() {
            summary.push_str("; output truncated");
        }
        summary.push_str(&format!("; score {}", score));

        Report {
            score,
            criteria_results,
            summary_text: summary,
            breakdown: ScoreBreakdown {
                execution: execution_points,
                checks: check_points,
                hygiene: hygiene_points,
                cap,
            },
        }
    }
}
