//! Per-iteration continue/terminate decisions.
//!
//! The [`Validator`] runs at the VALIDATING boundary of every iteration and
//! applies a fixed rule order:
//!
//! 1. score at or above the quality threshold: success
//! 2. cancellation flag set: cancelled
//! 3. iteration budget spent: max iterations reached
//! 4. otherwise continue, with feedback for the next generation
//!
//! Success is checked before cancellation so a run that already met the bar
//! is never thrown away.

use serde::{Deserialize, Serialize};

use crate::analyzer::{CheckStatus, Report};
use crate::sandbox::ExecutionResult;
use crate::session::TerminalReason;

/// Default length of the stderr excerpt included in feedback.
pub const DEFAULT_STDERR_EXCERPT: usize = 800;

/// What the loop should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationAction {
    Continue,
    TerminateSuccess,
    TerminateMaxIterations,
    TerminateError,
    Cancelled,
}

impl ValidationAction {
    /// Whether the loop stops after this decision.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Continue)
    }
}

/// Validator output attached to each iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationDecision {
    pub action: ValidationAction,
    /// Only populated for [`ValidationAction::Continue`]
    pub feedback_text: Option<String>,
}

impl ValidationDecision {
    fn terminal(action: ValidationAction) -> Self {
        Self {
            action,
            feedback_text: None,
        }
    }

    /// Keep iterating with `feedback`.
    #[must_use]
    pub fn proceed(feedback: String) -> Self {
        Self {
            action: ValidationAction::Continue,
            feedback_text: Some(feedback),
        }
    }

    /// Terminal reason for a terminal decision.
    ///
    /// `TerminateError` has no fixed reason; the loop records the
    /// specific failure instead.
    #[must_use]
    pub fn terminal_reason(&self) -> Option<TerminalReason> {
        match self.action {
            ValidationAction::TerminateSuccess => Some(TerminalReason::QualityThresholdMet),
            ValidationAction::TerminateMaxIterations => Some(TerminalReason::MaxIterationsReached),
            ValidationAction::Cancelled => Some(TerminalReason::Cancelled),
            ValidationAction::Continue | ValidationAction::TerminateError => None,
        }
    }
}

/// Everything the validator looks at for one iteration.
#[derive(Debug, Clone, Copy)]
pub struct ValidationInput<'a> {
    pub report: &'a Report,
    pub execution: &'a ExecutionResult,
    pub quality_threshold: u8,
    /// 1-based index of the iteration just analyzed
    pub iteration: u32,
    pub max_iterations: u32,
    pub cancelled: bool,
    pub code_sha256: &'a str,
    pub previous_sha256: Option<&'a str>,
}

/// Applies the decision rule and writes feedback.
#[derive(Debug, Clone)]
pub struct Validator {
    stderr_excerpt: usize,
}

impl Default for Validator {
    fn default() -> Self {
        Self {
            stderr_excerpt: DEFAULT_STDERR_EXCERPT,
        }
    }
}

impl Validator {
    /// Create a validator with the default stderr excerpt length.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the stderr excerpt to `chars` characters.
    #[must_use]
    pub fn with_stderr_excerpt(mut self, chars: usize) -> Self {
        self.stderr_excerpt = chars;
        self
    }

    /// Decide what happens after one iteration.
    #[must_use]
    pub fn decide(&self, input: &ValidationInput<'_>) -> ValidationDecision {
        if input.report.score >= input.quality_threshold {
            return ValidationDecision::terminal(ValidationAction::TerminateSuccess);
        }
        if input.cancelled {
            return ValidationDecision::terminal(ValidationAction::Cancelled);
        }
        if input.iteration >= input.max_iterations {
            return ValidationDecision::terminal(ValidationAction::TerminateMaxIterations);
        }
        ValidationDecision::proceed(self.feedback(input))
    }

    fn feedback(&self, input: &ValidationInput<'_>) -> String {
        let mut lines = vec![format!(
            "Iteration {} scored {}/100; the target is {}.",
            input.iteration, input.report.score, input.quality_threshold
        )];
        lines.push(input.report.summary_text.clone());

        let unmet: Vec<String> = input
            .report
            .unmet()
            .map(|(check, result)| {
                let label = match result.status {
                    CheckStatus::Fail => "FAILED",
                    CheckStatus::Unverified => "UNVERIFIED",
                    CheckStatus::Pass => "PASSED",
                };
                format!("- [{}] {}: {}", label, check, result.why)
            })
            .collect();
        if !unmet.is_empty() {
            lines.push(String::new());
            lines.push("Checks that still need work:".to_string());
            lines.extend(unmet);
        }

        if input.execution.timed_out {
            lines.push(String::new());
            lines.push(format!(
                "The program was killed after {}ms. Remove blocking input, infinite loops and long sleeps.",
                input.execution.duration_ms
            ));
        } else if let Some(code) = input.execution.exit_code.filter(|c| *c != 0) {
            lines.push(String::new());
            lines.push(format!("The program exited with code {}.", code));
        }

        let stderr = input.execution.stderr.trim();
        if !stderr.is_empty() {
            lines.push(String::new());
            lines.push("stderr:".to_string());
            lines.push(excerpt(stderr, self.stderr_excerpt));
        }

        if input.previous_sha256 == Some(input.code_sha256) {
            lines.push(String::new());
            lines.push(
                "The code was identical to the previous attempt. Make a substantive change."
                    .to_string(),
            );
        }

        lines.join("\n")
    }
}

/// Last `max_chars` characters of `text`, marked when cut.
fn excerpt(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    let tail: String = text.chars().skip(count - max_chars).collect();
    format!("...{}", tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::ReportAnalyzer;
    use crate::sandbox::BackendKind;

    fn exec(stdout: &str, stderr: &str, exit_code: Option<i32>, timed_out: bool) -> ExecutionResult {
        ExecutionResult {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code,
            duration_ms: 40,
            timed_out,
            backend_kind: BackendKind::ProcessFallback,
            stdout_truncated: false,
            stderr_truncated: false,
        }
    }

    fn input<'a>(
        report: &'a Report,
        execution: &'a ExecutionResult,
        threshold: u8,
        iteration: u32,
        max: u32,
        cancelled: bool,
    ) -> ValidationInput<'a> {
        ValidationInput {
            report,
            execution,
            quality_threshold: threshold,
            iteration,
            max_iterations: max,
            cancelled,
            code_sha256: "aaa",
            previous_sha256: None,
        }
    }

    fn failing() -> (Report, ExecutionResult) {
        let execution = exec("FAIL: adds: 1+1 gave 3\n", "", Some(0), false);
        let report =
            ReportAnalyzer::new().analyze(&execution, &[], &["adds".to_string()]);
        (report, execution)
    }

    #[test]
    fn test_success_when_threshold_met() {
        let (report, execution) = failing();
        let decision = Validator::new().decide(&input(&report, &execution, report.score, 1, 3, false));
        assert_eq!(decision.action, ValidationAction::TerminateSuccess);
        assert!(decision.feedback_text.is_none());
        assert_eq!(
            decision.terminal_reason(),
            Some(TerminalReason::QualityThresholdMet)
        );
    }

    #[test]
    fn test_zero_threshold_always_succeeds() {
        let execution = exec("", "boom", Some(1), false);
        let report = ReportAnalyzer::new().analyze(&execution, &[], &[]);
        let decision = Validator::new().decide(&input(&report, &execution, 0, 1, 3, true));
        assert_eq!(decision.action, ValidationAction::TerminateSuccess);
    }

    #[test]
    fn test_success_beats_cancellation() {
        let (report, execution) = failing();
        let decision = Validator::new().decide(&input(&report, &execution, 10, 1, 3, true));
        assert_eq!(decision.action, ValidationAction::TerminateSuccess);
    }

    #[test]
    fn test_cancellation_beats_budget() {
        let (report, execution) = failing();
        let decision = Validator::new().decide(&input(&report, &execution, 100, 3, 3, true));
        assert_eq!(decision.action, ValidationAction::Cancelled);
    }

    #[test]
    fn test_budget_exhausted() {
        let (report, execution) = failing();
        let decision = Validator::new().decide(&input(&report, &execution, 100, 1, 1, false));
        assert_eq!(decision.action, ValidationAction::TerminateMaxIterations);
        assert_eq!(
            decision.terminal_reason(),
            Some(TerminalReason::MaxIterationsReached)
        );
    }

    #[test]
    fn test_continue_lists_failing_checks() {
        let (report, execution) = failing();
        let decision = Validator::new().decide(&input(&report, &execution, 100, 1, 3, false));
        assert_eq!(decision.action, ValidationAction::Continue);
        let feedback = decision.feedback_text.unwrap();
        assert!(feedback.contains("target is 100"));
        assert!(feedback.contains("[FAILED] adds"));
        assert!(feedback.contains("1+1 gave 3"));
    }

    #[test]
    fn test_feedback_mentions_timeout_and_stderr() {
        let execution = exec("", "still waiting\n", None, true);
        let report = ReportAnalyzer::new().analyze(&execution, &[], &[]);
        let decision = Validator::new().decide(&input(&report, &execution, 80, 1, 3, false));
        let feedback = decision.feedback_text.unwrap();
        assert!(feedback.contains("killed after 40ms"));
        assert!(feedback.contains("still waiting"));
    }

    #[test]
    fn test_feedback_flags_repeated_code() {
        let (report, execution) = failing();
        let mut validation = input(&report, &execution, 100, 2, 3, false);
        validation.previous_sha256 = Some("aaa");
        let feedback = Validator::new().decide(&validation).feedback_text.unwrap();
        assert!(feedback.contains("identical to the previous attempt"));
    }

    #[test]
    fn test_stderr_excerpt_is_bounded() {
        let long = "x".repeat(5000);
        let execution = exec("", &long, Some(1), false);
        let report = ReportAnalyzer::new().analyze(&execution, &[], &[]);
        let feedback = Validator::new()
            .with_stderr_excerpt(100)
            .decide(&input(&report, &execution, 80, 1, 3, false))
            .feedback_text
            .unwrap();
        assert!(feedback.len() < 1000);
        assert!(feedback.contains("exited with code 1"));
    }

    #[test]
    fn test_action_wire_format() {
        assert_eq!(
            serde_json::to_string(&ValidationAction::TerminateMaxIterations).unwrap(),
            "\"terminate_max_iterations\""
        );
        assert!(!ValidationAction::Continue.is_terminal());
        assert!(ValidationAction::TerminateError.is_terminal());
    }
}
