//! Session data model.
//!
//! A [`Session`] is one end-to-end code generation request plus its
//! iteration history. Sessions are created by the
//! [`SessionRegistry`](registry::SessionRegistry), mutated only by the loop
//! that owns them, and frozen once they reach a terminal status.
//!
//! # Lifecycle
//!
//! ```text
//! INITIATED ─> GENERATING ─> EXECUTING ─> ANALYZING ─> VALIDATING ─┬─> GENERATING (next iteration)
//!                                                                   ├─> COMPLETED
//!                                                                   ├─> FAILED
//!                                                                   └─> CANCELLED
//! ```

pub mod persistence;
pub mod registry;
pub mod request;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analyzer::Report;
use crate::language::Language;
use crate::sandbox::ExecutionResult;
use crate::task::TaskKind;
use crate::validator::ValidationDecision;

pub use registry::{SessionRegistry, SessionWriter};
pub use request::{SessionLimits, TaskRequest, ValidatedTask};

/// Session identifier (UUID v4, hyphenated).
pub type SessionId = String;

/// Whether `id` has the shape of an id minted by [`SessionRegistry`].
#[must_use]
pub fn is_session_id(id: &str) -> bool {
    uuid::Uuid::parse_str(id).is_ok()
}

/// Where a session is in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Accepted, waiting for an admission permit
    Initiated,
    /// Waiting on the code generator
    Generating,
    /// Running generated code in the sandbox
    Executing,
    /// Scoring the execution result
    Analyzing,
    /// Deciding whether to continue
    Validating,
    /// Terminated with a report meeting the quality threshold
    Completed,
    /// Terminated without success
    Failed,
    /// Terminated by cooperative cancellation
    Cancelled,
}

impl SessionStatus {
    /// Whether no further transitions are possible.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Status label as shown to callers.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "INITIATED",
            Self::Generating => "GENERATING",
            Self::Executing => "EXECUTING",
            Self::Analyzing => "ANALYZING",
            Self::Validating => "VALIDATING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    /// Report score reached the quality threshold
    QualityThresholdMet,
    /// Iteration budget exhausted below threshold
    MaxIterationsReached,
    /// Code generator failed after its internal retries
    GenerationFailed,
    /// No execution backend could run the code
    SandboxUnavailable,
    /// Request rejected during validation
    InvalidInput,
    /// Cancellation flag observed at a validation boundary
    Cancelled,
    /// Session-wide wall-clock budget exceeded
    SessionTimeout,
}

impl TerminalReason {
    /// Wire identifier.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QualityThresholdMet => "quality_threshold_met",
            Self::MaxIterationsReached => "max_iterations_reached",
            Self::GenerationFailed => "generation_failed",
            Self::SandboxUnavailable => "sandbox_unavailable",
            Self::InvalidInput => "invalid_input",
            Self::Cancelled => "cancelled",
            Self::SessionTimeout => "session_timeout",
        }
    }

    /// The terminal status a session with this reason ends in.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        match self {
            Self::QualityThresholdMet => SessionStatus::Completed,
            Self::Cancelled => SessionStatus::Cancelled,
            _ => SessionStatus::Failed,
        }
    }
}

impl std::fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One generate → execute → analyze → validate pass.
///
/// Appended by the owning loop and never modified afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Iteration {
    /// 1-based position in the session
    pub index: u32,
    /// Code produced by the generator
    pub generated_code: String,
    /// Hex SHA-256 of `generated_code`
    pub code_sha256: String,
    /// Sandbox outcome
    pub execution_result: ExecutionResult,
    /// Quality report derived from `execution_result`
    pub report: Report,
    /// Validator decision taken after this iteration
    pub decision: ValidationDecision,
    /// When the iteration started
    pub started_at: DateTime<Utc>,
}

/// A code generation session and its history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub task_description: String,
    pub language: Language,
    pub task_kind: TaskKind,
    pub requirements: Vec<String>,
    pub test_criteria: Vec<String>,
    pub max_iterations: u32,
    pub quality_threshold: u8,
    pub status: SessionStatus,
    pub iterations: Vec<Iteration>,
    pub final_code: Option<String>,
    pub final_report: Option<Report>,
    pub terminal_reason: Option<TerminalReason>,
    /// Human-readable detail for failed sessions
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub callback_url: Option<String>,
}

impl Session {
    /// Create a fresh session from a validated request.
    #[must_use]
    pub fn new(session_id: SessionId, task: ValidatedTask) -> Self {
        Self {
            session_id,
            task_description: task.task_description,
            language: task.language,
            task_kind: task.task_kind,
            requirements: task.requirements,
            test_criteria: task.test_criteria,
            max_iterations: task.max_iterations,
            quality_threshold: task.quality_threshold,
            status: SessionStatus::Initiated,
            iterations: Vec::new(),
            final_code: None,
            final_report: None,
            terminal_reason: None,
            error_message: None,
            created_at: Utc::now(),
            finished_at: None,
            callback_url: task.callback_url,
        }
    }

    /// Whether the session has stopped for good.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Number of iterations appended so far.
    #[must_use]
    pub fn total_iterations(&self) -> u32 {
        self.iterations.len() as u32
    }

    /// The most recent iteration, if any.
    #[must_use]
    pub fn last_iteration(&self) -> Option<&Iteration> {
        self.iterations.last()
    }

    /// Wall-clock seconds from creation to termination (or to now).
    #[must_use]
    pub fn execution_time_secs(&self) -> f64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        let elapsed = end - self.created_at;
        elapsed.num_milliseconds().max(0) as f64 / 1000.0
    }

    /// Compact listing row.
    #[must_use]
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            status: self.status,
            language: self.language,
            total_iterations: self.total_iterations(),
            last_score: self.last_iteration().map(|it| it.report.score),
            terminal_reason: self.terminal_reason,
            created_at: self.created_at,
        }
    }

    /// Result envelope shared by synchronous submit and callbacks.
    #[must_use]
    pub fn outcome(&self) -> TaskOutcome {
        TaskOutcome {
            success: self.terminal_reason == Some(TerminalReason::QualityThresholdMet),
            session_id: self.session_id.clone(),
            final_code: self.final_code.clone(),
            final_report: self.final_report.clone(),
            total_iterations: self.total_iterations(),
            execution_time: self.execution_time_secs(),
            reason: self.terminal_reason,
        }
    }
}

/// Listing row returned by [`SessionRegistry::list`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub language: Language,
    pub total_iterations: u32,
    pub last_score: Option<u8>,
    pub terminal_reason: Option<TerminalReason>,
    pub created_at: DateTime<Utc>,
}

/// Filter for [`SessionRegistry::list`]. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    /// Only sessions in one of these statuses
    pub statuses: Option<Vec<SessionStatus>>,
    /// Only terminal (`Some(true)`) or only live (`Some(false)`) sessions
    pub terminal: Option<bool>,
    /// Only sessions targeting this language
    pub language: Option<Language>,
}

impl SessionFilter {
    /// Filter matching every session.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Only sessions still running.
    #[must_use]
    pub fn active() -> Self {
        Self {
            terminal: Some(false),
            ..Self::default()
        }
    }

    /// Restrict to the given statuses.
    #[must_use]
    pub fn with_statuses(mut self, statuses: Vec<SessionStatus>) -> Self {
        self.statuses = Some(statuses);
        self
    }

    /// Restrict to a language.
    #[must_use]
    pub fn with_language(mut self, language: Language) -> Self {
        self.language = Some(language);
        self
    }

    /// Whether `session` passes this filter.
    #[must_use]
    pub fn matches(&self, session: &Session) -> bool {
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&session.status) {
                return false;
            }
        }
        if let Some(terminal) = self.terminal {
            if session.is_terminal() != terminal {
                return false;
            }
        }
        if let Some(language) = self.language {
            if session.language != language {
                return false;
            }
        }
        true
    }
}

/// Terminal result envelope.
///
/// Returned by a waiting submit and delivered to `callback_url`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub success: bool,
    pub session_id: SessionId,
    pub final_code: Option<String>,
    pub final_report: Option<Report>,
    pub total_iterations: u32,
    /// Seconds
    pub execution_time: f64,
    pub reason: Option<TerminalReason>,
}
