//! codeloop - Iterative Code Generation Orchestrator
//!
//! Turns a natural-language task into working code by looping
//! generate → execute → analyze → validate until the result meets a
//! quality threshold or the iteration budget runs out.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`orchestrator`] - Submission, quick tests, status, cancellation, admission control
//! - [`session`] - Session data model, shared registry and on-disk snapshots
//! - [`generator`] - Code generator backends (LLM CLI, OpenAI-compatible HTTP)
//! - [`sandbox`] - Execution backends (container isolation, process fallback)
//! - [`analyzer`] - Deterministic scoring of execution results
//! - [`validator`] - Continue/terminate decisions and feedback
//! - [`notifier`] - Terminal-state callbacks
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Custom error types and handling
//! - [`testing`] - Mocks for every collaborator trait
//!
//! # Example
//!
//! ```rust,ignore
//! use codeloop::{Orchestrator, OrchestratorConfig, SubmitMode, TaskRequest};
//!
//! let orchestrator = Orchestrator::new(OrchestratorConfig::default(), ".".as_ref()).await?;
//! let submission = orchestrator
//!     .submit(
//!         TaskRequest::new("write a function returning factorial of n", "python")
//!             .with_criterion("factorial(5) == 120")
//!             .with_max_iterations(3),
//!         SubmitMode::Wait,
//!     )
//!     .await?;
//!
//! if let Some(outcome) = submission.outcome() {
//!     println!("{:?}", outcome.final_code);
//! }
//! ```

pub mod analyzer;
pub mod config;
pub mod error;
pub mod generator;
pub mod language;
pub mod notifier;
pub mod orchestrator;
pub mod prompt;
pub mod retry;
pub mod sandbox;
pub mod session;
pub mod task;
pub mod testing;
pub mod validator;

// Re-export commonly used types
pub use error::{CodeloopError, Result};

pub use config::OrchestratorConfig;
pub use language::{Language, ParseLanguageError};
pub use orchestrator::{
    AdmissionPolicy, Orchestrator, OrchestratorDependencies, QuickTestResult, SessionView,
    SubmitMode, Submission,
};

// Re-export session types
pub use session::{
    Session, SessionFilter, SessionId, SessionRegistry, SessionStatus, SessionSummary,
    TaskOutcome, TaskRequest, TerminalReason,
};

// Re-export pipeline types
pub use analyzer::{Report, ReportAnalyzer, TestType};
pub use generator::{CodeGenerator, GenerationRequest};
pub use notifier::CallbackNotifier;
pub use sandbox::{BackendKind, ExecutionBackend, ExecutionResult};
pub use task::TaskKind;
pub use validator::{ValidationAction, ValidationDecision, Validator};
