//! Orchestrator facade.
//!
//! [`Orchestrator`] is the boundary of the system: it accepts task
//! submissions, runs one-shot quick tests, answers status queries and
//! forwards cancellation. Each admitted session runs its own loop on a
//! spawned task; the [`SessionRegistry`] is the only state those loops
//! share.
//!
//! # Admission
//!
//! A semaphore sized `max_concurrent_sessions` gates loop start. Under
//! [`AdmissionPolicy::Queue`] a session waits in `INITIATED` for a permit;
//! under [`AdmissionPolicy::Reject`] a submission that finds no free permit
//! fails with [`CodeloopError::AdmissionRejected`] before a session exists.
//!
//! # Example
//!
//! ```rust,ignore
//! use codeloop::config::OrchestratorConfig;
//! use codeloop::orchestrator::{Orchestrator, SubmitMode};
//! use codeloop::session::TaskRequest;
//!
//! let orchestrator = Orchestrator::new(OrchestratorConfig::default(), ".".as_ref()).await?;
//! let submission = orchestrator
//!     .submit(
//!         TaskRequest::new("write a function returning factorial of n", "python")
//!             .with_criterion("factorial(5) == 120"),
//!         SubmitMode::Wait,
//!     )
//!     .await?;
//! ```

pub(crate) mod session_loop;

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, TryAcquireError};
use tracing::{debug, info, warn};

use crate::analyzer::{Report, ReportAnalyzer, TestType};
use crate::config::OrchestratorConfig;
use crate::error::{CodeloopError, Result};
use crate::generator::{build_generator, CodeGenerator};
use crate::language::Language;
use crate::notifier::{CallbackNotifier, HttpCallbackNotifier};
use crate::sandbox::{select_backend, BackendKind, ExecutionBackend, ExecutionResult};
use crate::session::persistence::SessionStore;
use crate::session::{
    is_session_id, Iteration, Session, SessionFilter, SessionId, SessionRegistry, SessionStatus,
    SessionSummary, TaskOutcome, TaskRequest, TerminalReason,
};
use crate::validator::Validator;

use session_loop::LoopContext;

// ============================================================================
// Public types
// ============================================================================

/// What to do when every concurrency slot is busy.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionPolicy {
    /// Wait for a free slot
    #[default]
    Queue,
    /// Fail the submission
    Reject,
}

/// How [`Orchestrator::submit`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    /// Return once the session is terminal
    Wait,
    /// Return the session id at once; the loop runs in the background
    Detached,
}

/// Result of a submission.
#[derive(Debug, Clone)]
pub enum Submission {
    /// The loop finished (`SubmitMode::Wait`)
    Finished(TaskOutcome),
    /// The loop is running (`SubmitMode::Detached`)
    Running(SessionId),
}

impl Submission {
    #[must_use]
    pub fn session_id(&self) -> &str {
        match self {
            Self::Finished(outcome) => &outcome.session_id,
            Self::Running(id) => id,
        }
    }

    /// The outcome, if the loop already finished.
    #[must_use]
    pub fn outcome(&self) -> Option<&TaskOutcome> {
        match self {
            Self::Finished(outcome) => Some(outcome),
            Self::Running(_) => None,
        }
    }
}

/// Status query response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionView {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub language: Language,
    pub max_iterations: u32,
    pub quality_threshold: u8,
    pub total_iterations: u32,
    pub iterations: Vec<Iteration>,
    pub terminal_reason: Option<TerminalReason>,
    pub final_code: Option<String>,
    pub final_report: Option<Report>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<Session> for SessionView {
    fn from(session: Session) -> Self {
        Self {
            total_iterations: session.total_iterations(),
            session_id: session.session_id,
            status: session.status,
            language: session.language,
            max_iterations: session.max_iterations,
            quality_threshold: session.quality_threshold,
            iterations: session.iterations,
            terminal_reason: session.terminal_reason,
            final_code: session.final_code,
            final_report: session.final_report,
            error_message: session.error_message,
            created_at: session.created_at,
            finished_at: session.finished_at,
        }
    }
}

/// Result of a quick test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuickTestResult {
    pub language: Language,
    pub test_type: TestType,
    pub execution: ExecutionResult,
    pub report: Report,
}

// ============================================================================
// Dependencies
// ============================================================================

/// Collaborators the orchestrator drives.
///
/// Production code builds them from configuration with
/// [`OrchestratorDependencies::from_config`]; tests inject mocks.
#[derive(Clone)]
pub struct OrchestratorDependencies {
    pub generator: Arc<dyn CodeGenerator>,
    pub backend: Arc<dyn ExecutionBackend>,
    pub notifier: Arc<dyn CallbackNotifier>,
}

impl std::fmt::Debug for OrchestratorDependencies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorDependencies")
            .field("generator", &self.generator.name())
            .field("backend", &self.backend.name())
            .field("notifier", &"<dyn CallbackNotifier>")
            .finish()
    }
}

impl OrchestratorDependencies {
    /// Build the configured generator, probe for a backend and create the
    /// HTTP notifier.
    ///
    /// # Errors
    ///
    /// Returns an error if a collaborator cannot be constructed, including
    /// [`CodeloopError::Sandbox`] when container isolation is required but
    /// unavailable.
    pub async fn from_config(config: &OrchestratorConfig) -> Result<Self> {
        Ok(Self {
            generator: build_generator(&config.generator)?,
            backend: select_backend(&config.sandbox).await?,
            notifier: Arc::new(HttpCallbackNotifier::from_settings(&config.callback)?),
        })
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Entry point for submitting and managing sessions.
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: SessionRegistry,
    permits: Arc<Semaphore>,
    ctx: LoopContext,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("available_permits", &self.permits.available_permits())
            .finish()
    }
}

impl Orchestrator {
    /// Create an orchestrator with collaborators built from `config`.
    ///
    /// Relative persistence paths resolve against `project_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a collaborator
    /// cannot be built.
    pub async fn new(config: OrchestratorConfig, project_dir: &Path) -> Result<Self> {
        config.validate()?;
        let deps = OrchestratorDependencies::from_config(&config).await?;
        let store = config
            .persistence
            .enabled
            .then(|| SessionStore::new(config.persistence_dir(project_dir)));
        let mut orchestrator = Self::with_deps(config, deps)?;
        orchestrator.ctx.store = store;
        Ok(orchestrator)
    }

    /// Create an orchestrator with injected collaborators and no persistence.
    ///
    /// # Errors
    ///
    /// Returns [`CodeloopError::InvalidConfig`] if `config` fails validation.
    pub fn with_deps(config: OrchestratorConfig, deps: OrchestratorDependencies) -> Result<Self> {
        config.validate()?;
        let ctx = LoopContext {
            generator: deps.generator,
            backend: deps.backend,
            notifier: deps.notifier,
            store: None,
            analyzer: ReportAnalyzer::new(),
            validator: Validator::new(),
            execution_timeout: config.sandbox.execution_timeout(),
            session_timeout: config.session.session_timeout(),
        };
        Ok(Self {
            registry: SessionRegistry::new(config.session.limits()),
            permits: Arc::new(Semaphore::new(config.concurrency.max_concurrent_sessions)),
            config,
            ctx,
        })
    }

    /// Persist terminal sessions into `store`.
    #[must_use]
    pub fn with_store(mut self, store: SessionStore) -> Self {
        self.ctx.store = Some(store);
        self
    }

    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Trust level of the execution backend in use.
    #[must_use]
    pub fn backend_kind(&self) -> BackendKind {
        self.ctx.backend.kind()
    }

    /// Submit a task.
    ///
    /// # Errors
    ///
    /// - [`CodeloopError::Validation`] for malformed input; no session is
    ///   created and the submission counts as `invalid_input`.
    /// - [`CodeloopError::AdmissionRejected`] when every slot is busy under
    ///   [`AdmissionPolicy::Reject`].
    pub async fn submit(&self, request: TaskRequest, mode: SubmitMode) -> Result<Submission> {
        let task = match request.validate(&self.registry.limits()) {
            Ok(task) => task,
            Err(e) => {
                info!(
                    reason = %TerminalReason::InvalidInput,
                    error = %e,
                    "Submission rejected"
                );
                return Err(e);
            }
        };

        let limit = self.config.concurrency.max_concurrent_sessions;
        let early_permit = match self.config.concurrency.admission {
            AdmissionPolicy::Queue => None,
            AdmissionPolicy::Reject => match self.permits.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => {
                    let running = limit.saturating_sub(self.permits.available_permits());
                    warn!(running, limit, "Admission rejected");
                    return Err(CodeloopError::AdmissionRejected { running, limit });
                }
            },
        };

        let session_id = self.registry.insert(task).await;
        let writer = self.registry.claim(&session_id).await?;
        let ctx = self.ctx.clone();
        let permits = self.permits.clone();

        let handle = tokio::spawn(async move {
            let permit = match early_permit {
                Some(permit) => permit,
                None => {
                    debug!(session_id = %writer.session_id(), "Waiting for a concurrency slot");
                    permits
                        .acquire_owned()
                        .await
                        .map_err(|e| anyhow::anyhow!("Concurrency limiter closed: {}", e))?
                }
            };
            session_loop::drive(ctx, writer, permit).await
        });

        match mode {
            SubmitMode::Detached => {
                info!(session_id = %session_id, "Session submitted (detached)");
                Ok(Submission::Running(session_id))
            }
            SubmitMode::Wait => {
                let session = handle
                    .await
                    .map_err(|e| anyhow::anyhow!("Session task for {} failed: {}", session_id, e))??;
                Ok(Submission::Finished(session.outcome()))
            }
        }
    }

    /// Run one execute + analyze pass with no generation or validation.
    ///
    /// # Errors
    ///
    /// Returns [`CodeloopError::Validation`] for blank code or an unsupported
    /// language, and [`CodeloopError::Sandbox`] if the code cannot be run.
    pub async fn quick_test(
        &self,
        code: &str,
        language: &str,
        test_type: TestType,
    ) -> Result<QuickTestResult> {
        if code.trim().is_empty() {
            return Err(CodeloopError::validation("code", "must not be empty"));
        }
        let language = Language::from_str(language)
            .map_err(|e| CodeloopError::validation("programming_language", e.to_string()))?;

        let execution = self
            .ctx
            .backend
            .execute(code, language, self.ctx.execution_timeout)
            .await?;
        let report = self
            .ctx
            .analyzer
            .analyze(&execution, &[], &test_type.criteria());
        info!(
            language = %language,
            test_type = ?test_type,
            score = report.score,
            backend = %execution.backend_kind,
            "Quick test finished"
        );
        Ok(QuickTestResult {
            language,
            test_type,
            execution,
            report,
        })
    }

    /// Current state of a session.
    ///
    /// Falls back to the persisted snapshot for sessions no longer in
    /// memory.
    ///
    /// # Errors
    ///
    /// Returns [`CodeloopError::NotFound`] for unknown ids.
    pub async fn status(&self, session_id: &str) -> Result<SessionView> {
        if !is_session_id(session_id) {
            return Err(CodeloopError::not_found(session_id));
        }
        match self.registry.get(session_id).await {
            Ok(session) => Ok(session.into()),
            Err(CodeloopError::NotFound { .. }) => {
                let Some(store) = &self.ctx.store else {
                    return Err(CodeloopError::not_found(session_id));
                };
                let id = session_id.to_string();
                store
                    .run_blocking(move |store| store.load(&id))
                    .await?
                    .map(SessionView::from)
                    .ok_or_else(|| CodeloopError::not_found(session_id))
            }
            Err(e) => Err(e),
        }
    }

    /// Request cooperative cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`CodeloopError::NotFound`] for unknown ids.
    pub async fn cancel(&self, session_id: &str) -> Result<()> {
        self.registry.cancel(session_id).await
    }

    /// Summaries of sessions passing `filter`, oldest first.
    ///
    /// Persisted snapshots of sessions no longer in memory are included;
    /// an unreadable store is logged and skipped.
    pub async fn list(&self, filter: &SessionFilter) -> Vec<SessionSummary> {
        let mut summaries = self.registry.list(filter).await;
        let Some(store) = &self.ctx.store else {
            return summaries;
        };
        match store.run_blocking(SessionStore::load_all).await {
            Ok(persisted) => {
                for session in persisted {
                    let known = summaries.iter().any(|s| s.session_id == session.session_id);
                    if !known && filter.matches(&session) {
                        summaries.push(session.summary());
                    }
                }
                summaries.sort_by(|a, b| {
                    a.created_at
                        .cmp(&b.created_at)
                        .then_with(|| a.session_id.cmp(&b.session_id))
                });
            }
            Err(e) => warn!(error = %e, "Failed to read persisted sessions"),
        }
        summaries
    }

    /// Remove a terminal session and its snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`CodeloopError::NotFound`] for unknown ids and
    /// [`CodeloopError::InvalidState`] for running sessions.
    pub async fn delete(&self, session_id: &str) -> Result<()> {
        self.registry.delete(session_id).await?;
        if let Some(store) = &self.ctx.store {
            let id = session_id.to_string();
            store.run_blocking(move |store| store.delete(&id)).await?;
        }
        Ok(())
    }
}
