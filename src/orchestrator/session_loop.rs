//! Per-session state machine.
//!
//! One loop owns one session through its [`SessionWriter`]. Each pass runs
//! GENERATING, EXECUTING, ANALYZING and VALIDATING in order; the validator's
//! decision either feeds the next pass or ends the session. The whole loop
//! runs under the session wall-clock budget.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, error, info, warn};

use crate::analyzer::ReportAnalyzer;
use crate::error::{CodeloopError, Result};
use crate::generator::{CodeGenerator, GenerationRequest};
use crate::notifier::{spawn_notify, CallbackNotifier};
use crate::sandbox::ExecutionBackend;
use crate::session::persistence::SessionStore;
use crate::session::{Iteration, Session, SessionStatus, SessionWriter, TerminalReason};
use crate::validator::{ValidationInput, Validator};

/// Everything a running loop needs, shared by all sessions.
#[derive(Clone)]
pub(crate) struct LoopContext {
    pub generator: Arc<dyn CodeGenerator>,
    pub backend: Arc<dyn ExecutionBackend>,
    pub notifier: Arc<dyn CallbackNotifier>,
    pub store: Option<SessionStore>,
    pub analyzer: ReportAnalyzer,
    pub validator: Validator,
    pub execution_timeout: Duration,
    pub session_timeout: Duration,
}

/// Hex SHA-256 of generated code.
pub(crate) fn code_digest(code: &str) -> String {
    hex::encode(Sha256::digest(code.as_bytes()))
}

/// Run a session to its terminal state, then persist and notify.
///
/// `permit` is the session's concurrency slot, held while it iterates.
pub(crate) async fn drive(
    ctx: LoopContext,
    writer: SessionWriter,
    permit: OwnedSemaphorePermit,
) -> Result<Session> {
    let session_id = writer.session_id().to_string();
    info!(session_id = %session_id, "Session loop started");

    let outcome = tokio::time::timeout(ctx.session_timeout, iterate(&ctx, &writer)).await;
    let (reason, message) = match outcome {
        Ok(Ok(reason)) => (reason, None),
        Ok(Err(e)) => {
            let reason = e
                .terminal_reason()
                .unwrap_or(TerminalReason::SandboxUnavailable);
            error!(session_id = %session_id, error = %e, reason = %reason, "Session loop failed");
            (reason, Some(e.to_string()))
        }
        Err(_) => {
            warn!(
                session_id = %session_id,
                timeout_ms = ctx.session_timeout.as_millis() as u64,
                "Session exceeded its wall-clock budget"
            );
            (
                TerminalReason::SessionTimeout,
                Some(format!(
                    "session exceeded its {}ms wall-clock budget",
                    ctx.session_timeout.as_millis()
                )),
            )
        }
    };
    // The slot is free before the session is observably terminal.
    drop(permit);

    let session = writer.finish(reason, message).await?;
    after_terminal(&ctx, &session).await;
    Ok(session)
}

/// Iterate until the validator ends the session.
async fn iterate(ctx: &LoopContext, writer: &SessionWriter) -> Result<TerminalReason> {
    let session = writer.snapshot().await?;
    let mut feedback: Option<String> = None;
    let mut previous_sha: Option<String> = None;

    for index in 1..=session.max_iterations {
        let started_at = Utc::now();

        writer.set_status(SessionStatus::Generating).await?;
        let request = GenerationRequest::for_session(&session, index, feedback.take());
        let code = ctx
            .generator
            .generate(&request)
            .await
            .map_err(into_generation_error)?;
        let code_sha256 = code_digest(&code);
        debug!(
            session_id = %session.session_id,
            iteration = index,
            sha256 = %code_sha256,
            bytes = code.len(),
            "Code generated"
        );

        writer.set_status(SessionStatus::Executing).await?;
        let execution = ctx
            .backend
            .execute(&code, session.language, ctx.execution_timeout)
            .await
            .map_err(into_sandbox_error)?;
        debug!(
            session_id = %session.session_id,
            iteration = index,
            backend = %execution.backend_kind,
            exit_code = ?execution.exit_code,
            timed_out = execution.timed_out,
            duration_ms = execution.duration_ms,
            "Execution finished"
        );

        writer.set_status(SessionStatus::Analyzing).await?;
        let report =
            ctx.analyzer
                .analyze(&execution, &session.requirements, &session.test_criteria);

        writer.set_status(SessionStatus::Validating).await?;
        let decision = ctx.validator.decide(&ValidationInput {
            report: &report,
            execution: &execution,
            quality_threshold: session.quality_threshold,
            iteration: index,
            max_iterations: session.max_iterations,
            cancelled: writer.is_cancelled(),
            code_sha256: &code_sha256,
            previous_sha256: previous_sha.as_deref(),
        });
        info!(
            session_id = %session.session_id,
            iteration = index,
            score = report.score,
            threshold = session.quality_threshold,
            action = ?decision.action,
            "Iteration validated"
        );

        let terminal = decision.terminal_reason();
        feedback = decision.feedback_text.clone();
        writer
            .append_iteration(Iteration {
                index,
                generated_code: code,
                code_sha256: code_sha256.clone(),
                execution_result: execution,
                report,
                decision,
                started_at,
            })
            .await?;

        if let Some(reason) = terminal {
            return Ok(reason);
        }
        previous_sha = Some(code_sha256);
    }

    Ok(TerminalReason::MaxIterationsReached)
}

fn into_generation_error(err: CodeloopError) -> CodeloopError {
    match err {
        CodeloopError::Generation { .. } => err,
        other => CodeloopError::generation(other.to_string(), 1),
    }
}

fn into_sandbox_error(err: CodeloopError) -> CodeloopError {
    match err {
        CodeloopError::Sandbox { .. } => err,
        other => CodeloopError::sandbox(other.to_string()),
    }
}

/// Persist and fire the callback. Neither can change the session.
async fn after_terminal(ctx: &LoopContext, session: &Session) {
    if let Some(store) = &ctx.store {
        let snapshot = session.clone();
        match store.run_blocking(move |store| store.save(&snapshot)).await {
            Ok(path) => debug!(
                session_id = %session.session_id,
                path = %path.display(),
                "Session persisted"
            ),
            Err(e) => warn!(
                session_id = %session.session_id,
                error = %e,
                "Failed to persist session"
            ),
        }
    }
    if let Some(url) = &session.callback_url {
        spawn_notify(ctx.notifier.clone(), url.clone(), session.outcome());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionRegistry, TaskRequest};
    use crate::testing::{
        assert_session_invariants, assert_terminated_with, execution, MockBackend,
        MockGenerator, MockNotifier,
    };
    use crate::validator::ValidationAction;
    use tokio::sync::Semaphore;

    struct Harness {
        registry: SessionRegistry,
        generator: Arc<MockGenerator>,
        backend: Arc<MockBackend>,
        notifier: Arc<MockNotifier>,
    }

    impl Harness {
        fn new(generator: MockGenerator, backend: MockBackend) -> Self {
            Self {
                registry: SessionRegistry::default(),
                generator: Arc::new(generator),
                backend: Arc::new(backend),
                notifier: Arc::new(MockNotifier::new()),
            }
        }

        fn context(&self, session_timeout: Duration) -> LoopContext {
            LoopContext {
                generator: self.generator.clone(),
                backend: self.backend.clone(),
                notifier: self.notifier.clone(),
                store: None,
                analyzer: ReportAnalyzer::new(),
                validator: Validator::new(),
                execution_timeout: Duration::from_secs(5),
                session_timeout,
            }
        }

        async fn run(&self, request: TaskRequest) -> Session {
            self.run_with_timeout(request, Duration::from_secs(30)).await
        }

        async fn run_with_timeout(&self, request: TaskRequest, timeout: Duration) -> Session {
            let id = self.registry.create(&request).await.unwrap();
            let writer = self.registry.claim(&id).await.unwrap();
            let permit = Arc::new(Semaphore::new(1)).acquire_owned().await.unwrap();
            drive(self.context(timeout), writer, permit).await.unwrap()
        }
    }

    fn request() -> TaskRequest {
        TaskRequest::new("add two numbers", "python")
            .with_criterion("adds")
            .with_max_iterations(3)
            .with_quality_threshold(80)
    }

    #[test]
    fn test_code_digest_is_stable() {
        assert_eq!(
            code_digest("print(1)\n"),
            code_digest(&String::from("print(1)\n"))
        );
        assert_ne!(code_digest("a"), code_digest("b"));
        assert_eq!(code_digest("").len(), 64);
    }

    #[tokio::test]
    async fn test_success_on_second_iteration() {
        let harness = Harness::new(
            MockGenerator::new().with_code("v1").with_code("v2"),
            MockBackend::new()
                .with_result(execution("FAIL: adds: got 3\n", Some(1)))
                .with_stdout("PASS: adds\n"),
        );
        let session = harness.run(request()).await;

        assert_terminated_with(&session, TerminalReason::QualityThresholdMet);
        assert_session_invariants(&session);
        assert_eq!(session.total_iterations(), 2);
        assert_eq!(session.final_code.as_deref(), Some("v2"));
        assert_eq!(
            session.iterations[0].decision.action,
            ValidationAction::Continue
        );

        let requests = harness.generator.requests();
        assert!(requests[0].feedback.is_none());
        let feedback = requests[1].feedback.as_deref().unwrap();
        assert!(feedback.contains("adds"));
    }

    #[tokio::test]
    async fn test_exhausts_budget() {
        let harness = Harness::new(
            MockGenerator::new().with_code("v"),
            MockBackend::new().with_result(execution("", Some(1))),
        );
        let session = harness.run(request()).await;
        assert_terminated_with(&session, TerminalReason::MaxIterationsReached);
        assert_session_invariants(&session);
        assert_eq!(session.total_iterations(), 3);
        assert_eq!(harness.backend.call_count(), 3);
    }

    #[tokio::test]
    async fn test_identical_code_is_flagged_in_feedback() {
        let harness = Harness::new(
            MockGenerator::new().with_code("same"),
            MockBackend::new().with_result(execution("", Some(1))),
        );
        harness.run(request()).await;
        let requests = harness.generator.requests();
        let feedback = requests[2].feedback.as_deref().unwrap();
        assert!(feedback.contains("identical"));
    }

    #[tokio::test]
    async fn test_generation_failure_ends_session() {
        let harness = Harness::new(
            MockGenerator::new().with_error("backend down"),
            MockBackend::new(),
        );
        let session = harness.run(request()).await;
        assert_terminated_with(&session, TerminalReason::GenerationFailed);
        assert_eq!(session.total_iterations(), 0);
        assert!(session.error_message.unwrap().contains("backend down"));
        assert_eq!(harness.backend.call_count(), 0);
    }

    #[tokio::test]
    async fn test_sandbox_failure_ends_session() {
        let harness = Harness::new(
            MockGenerator::new().with_code("print(1)"),
            MockBackend::new().with_sandbox_error("no interpreter"),
        );
        let session = harness.run(request()).await;
        assert_terminated_with(&session, TerminalReason::SandboxUnavailable);
        assert_eq!(session.total_iterations(), 0);
    }

    #[tokio::test]
    async fn test_session_timeout() {
        let harness = Harness::new(
            MockGenerator::new()
                .with_code("v")
                .with_delay(Duration::from_millis(500)),
            MockBackend::new(),
        );
        let session = harness
            .run_with_timeout(request(), Duration::from_millis(50))
            .await;
        assert_terminated_with(&session, TerminalReason::SessionTimeout);
        assert!(session.error_message.is_some());
    }

    #[tokio::test]
    async fn test_callback_fired_on_terminal() {
        let harness = Harness::new(
            MockGenerator::new().with_code("v"),
            MockBackend::new().with_stdout("PASS: adds\n"),
        );
        let session = harness
            .run(request().with_callback_url("http://127.0.0.1:1/hook"))
            .await;
        assert!(
            harness
                .notifier
                .wait_for_calls(1, Duration::from_secs(2))
                .await
        );
        let deliveries = harness.notifier.deliveries();
        assert_eq!(deliveries[0].0, "http://127.0.0.1:1/hook");
        assert_eq!(deliveries[0].1.session_id, session.session_id);
        assert!(deliveries[0].1.success);
    }

    #[tokio::test]
    async fn test_persists_terminal_session() {
        let dir = tempfile::TempDir::new().unwrap();
        let harness = Harness::new(
            MockGenerator::new().with_code("v"),
            MockBackend::new().with_stdout("PASS: adds\n"),
        );
        let id = harness.registry.create(&request()).await.unwrap();
        let writer = harness.registry.claim(&id).await.unwrap();
        let permit = Arc::new(Semaphore::new(1)).acquire_owned().await.unwrap();
        let mut ctx = harness.context(Duration::from_secs(30));
        ctx.store = Some(SessionStore::new(dir.path()));
        drive(ctx, writer, permit).await.unwrap();

        let stored = SessionStore::new(dir.path()).load(&id).unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Completed);
    }
}
