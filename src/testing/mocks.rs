//! Mock collaborators.
//!
//! Builder-style test doubles for [`CodeGenerator`], [`ExecutionBackend`]
//! and [`CallbackNotifier`], with call counters for assertions.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{CodeloopError, Result};
use crate::generator::{CodeGenerator, GenerationRequest};
use crate::language::Language;
use crate::notifier::CallbackNotifier;
use crate::sandbox::{BackendKind, ExecutionBackend, ExecutionResult};
use crate::session::TaskOutcome;

/// Build an `ExecutionResult` for scripted runs.
#[must_use]
pub fn execution(stdout: &str, exit_code: Option<i32>) -> ExecutionResult {
    ExecutionResult {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code,
        duration_ms: 1,
        timed_out: false,
        backend_kind: BackendKind::ProcessFallback,
        stdout_truncated: false,
        stderr_truncated: false,
    }
}

/// Pop the next scripted item; the last one repeats forever.
fn next_scripted<T: Clone>(script: &Mutex<VecDeque<T>>) -> Option<T> {
    let mut script = script.lock().ok()?;
    if script.len() > 1 {
        script.pop_front()
    } else {
        script.front().cloned()
    }
}

// =============================================================================
// Generator
// =============================================================================

/// Mock code generator.
///
/// # Example
///
/// ```rust,ignore
/// let generator = MockGenerator::new()
///     .with_code("print('v1')")
///     .with_code("print('v2')")
///     .with_fail_count(1, "connection reset");
/// ```
#[derive(Debug, Default)]
pub struct MockGenerator {
    responses: Mutex<VecDeque<String>>,
    error: Option<String>,
    permanent_error: Option<String>,
    fail_count: AtomicU32,
    fail_error: Option<String>,
    delay: Option<Duration>,
    call_count: AtomicU32,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl MockGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue code to return; the last queued value repeats.
    #[must_use]
    pub fn with_code(self, code: &str) -> Self {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push_back(code.to_string());
        }
        self
    }

    /// Always fail with a retryable generation error.
    #[must_use]
    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }

    /// Always fail with an error that is not worth retrying.
    #[must_use]
    pub fn with_permanent_error(mut self, error: &str) -> Self {
        self.permanent_error = Some(error.to_string());
        self
    }

    /// Fail the first `count` calls, then behave normally.
    #[must_use]
    pub fn with_fail_count(mut self, count: u32, error: &str) -> Self {
        self.fail_count = AtomicU32::new(count);
        self.fail_error = Some(error.to_string());
        self
    }

    /// Sleep before answering.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of `generate` calls so far.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Every request seen, in order.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CodeGenerator for MockGenerator {
    fn name(&self) -> &str {
        "mock-generator"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let remaining = self.fail_count.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_count.fetch_sub(1, Ordering::SeqCst);
            let message = self.fail_error.as_deref().unwrap_or("mock failure");
            return Err(CodeloopError::generation(message, 1));
        }
        if let Some(error) = &self.permanent_error {
            return Err(CodeloopError::Other(anyhow::anyhow!("{}", error)));
        }
        if let Some(error) = &self.error {
            return Err(CodeloopError::generation(error.clone(), 1));
        }
        Ok(next_scripted(&self.responses).unwrap_or_default())
    }
}

// =============================================================================
// Execution backend
// =============================================================================

/// Mock execution backend returning scripted results.
///
/// # Example
///
/// ```rust,ignore
/// let backend = MockBackend::new()
///     .with_result(execution("FAIL: adds: 3\n", Some(0)))
///     .with_result(execution("PASS: adds\n", Some(0)));
/// ```
#[derive(Debug)]
pub struct MockBackend {
    results: Mutex<VecDeque<ExecutionResult>>,
    sandbox_error: Option<String>,
    available: bool,
    kind: BackendKind,
    delay: Option<Duration>,
    call_count: AtomicU32,
    executed: Mutex<Vec<String>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            results: Mutex::new(VecDeque::new()),
            sandbox_error: None,
            available: true,
            kind: BackendKind::ProcessFallback,
            delay: None,
            call_count: AtomicU32::new(0),
            executed: Mutex::new(Vec::new()),
        }
    }
}

impl MockBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a result; the last queued result repeats.
    #[must_use]
    pub fn with_result(self, result: ExecutionResult) -> Self {
        if let Ok(mut results) = self.results.lock() {
            results.push_back(result);
        }
        self
    }

    /// Queue a clean run printing `stdout`.
    #[must_use]
    pub fn with_stdout(self, stdout: &str) -> Self {
        self.with_result(execution(stdout, Some(0)))
    }

    /// Fail every run with a sandbox error.
    #[must_use]
    pub fn with_sandbox_error(mut self, message: &str) -> Self {
        self.sandbox_error = Some(message.to_string());
        self
    }

    /// Report the backend as (un)available.
    #[must_use]
    pub fn with_available(mut self, available: bool) -> Self {
        self.available = available;
        self
    }

    /// Tag results with `kind`.
    #[must_use]
    pub fn with_kind(mut self, kind: BackendKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sleep before returning each result.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of `execute` calls so far.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Every program executed, in order.
    pub fn executed_code(&self) -> Vec<String> {
        self.executed.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ExecutionBackend for MockBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn name(&self) -> &str {
        "mock-backend"
    }

    async fn is_available(&self) -> bool {
        self.available
    }

    async fn execute(
        &self,
        code: &str,
        _language: Language,
        _timeout: Duration,
    ) -> Result<ExecutionResult> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut executed) = self.executed.lock() {
            executed.push(code.to_string());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.sandbox_error {
            return Err(CodeloopError::sandbox(message.clone()));
        }
        let mut result = next_scripted(&self.results).unwrap_or_else(|| execution("", Some(0)));
        result.backend_kind = self.kind;
        Ok(result)
    }
}

// =============================================================================
// Notifier
// =============================================================================

/// Mock callback notifier recording every delivery.
#[derive(Debug, Default)]
pub struct MockNotifier {
    fail: bool,
    call_count: AtomicU32,
    deliveries: Mutex<Vec<(String, TaskOutcome)>>,
}

impl MockNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every delivery.
    #[must_use]
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Number of `notify` calls so far.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Recorded `(url, outcome)` pairs.
    pub fn deliveries(&self) -> Vec<(String, TaskOutcome)> {
        self.deliveries.lock().map(|d| d.clone()).unwrap_or_default()
    }

    /// Poll until at least `count` calls happened or `timeout` passes.
    pub async fn wait_for_calls(&self, count: u32, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.call_count() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.call_count() >= count
    }
}

#[async_trait]
impl CallbackNotifier for MockNotifier {
    async fn notify(&self, url: &str, outcome: &TaskOutcome) -> Result<()> {
        if let Ok(mut deliveries) = self.deliveries.lock() {
            deliveries.push((url.to_string(), outcome.clone()));
        }
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(CodeloopError::Notification {
                url: url.to_string(),
                attempts: 1,
                message: "mock delivery failure".to_string(),
            });
        }
        Ok(())
    }
}
