//! Execution backends for untrusted generated code.
//!
//! An [`ExecutionBackend`] runs one program under a timeout and reports an
//! [`ExecutionResult`]. Two implementations exist:
//!
//! - [`ContainerBackend`] - isolated execution in a throwaway container
//! - [`ProcessBackend`] - a child process in a scratch directory with a
//!   scrubbed environment, used when no container runtime is usable
//!
//! [`select_backend`] probes capabilities once at startup and returns the
//! backend every session will use. The chosen backend is recorded on each
//! result as [`BackendKind`] so callers can weigh how far to trust it.
//!
//! # Example
//!
//! ```rust,ignore
//! use codeloop::sandbox::{select_backend, SandboxSettings};
//! use codeloop::Language;
//! use std::time::Duration;
//!
//! let backend = select_backend(&SandboxSettings::default()).await?;
//! let result = backend
//!     .execute("print('hi')", Language::Python, Duration::from_secs(5))
//!     .await?;
//! assert_eq!(result.exit_code, Some(0));
//! ```

pub mod capture;
pub mod container;
pub mod process;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{CodeloopError, Result};
use crate::language::Language;

pub use capture::CappedBuffer;
pub use container::ContainerBackend;
pub use process::ProcessBackend;

/// Which execution path produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    /// Throwaway container without network access
    #[serde(rename = "isolated")]
    Isolated,
    /// Plain child process; weaker isolation
    #[serde(rename = "process-fallback")]
    ProcessFallback,
}

impl BackendKind {
    /// Wire label.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Isolated => "isolated",
            Self::ProcessFallback => "process-fallback",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of running one program.
///
/// A timeout is a normal result (`timed_out = true`, `exit_code = None`),
/// not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub backend_kind: BackendKind,
    #[serde(default)]
    pub stdout_truncated: bool,
    #[serde(default)]
    pub stderr_truncated: bool,
}

impl ExecutionResult {
    /// Exited with code 0 inside the time limit.
    #[must_use]
    pub fn is_clean_exit(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }

    /// Whether any captured stream hit the byte cap.
    #[must_use]
    pub fn was_truncated(&self) -> bool {
        self.stdout_truncated || self.stderr_truncated
    }

    pub(crate) fn from_capture(run: capture::CapturedRun, backend_kind: BackendKind) -> Self {
        Self {
            stdout: run.stdout.to_string_lossy(),
            stderr: run.stderr.to_string_lossy(),
            exit_code: run.exit_code,
            duration_ms: run.duration.as_millis() as u64,
            timed_out: run.timed_out,
            backend_kind,
            stdout_truncated: run.stdout.truncated(),
            stderr_truncated: run.stderr.truncated(),
        }
    }
}

/// Runs untrusted code under a timeout.
///
/// Implementations must be `Send + Sync`; one instance is shared by every
/// session for the lifetime of the process.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// The trust level of results from this backend.
    fn kind(&self) -> BackendKind;

    /// Human-readable backend name for logs.
    fn name(&self) -> &str;

    /// Whether this backend can run code on this host right now.
    async fn is_available(&self) -> bool;

    /// Run `code` as a `language` program, killing it after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`CodeloopError::Sandbox`] when the backend cannot run the
    /// program at all (runtime or interpreter missing). Program failures
    /// and timeouts are reported inside the `ExecutionResult`.
    async fn execute(
        &self,
        code: &str,
        language: Language,
        timeout: Duration,
    ) -> Result<ExecutionResult>;
}

/// Which isolation level to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// Container when usable, otherwise process
    #[default]
    Auto,
    /// Container only; fail if unavailable
    Container,
    /// Process only
    Process,
}

/// Settings shared by both backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    pub isolation: IsolationMode,
    /// Container CLI, e.g. `docker` or `podman`
    pub container_runtime: String,
    /// Per-run timeout in seconds
    pub execution_timeout_secs: u64,
    /// Byte cap applied to stdout and stderr independently
    pub output_cap_bytes: usize,
    /// Container memory limit, runtime syntax
    pub memory_limit: String,
    /// Allow network access inside the container
    pub network: bool,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            isolation: IsolationMode::Auto,
            container_runtime: "docker".to_string(),
            execution_timeout_secs: 10,
            output_cap_bytes: 64 * 1024,
            memory_limit: "256m".to_string(),
            network: false,
        }
    }
}

impl SandboxSettings {
    /// Per-run timeout as a `Duration`.
    #[must_use]
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }
}

/// Probe the host and pick the backend for this process.
///
/// # Errors
///
/// Returns [`CodeloopError::Sandbox`] when `isolation = container` is
/// requested but no container runtime responds.
pub async fn select_backend(settings: &SandboxSettings) -> Result<Arc<dyn ExecutionBackend>> {
    let container = ContainerBackend::new(settings);
    let process = ProcessBackend::new(settings);

    match settings.isolation {
        IsolationMode::Container => {
            if container.is_available().await {
                info!(runtime = %settings.container_runtime, "Using isolated container backend");
                Ok(Arc::new(container))
            } else {
                Err(CodeloopError::sandbox(format!(
                    "container runtime '{}' is not available",
                    settings.container_runtime
                )))
            }
        }
        IsolationMode::Process => {
            info!("Using process backend (isolation disabled by configuration)");
            Ok(Arc::new(process))
        }
        IsolationMode::Auto => {
            if container.is_available().await {
                info!(runtime = %settings.container_runtime, "Using isolated container backend");
                Ok(Arc::new(container))
            } else {
                warn!(
                    runtime = %settings.container_runtime,
                    "Container runtime unavailable, falling back to process execution"
                );
                Ok(Arc::new(process))
            }
        }
    }
}
