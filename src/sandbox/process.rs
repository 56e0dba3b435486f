//! Process-based fallback execution.
//!
//! Writes the program into a fresh temporary directory and runs the
//! language interpreter there as a child process. The environment is
//! cleared except for `PATH`, and `HOME`/`TMPDIR` point into the scratch
//! directory. This is not a security boundary; results are tagged
//! [`BackendKind::ProcessFallback`].

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::capture::{run_captured, Teardown};
use super::{BackendKind, ExecutionBackend, ExecutionResult, SandboxSettings};
use crate::error::{CodeloopError, Result};
use crate::language::Language;

/// Runs programs as local child processes.
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    output_cap: usize,
}

impl ProcessBackend {
    /// Create a backend using the capture cap from `settings`.
    #[must_use]
    pub fn new(settings: &SandboxSettings) -> Self {
        Self {
            output_cap: settings.output_cap_bytes,
        }
    }

    fn build_command(
        language: Language,
        workdir: &std::path::Path,
        source: &std::path::Path,
    ) -> Command {
        let (program, args) = language.interpreter();
        let mut cmd = Command::new(program);
        cmd.args(args).arg(source).current_dir(workdir).env_clear();
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }
        cmd.env("HOME", workdir)
            .env("TMPDIR", workdir)
            .env("LANG", "C.UTF-8");
        if language == Language::Go {
            cmd.env("GOCACHE", workdir.join(".gocache"))
                .env("GOPATH", workdir.join(".gopath"))
                .env("GOFLAGS", "-mod=mod");
        }
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

/// Grandchildren share the child's process group and die with it.
#[cfg(unix)]
const TEARDOWN: Teardown = Teardown::ProcessGroup;

#[cfg(not(unix))]
const TEARDOWN: Teardown = Teardown::None;

#[async_trait]
impl ExecutionBackend for ProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::ProcessFallback
    }

    fn name(&self) -> &str {
        "process"
    }

    async fn is_available(&self) -> bool {
        Language::all()
            .iter()
            .any(|lang| which::which(lang.interpreter().0).is_ok())
    }

    async fn execute(
        &self,
        code: &str,
        language: Language,
        timeout: Duration,
    ) -> Result<ExecutionResult> {
        let (program, _) = language.interpreter();
        let workdir = tempfile::Builder::new()
            .prefix("codeloop-run-")
            .tempdir()
            .map_err(|e| CodeloopError::sandbox(format!("cannot create scratch dir: {}", e)))?;
        let source = workdir.path().join(language.source_file());
        tokio::fs::write(&source, code).await?;

        debug!(
            language = %language,
            timeout_ms = timeout.as_millis() as u64,
            "Running program with process backend"
        );

        let cmd = Self::build_command(language, workdir.path(), &source);
        let run = match run_captured(cmd, timeout, self.output_cap, TEARDOWN).await {
            Ok(run) => run,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CodeloopError::sandbox(format!(
                    "interpreter '{}' for {} is not installed",
                    program, language
                )));
            }
            Err(e) => {
                return Err(CodeloopError::sandbox(format!(
                    "failed to spawn '{}': {}",
                    program, e
                )));
            }
        };

        Ok(ExecutionResult::from_capture(run, BackendKind::ProcessFallback))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn backend() -> ProcessBackend {
        ProcessBackend::new(&SandboxSettings::default())
    }

    fn has(program: &str) -> bool {
        which::which(program).is_ok()
    }

    #[tokio::test]
    async fn test_runs_bash_program() {
        if !has("bash") {
            return;
        }
        let result = backend()
            .execute("echo hello; echo warn >&2", Language::Bash, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout.trim(), "hello");
        assert_eq!(result.stderr.trim(), "warn");
        assert_eq!(result.backend_kind, BackendKind::ProcessFallback);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_reported_not_raised() {
        if !has("bash") {
            return;
        }
        let result = backend()
            .execute("exit 7", Language::Bash, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.exit_code, Some(7));
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn test_timeout_kills_and_reports() {
        if !has("bash") {
            return;
        }
        let timeout = Duration::from_millis(500);
        let start = Instant::now();
        let result = backend()
            .execute("echo before; sleep 10; echo after", Language::Bash, timeout)
            .await
            .unwrap();
        let elapsed = start.elapsed();
        assert!(result.timed_out);
        assert_eq!(result.exit_code, None);
        assert!(result.stdout.contains("before"));
        assert!(!result.stdout.contains("after"));
        assert!(elapsed < timeout + Duration::from_secs(1), "took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_environment_is_scrubbed() {
        if !has("bash") {
            return;
        }
        std::env::set_var("CODELOOP_SECRET_FOR_TEST", "leak");
        let result = backend()
            .execute(
                "echo \"[${CODELOOP_SECRET_FOR_TEST:-}]\"",
                Language::Bash,
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(result.stdout.trim(), "[]");
    }

    #[tokio::test]
    async fn test_python_program_when_available() {
        if !has("python3") {
            return;
        }
        let result = backend()
            .execute("print(6 * 7)", Language::Python, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout.trim(), "42");
    }

    #[tokio::test]
    async fn test_same_program_is_idempotent() {
        if !has("bash") {
            return;
        }
        let b = backend();
        let first = b
            .execute("echo x; exit 2", Language::Bash, Duration::from_secs(5))
            .await
            .unwrap();
        let second = b
            .execute("echo x; exit 2", Language::Bash, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(first.exit_code, second.exit_code);
        assert_eq!(first.timed_out, second.timed_out);
    }
}
