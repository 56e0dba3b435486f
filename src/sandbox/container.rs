//! Isolated execution in throwaway containers.
//!
//! Each run gets its own container: no network (unless enabled), a memory
//! and pid limit, a read-only root filesystem with a tmpfs `/tmp`, and the
//! scratch directory holding the program mounted read-only at `/workspace`.
//! On timeout, or when the run is abandoned, the container is killed by
//! name; `--rm` removes it.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::capture::{run_captured, Teardown};
use super::{BackendKind, ExecutionBackend, ExecutionResult, SandboxSettings};
use crate::error::{CodeloopError, Result};
use crate::language::Language;

/// `docker run` reserves these exit codes for its own failures.
const RUNTIME_ERROR_EXIT_CODES: &[i32] = &[125];

/// How long the availability probe may take.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs programs inside containers via a docker-compatible CLI.
#[derive(Debug, Clone)]
pub struct ContainerBackend {
    runtime: String,
    memory_limit: String,
    network: bool,
    output_cap: usize,
}

impl ContainerBackend {
    /// Create a backend from sandbox settings.
    #[must_use]
    pub fn new(settings: &SandboxSettings) -> Self {
        Self {
            runtime: settings.container_runtime.clone(),
            memory_limit: settings.memory_limit.clone(),
            network: settings.network,
            output_cap: settings.output_cap_bytes,
        }
    }

    /// Arguments for `<runtime> run ...`.
    pub(crate) fn run_args(
        &self,
        container_name: &str,
        language: Language,
        host_dir: &std::path::Path,
    ) -> Vec<String> {
        let (program, interp_args) = language.interpreter();
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            container_name.to_string(),
            "--memory".to_string(),
            self.memory_limit.clone(),
            "--pids-limit".to_string(),
            "128".to_string(),
            "--cpus".to_string(),
            "1".to_string(),
            "--read-only".to_string(),
            "--tmpfs".to_string(),
            "/tmp:rw,exec,size=64m".to_string(),
            "--security-opt".to_string(),
            "no-new-privileges".to_string(),
            "-e".to_string(),
            "HOME=/tmp".to_string(),
            "-e".to_string(),
            "GOCACHE=/tmp/gocache".to_string(),
            "-v".to_string(),
            format!("{}:/workspace:ro", host_dir.display()),
            "-w".to_string(),
            "/workspace".to_string(),
        ];
        if !self.network {
            args.push("--network".to_string());
            args.push("none".to_string());
        }
        args.push(language.container_image().to_string());
        args.push(program.to_string());
        args.extend(interp_args.iter().map(|a| (*a).to_string()));
        args.push(format!("/workspace/{}", language.source_file()));
        args
    }
}

#[async_trait]
impl ExecutionBackend for ContainerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Isolated
    }

    fn name(&self) -> &str {
        &self.runtime
    }

    async fn is_available(&self) -> bool {
        if which::which(&self.runtime).is_err() {
            return false;
        }
        let probe = Command::new(&self.runtime)
            .args(["info", "--format", "{{.ServerVersion}}"])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .status();
        match tokio::time::timeout(PROBE_TIMEOUT, probe).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                debug!("Container runtime probe failed: {}", e);
                false
            }
            Err(_) => {
                debug!("Container runtime probe timed out");
                false
            }
        }
    }

    async fn execute(
        &self,
        code: &str,
        language: Language,
        timeout: Duration,
    ) -> Result<ExecutionResult> {
        let workdir = tempfile::Builder::new()
            .prefix("codeloop-ctr-")
            .tempdir()
            .map_err(|e| CodeloopError::sandbox(format!("cannot create scratch dir: {}", e)))?;
        tokio::fs::write(workdir.path().join(language.source_file()), code).await?;

        let container_name = format!("codeloop-{}", uuid::Uuid::new_v4().simple());
        let mut cmd = Command::new(&self.runtime);
        cmd.args(self.run_args(&container_name, language, workdir.path()));

        debug!(
            container = %container_name,
            image = language.container_image(),
            "Running program in container"
        );

        let teardown = Teardown::Container {
            runtime: self.runtime.clone(),
            name: container_name.clone(),
        };
        let run = match run_captured(cmd, timeout, self.output_cap, teardown).await {
            Ok(run) => run,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CodeloopError::sandbox(format!(
                    "container runtime '{}' is not installed",
                    self.runtime
                )));
            }
            Err(e) => {
                return Err(CodeloopError::sandbox(format!(
                    "failed to start container: {}",
                    e
                )));
            }
        };

        if let Some(code) = run.exit_code {
            if RUNTIME_ERROR_EXIT_CODES.contains(&code) {
                return Err(CodeloopError::sandbox(format!(
                    "container runtime error: {}",
                    run.stderr.to_string_lossy().trim()
                )));
            }
        }

        Ok(ExecutionResult::from_capture(run, BackendKind::Isolated))
    }
}
