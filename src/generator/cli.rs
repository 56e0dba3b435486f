//! Generator backed by an LLM command-line tool.
//!
//! The prompt is written to the tool's stdin and the response is read from
//! stdout. Any CLI that follows that convention works; the default is
//! `claude -p --output-format text`.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{code_from_response, CodeGenerator, GenerationRequest, GeneratorSettings};
use crate::error::{CodeloopError, Result};
use crate::prompt::PromptBuilder;

/// Failure modes of one CLI invocation.
#[derive(Debug)]
enum CliFailure {
    /// The program does not exist; retrying will not help
    NotInstalled(String),
    /// Anything else; worth another attempt
    Transient(anyhow::Error),
}

/// Runs an LLM CLI per generation call.
#[derive(Debug, Clone)]
pub struct CliGenerator {
    command: String,
    args: Vec<String>,
    model: Option<String>,
    timeout: Duration,
    working_dir: Option<PathBuf>,
    prompts: PromptBuilder,
}

impl CliGenerator {
    /// Default timeout for one call (5 minutes).
    pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

    /// Create a generator running `command` with `args`.
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            model: None,
            timeout: Duration::from_secs(Self::DEFAULT_TIMEOUT_SECS),
            working_dir: None,
            prompts: PromptBuilder::new(),
        }
    }

    /// Create a generator from the `[generator]` section.
    #[must_use]
    pub fn from_settings(settings: &GeneratorSettings) -> Self {
        let mut generator = Self::new(settings.command.clone(), settings.args.clone())
            .with_timeout(Duration::from_secs(settings.timeout_secs));
        generator.model = settings.model.clone();
        generator
    }

    /// Pass `--model <model>` to the CLI.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run the CLI in `dir` instead of the current directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    async fn run_prompt(&self, prompt: &str) -> std::result::Result<String, CliFailure> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        if let Some(model) = &self.model {
            cmd.args(["--model", model]);
        }
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(
            command = %self.command,
            prompt_chars = prompt.len(),
            "Running generator CLI"
        );

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CliFailure::NotInstalled(format!(
                    "generator command '{}' is not installed or not in PATH",
                    self.command
                )));
            }
            Err(e) => {
                return Err(CliFailure::Transient(anyhow::anyhow!(
                    "failed to spawn '{}': {}",
                    self.command,
                    e
                )));
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            let written = async {
                stdin.write_all(prompt.as_bytes()).await?;
                stdin.flush().await
            }
            .await;
            match written {
                Ok(()) => {}
                // The CLI may exit before reading everything; its output decides.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(e) => {
                    return Err(CliFailure::Transient(
                        anyhow::Error::new(e).context("failed to write prompt to stdin"),
                    ));
                }
            }
            drop(stdin);
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                CliFailure::Transient(anyhow::anyhow!(
                    "generator timed out after {}s",
                    self.timeout.as_secs()
                ))
            })?
            .context("failed to read generator output")
            .map_err(CliFailure::Transient)?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(CliFailure::Transient(anyhow::anyhow!(
                "generator exited with code {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )))
        }
    }
}

#[async_trait]
impl CodeGenerator for CliGenerator {
    fn name(&self) -> &str {
        &self.command
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let prompt = self.prompts.build(request);
        match self.run_prompt(&prompt).await {
            Ok(response) => code_from_response(&response, request.language),
            Err(CliFailure::NotInstalled(message)) => Err(CodeloopError::Other(anyhow::anyhow!(message))),
            Err(CliFailure::Transient(e)) => Err(CodeloopError::generation(format!("{:#}", e), 1)),
        }
    }
}
