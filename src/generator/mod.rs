//! Code generation backends.
//!
//! A [`CodeGenerator`] turns a task description, plus feedback from the
//! previous iteration, into program text. Two backends exist:
//!
//! - [`CliGenerator`] - pipes the prompt to an LLM command-line tool
//! - [`HttpGenerator`] - calls an OpenAI-compatible chat completions endpoint
//!
//! Both are wrapped in a [`RetryingGenerator`] that absorbs transient
//! failures before the session sees them. Sub-retries never consume
//! session iterations.

pub mod cli;
pub mod http;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CodeloopError, Result};
use crate::language::Language;
use crate::retry::RetryPolicy;
use crate::session::Session;
use crate::task::TaskKind;

pub use cli::CliGenerator;
pub use http::HttpGenerator;

/// Input to one generation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub task_description: String,
    pub language: Language,
    pub task_kind: TaskKind,
    pub requirements: Vec<String>,
    pub test_criteria: Vec<String>,
    /// Validator feedback from the previous iteration; `None` on the first
    pub feedback: Option<String>,
    /// 1-based iteration this code is for
    pub iteration: u32,
}

impl GenerationRequest {
    /// Request for iteration `iteration` of `session`.
    #[must_use]
    pub fn for_session(session: &Session, iteration: u32, feedback: Option<String>) -> Self {
        Self {
            task_description: session.task_description.clone(),
            language: session.language,
            task_kind: session.task_kind.clone(),
            requirements: session.requirements.clone(),
            test_criteria: session.test_criteria.clone(),
            feedback,
            iteration,
        }
    }
}

/// Produces candidate programs.
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Generate program text for `request`.
    ///
    /// # Errors
    ///
    /// Returns [`CodeloopError::Generation`] when the backend is unreachable
    /// or its response holds no code.
    async fn generate(&self, request: &GenerationRequest) -> Result<String>;
}

/// Pull program text out of a model response.
///
/// Picks the first fenced block tagged with `language`, else the first
/// fenced block of any kind, else the whole response when it has no
/// fences. Returns `None` when nothing but whitespace is left.
#[must_use]
pub fn extract_code(response: &str, language: Language) -> Option<String> {
    let blocks = fenced_blocks(response);
    let tags = language.fence_tags();

    let chosen = if blocks.is_empty() {
        response.trim().to_string()
    } else {
        blocks
            .iter()
            .find(|(info, _)| tags.contains(&info.as_str()))
            .or_else(|| blocks.first())
            .map(|(_, body)| body.clone())
            .unwrap_or_default()
    };

    let trimmed = chosen.trim_matches('\n').trim_end();
    if trimmed.trim().is_empty() {
        None
    } else {
        Some(format!("{}\n", trimmed))
    }
}

/// `(info_string, body)` for every fenced block. An unclosed fence runs to
/// the end of the text.
fn fenced_blocks(text: &str) -> Vec<(String, String)> {
    let mut blocks = Vec::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in text.lines() {
        let trimmed = line.trim_start();
        match current.take() {
            None => {
                if let Some(info) = trimmed.strip_prefix("```") {
                    let tag = info
                        .split_whitespace()
                        .next()
                        .unwrap_or_default()
                        .to_lowercase();
                    current = Some((tag, Vec::new()));
                }
            }
            Some((tag, mut body)) => {
                if trimmed.starts_with("```") {
                    blocks.push((tag, body.join("\n")));
                } else {
                    body.push(line);
                    current = Some((tag, body));
                }
            }
        }
    }
    if let Some((tag, body)) = current {
        blocks.push((tag, body.join("\n")));
    }
    blocks
}

/// Turn a raw backend response into code, or a malformed-response error.
pub(crate) fn code_from_response(response: &str, language: Language) -> Result<String> {
    extract_code(response, language)
        .ok_or_else(|| CodeloopError::generation("response contained no code", 1))
}

/// Wraps a generator with bounded sub-retries.
pub struct RetryingGenerator {
    inner: Arc<dyn CodeGenerator>,
    policy: RetryPolicy,
}

impl RetryingGenerator {
    #[must_use]
    pub fn new(inner: Arc<dyn CodeGenerator>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl CodeGenerator for RetryingGenerator {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.inner.generate(request).await {
                Ok(code) => {
                    if attempt > 1 {
                        debug!(attempt, generator = self.inner.name(), "Generation recovered");
                    }
                    return Ok(code);
                }
                Err(e) if e.is_retryable() && self.policy.should_retry(attempt) => {
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Generation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    let message = match e {
                        CodeloopError::Generation { message, .. } => message,
                        other => other.to_string(),
                    };
                    return Err(CodeloopError::generation(message, attempt));
                }
            }
        }
    }
}

/// Which generator backend to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeneratorBackend {
    /// LLM command-line tool
    #[default]
    Cli,
    /// OpenAI-compatible HTTP API
    Http,
}

/// `[generator]` configuration section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorSettings {
    pub backend: GeneratorBackend,
    /// Program to run for the CLI backend
    pub command: String,
    /// Arguments for the CLI backend; the prompt goes to stdin
    pub args: Vec<String>,
    /// Base URL for the HTTP backend
    pub endpoint: String,
    /// Model name; passed as `--model` to the CLI when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Name of the environment variable holding the API key
    pub api_key_env: String,
    pub timeout_secs: u64,
    /// Total attempts per generation call
    pub max_retries: u32,
    pub retry_base_ms: u64,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            backend: GeneratorBackend::Cli,
            command: "claude".to_string(),
            args: vec![
                "-p".to_string(),
                "--output-format".to_string(),
                "text".to_string(),
            ],
            endpoint: "https://api.openai.com/v1".to_string(),
            model: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 300,
            max_retries: 3,
            retry_base_ms: 2000,
        }
    }
}

impl GeneratorSettings {
    /// Retry policy for sub-retries.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_base_ms)
    }
}

/// Build the configured generator, wrapped with sub-retries.
///
/// # Errors
///
/// Returns an error if the HTTP client cannot be constructed.
pub fn build_generator(settings: &GeneratorSettings) -> Result<Arc<dyn CodeGenerator>> {
    let inner: Arc<dyn CodeGenerator> = match settings.backend {
        GeneratorBackend::Cli => Arc::new(CliGenerator::from_settings(settings)),
        GeneratorBackend::Http => Arc::new(HttpGenerator::from_settings(settings)?),
    };
    Ok(Arc::new(RetryingGenerator::new(
        inner,
        settings.retry_policy(),
    )))
}
