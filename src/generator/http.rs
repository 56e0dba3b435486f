//! Generator backed by an OpenAI-compatible chat completions API.
//!
//! Works with any server exposing `POST {endpoint}/chat/completions`. The
//! API key is read from the environment variable named in
//! `[generator] api_key_env`; leave that empty for servers without auth.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{code_from_response, CodeGenerator, GenerationRequest, GeneratorSettings};
use crate::error::{CodeloopError, Result};
use crate::prompt::PromptBuilder;

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Calls a chat completions endpoint per generation call.
#[derive(Debug, Clone)]
pub struct HttpGenerator {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key_env: String,
    prompts: PromptBuilder,
}

impl HttpGenerator {
    /// Model used when none is configured.
    pub const DEFAULT_MODEL: &'static str = "gpt-4o-mini";

    /// Create a generator for `endpoint` and `model`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key_env: String::new(),
            prompts: PromptBuilder::new(),
        })
    }

    /// Create a generator from the `[generator]` section.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_settings(settings: &GeneratorSettings) -> Result<Self> {
        let model = settings
            .model
            .clone()
            .unwrap_or_else(|| Self::DEFAULT_MODEL.to_string());
        Ok(Self::new(
            settings.endpoint.clone(),
            model,
            Duration::from_secs(settings.timeout_secs),
        )?
        .with_api_key_env(settings.api_key_env.clone()))
    }

    /// Read the bearer token from this environment variable.
    #[must_use]
    pub fn with_api_key_env(mut self, var: impl Into<String>) -> Self {
        self.api_key_env = var.into();
        self
    }

    fn api_key(&self) -> Result<Option<String>> {
        if self.api_key_env.is_empty() {
            return Ok(None);
        }
        match std::env::var(&self.api_key_env) {
            Ok(key) if !key.trim().is_empty() => Ok(Some(key)),
            _ => Err(CodeloopError::config(format!(
                "environment variable {} is not set",
                self.api_key_env
            ))),
        }
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.endpoint);
        let body = ChatCompletionRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: 0.2,
        };

        debug!(
            model = %self.model,
            prompt_chars = prompt.len(),
            "Sending chat completion request"
        );

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = self.api_key()? {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                CodeloopError::generation("request timed out", 1)
            } else {
                CodeloopError::generation(format!("request failed: {}", e), 1)
            }
        })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| CodeloopError::generation(format!("failed to read response: {}", e), 1))?;

        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(CodeloopError::generation(
                format!("endpoint returned {}: {}", status, truncate(&text, 200)),
                1,
            ));
        }
        if !status.is_success() {
            return Err(CodeloopError::Other(anyhow::anyhow!(
                "endpoint rejected request with {}: {}",
                status,
                truncate(&text, 200)
            )));
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&text)
            .map_err(|e| CodeloopError::generation(format!("malformed response: {}", e), 1))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| CodeloopError::generation("response had no choices", 1))
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let head: String = text.chars().take(max).collect();
        format!("{}...", head)
    }
}

#[async_trait]
impl CodeGenerator for HttpGenerator {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let prompt = self.prompts.build(request);
        let response = self.complete(&prompt).await?;
        code_from_response(&response, request.language)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::Language;
    use crate::task::TaskKind;
    use crate::testing::http_stub::StubServer;
    use serde_json::json;

    fn request() -> GenerationRequest {
        GenerationRequest {
            task_description: "print hello".to_string(),
            language: Language::Python,
            task_kind: TaskKind::General,
            requirements: vec![],
            test_criteria: vec![],
            feedback: None,
            iteration: 1,
        }
    }

    fn completion(content: &str) -> serde_json::Value {
        json!({ "choices": [ { "message": { "role": "assistant", "content": content } } ] })
    }

    #[tokio::test]
    async fn test_generates_from_completion() {
        let server = StubServer::start(vec![(200, completion("```python\nprint('hello')\n```"))]).await;
        let generator =
            HttpGenerator::new(server.url(), "test-model", Duration::from_secs(5)).unwrap();
        let code = generator.generate(&request()).await.unwrap();
        assert_eq!(code, "print('hello')\n");

        let bodies = server.bodies();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0]["model"], "test-model");
        assert!(bodies[0]["messages"][0]["content"]
            .as_str()
            .unwrap()
            .contains("print hello"));
    }

    #[tokio::test]
    async fn test_sends_bearer_token_from_env() {
        std::env::set_var("CODELOOP_TEST_HTTP_KEY", "sk-test");
        let server = StubServer::start(vec![(200, completion("print(1)"))]).await;
        let generator = HttpGenerator::new(server.url(), "m", Duration::from_secs(5))
            .unwrap()
            .with_api_key_env("CODELOOP_TEST_HTTP_KEY");
        generator.generate(&request()).await.unwrap();
        assert_eq!(
            server.authorization(),
            vec![Some("Bearer sk-test".to_string())]
        );
    }

    #[tokio::test]
    async fn test_missing_key_is_not_retryable() {
        let generator = HttpGenerator::new("http://127.0.0.1:9", "m", Duration::from_secs(1))
            .unwrap()
            .with_api_key_env("CODELOOP_TEST_UNSET_KEY");
        let err = generator.generate(&request()).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let server = StubServer::start(vec![(503, json!({"error": "overloaded"}))]).await;
        let generator = HttpGenerator::new(server.url(), "m", Duration::from_secs(5)).unwrap();
        let err = generator.generate(&request()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn test_client_error_is_not_retryable() {
        let server = StubServer::start(vec![(400, json!({"error": "bad model"}))]).await;
        let generator = HttpGenerator::new(server.url(), "m", Duration::from_secs(5)).unwrap();
        let err = generator.generate(&request()).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_empty_choices_is_malformed() {
        let server = StubServer::start(vec![(200, json!({"choices": []}))]).await;
        let generator = HttpGenerator::new(server.url(), "m", Duration::from_secs(5)).unwrap();
        let err = generator.generate(&request()).await.unwrap_err();
        assert!(matches!(err, CodeloopError::Generation { .. }));
    }
}
