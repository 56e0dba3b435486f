//! Terminal-state callbacks.
//!
//! When a session with a `callback_url` terminates, its [`TaskOutcome`] is
//! POSTed to that URL as JSON. Delivery is best-effort: it runs on its own
//! task, retries transient failures with backoff, and never changes the
//! session's status.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{CodeloopError, Result};
use crate::retry::RetryPolicy;
use crate::session::TaskOutcome;

/// Delivers terminal outcomes to caller-supplied endpoints.
#[async_trait]
pub trait CallbackNotifier: Send + Sync {
    /// Deliver `outcome` to `url`, retrying as the implementation sees fit.
    ///
    /// # Errors
    ///
    /// Returns [`CodeloopError::Notification`] once delivery is abandoned.
    async fn notify(&self, url: &str, outcome: &TaskOutcome) -> Result<()>;
}

/// `[callback]` configuration section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackSettings {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub timeout_secs: u64,
}

impl Default for CallbackSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 500,
            timeout_secs: 10,
        }
    }
}

/// JSON-over-HTTP notifier.
#[derive(Debug, Clone)]
pub struct HttpCallbackNotifier {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl HttpCallbackNotifier {
    /// Create a notifier with the given per-request timeout and retry policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(timeout: Duration, policy: RetryPolicy) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;
        Ok(Self { client, policy })
    }

    /// Create a notifier from the `[callback]` section.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_settings(settings: &CallbackSettings) -> Result<Self> {
        Self::new(
            Duration::from_secs(settings.timeout_secs),
            RetryPolicy::new(settings.max_attempts, settings.backoff_base_ms),
        )
    }
}

/// Outcome of one delivery attempt.
enum Attempt {
    Delivered,
    Retry(String),
    GiveUp(String),
}

fn is_retryable_network_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

impl HttpCallbackNotifier {
    async fn attempt(&self, url: &str, outcome: &TaskOutcome) -> Attempt {
        let response = match self.client.post(url).json(outcome).send().await {
            Ok(response) => response,
            Err(e) if is_retryable_network_error(&e) => return Attempt::Retry(e.to_string()),
            Err(e) => return Attempt::GiveUp(e.to_string()),
        };
        let status = response.status();
        if status.is_success() {
            Attempt::Delivered
        } else if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Attempt::Retry(format!("endpoint returned {}", status))
        } else {
            Attempt::GiveUp(format!("endpoint returned {}", status))
        }
    }
}

#[async_trait]
impl CallbackNotifier for HttpCallbackNotifier {
    async fn notify(&self, url: &str, outcome: &TaskOutcome) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(url, outcome).await {
                Attempt::Delivered => {
                    debug!(url, attempt, session_id = %outcome.session_id, "Callback delivered");
                    return Ok(());
                }
                Attempt::Retry(message) if self.policy.should_retry(attempt) => {
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Callback delivery failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Attempt::Retry(message) | Attempt::GiveUp(message) => {
                    return Err(CodeloopError::Notification {
                        url: url.to_string(),
                        attempts: attempt,
                        message,
                    });
                }
            }
        }
    }
}

/// Deliver `outcome` on a background task. Failures are logged only.
pub fn spawn_notify(
    notifier: Arc<dyn CallbackNotifier>,
    url: String,
    outcome: TaskOutcome,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match notifier.notify(&url, &outcome).await {
            Ok(()) => info!(
                session_id = %outcome.session_id,
                url = %url,
                "Callback delivered"
            ),
            Err(e) => warn!(
                session_id = %outcome.session_id,
                url = %url,
                error = %e,
                "Callback abandoned"
            ),
        }
    })
}
