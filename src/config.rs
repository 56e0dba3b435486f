//! Orchestrator configuration.
//!
//! Configuration is a TOML file with one table per concern:
//!
//! ```toml
//! [generator]
//! backend = "cli"
//! command = "claude"
//!
//! [sandbox]
//! isolation = "auto"
//! execution_timeout_secs = 10
//!
//! [session]
//! default_max_iterations = 5
//! default_quality_threshold = 80
//!
//! [concurrency]
//! max_concurrent_sessions = 4
//! admission = "queue"
//! ```
//!
//! Every field has a default, so an empty file (or no file) is valid.
//! Files are looked up in this order: an explicit path, then
//! `<project>/.codeloop/config.toml`, then the user config directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CodeloopError, Result};
use crate::generator::{GeneratorBackend, GeneratorSettings};
use crate::notifier::CallbackSettings;
use crate::orchestrator::AdmissionPolicy;
use crate::sandbox::SandboxSettings;
use crate::session::SessionLimits;

/// Smallest accepted output cap in bytes.
const MIN_OUTPUT_CAP: usize = 1024;

// ============================================================================
// Sections
// ============================================================================

/// `[session]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_max_iterations")]
    pub default_max_iterations: u32,
    #[serde(default = "default_quality_threshold")]
    pub default_quality_threshold: u8,
    /// Wall-clock budget for a whole session
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,
    /// Largest `max_iterations` a request may ask for
    #[serde(default = "default_max_iterations_limit")]
    pub max_iterations_limit: u32,
}

fn default_max_iterations() -> u32 {
    5
}

fn default_quality_threshold() -> u8 {
    80
}

fn default_session_timeout() -> u64 {
    600
}

fn default_max_iterations_limit() -> u32 {
    50
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_max_iterations: default_max_iterations(),
            default_quality_threshold: default_quality_threshold(),
            session_timeout_secs: default_session_timeout(),
            max_iterations_limit: default_max_iterations_limit(),
        }
    }
}

impl SessionSettings {
    /// Request defaults and bounds.
    #[must_use]
    pub fn limits(&self) -> SessionLimits {
        SessionLimits {
            default_max_iterations: self.default_max_iterations,
            default_quality_threshold: self.default_quality_threshold,
            max_iterations_limit: self.max_iterations_limit,
        }
    }

    #[must_use]
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }
}

/// `[concurrency]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencySettings {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_sessions: usize,
    #[serde(default)]
    pub admission: AdmissionPolicy,
}

fn default_max_concurrent() -> usize {
    4
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: default_max_concurrent(),
            admission: AdmissionPolicy::default(),
        }
    }
}

/// `[persistence]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceSettings {
    #[serde(default)]
    pub enabled: bool,
    /// Relative paths resolve against the project directory
    #[serde(default = "default_persistence_dir")]
    pub dir: PathBuf,
}

fn default_persistence_dir() -> PathBuf {
    PathBuf::from(".codeloop/sessions")
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: default_persistence_dir(),
        }
    }
}

// ============================================================================
// Root
// ============================================================================

/// Complete orchestrator configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub generator: GeneratorSettings,
    #[serde(default)]
    pub sandbox: SandboxSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub concurrency: ConcurrencySettings,
    #[serde(default)]
    pub callback: CallbackSettings,
    #[serde(default)]
    pub persistence: PersistenceSettings,
}

impl OrchestratorConfig {
    /// Project-level config path.
    pub fn project_path(project_dir: &Path) -> PathBuf {
        project_dir.join(".codeloop").join("config.toml")
    }

    /// User-level config path, if the platform has a config directory.
    pub fn user_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("codeloop").join("config.toml"))
    }

    /// Parse a config file.
    ///
    /// # Errors
    ///
    /// Returns [`CodeloopError::Config`] if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CodeloopError::config_with_path(format!("cannot read config: {}", e), path.to_path_buf())
        })?;
        Self::from_toml(&content).map_err(|e| match e {
            CodeloopError::Toml(err) => CodeloopError::config_with_path(
                format!("cannot parse config: {}", err),
                path.to_path_buf(),
            ),
            other => other,
        })
    }

    /// Parse TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`CodeloopError::Toml`] for malformed input.
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Find and load the effective config.
    ///
    /// Returns the config and the file it came from (`None` for defaults).
    ///
    /// # Errors
    ///
    /// Returns an error if an explicit path is missing or any found file is
    /// malformed.
    pub fn discover(
        explicit: Option<&Path>,
        project_dir: &Path,
    ) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = explicit {
            return Ok((Self::load(path)?, Some(path.to_path_buf())));
        }
        let candidates = std::iter::once(Self::project_path(project_dir)).chain(Self::user_path());
        for candidate in candidates {
            if candidate.is_file() {
                debug!("Loading configuration from {}", candidate.display());
                return Ok((Self::load(&candidate)?, Some(candidate)));
            }
        }
        debug!("No configuration file found, using defaults");
        Ok((Self::default(), None))
    }

    /// Render as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| CodeloopError::config(format!("cannot serialize config: {}", e)))
    }

    /// Persistence directory resolved against `project_dir`.
    #[must_use]
    pub fn persistence_dir(&self, project_dir: &Path) -> PathBuf {
        if self.persistence.dir.is_absolute() {
            self.persistence.dir.clone()
        } else {
            project_dir.join(&self.persistence.dir)
        }
    }

    /// Reject values the orchestrator cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`CodeloopError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        let session = &self.session;
        if session.max_iterations_limit == 0 {
            return Err(CodeloopError::invalid_config(
                "session.max_iterations_limit",
                "must be at least 1",
            ));
        }
        if session.default_max_iterations == 0
            || session.default_max_iterations > session.max_iterations_limit
        {
            return Err(CodeloopError::invalid_config(
                "session.default_max_iterations",
                format!("must be between 1 and {}", session.max_iterations_limit),
            ));
        }
        if session.default_quality_threshold > 100 {
            return Err(CodeloopError::invalid_config(
                "session.default_quality_threshold",
                "must be between 0 and 100",
            ));
        }
        if session.session_timeout_secs == 0 {
            return Err(CodeloopError::invalid_config(
                "session.session_timeout_secs",
                "must be greater than 0",
            ));
        }

        let sandbox = &self.sandbox;
        if sandbox.execution_timeout_secs == 0 {
            return Err(CodeloopError::invalid_config(
                "sandbox.execution_timeout_secs",
                "must be greater than 0",
            ));
        }
        if sandbox.execution_timeout_secs > session.session_timeout_secs {
            return Err(CodeloopError::invalid_config(
                "sandbox.execution_timeout_secs",
                "must not exceed session.session_timeout_secs",
            ));
        }
        if sandbox.output_cap_bytes < MIN_OUTPUT_CAP {
            return Err(CodeloopError::invalid_config(
                "sandbox.output_cap_bytes",
                format!("must be at least {}", MIN_OUTPUT_CAP),
            ));
        }
        if sandbox.container_runtime.trim().is_empty() {
            return Err(CodeloopError::invalid_config(
                "sandbox.container_runtime",
                "must not be empty",
            ));
        }

        if self.concurrency.max_concurrent_sessions == 0 {
            return Err(CodeloopError::invalid_config(
                "concurrency.max_concurrent_sessions",
                "must be at least 1",
            ));
        }
        if self.callback.max_attempts == 0 {
            return Err(CodeloopError::invalid_config(
                "callback.max_attempts",
                "must be at least 1",
            ));
        }

        let generator = &self.generator;
        if generator.max_retries == 0 {
            return Err(CodeloopError::invalid_config(
                "generator.max_retries",
                "must be at least 1",
            ));
        }
        if generator.timeout_secs == 0 {
            return Err(CodeloopError::invalid_config(
                "generator.timeout_secs",
                "must be greater than 0",
            ));
        }
        match generator.backend {
            GeneratorBackend::Cli => {
                if generator.command.trim().is_empty() {
                    return Err(CodeloopError::invalid_config(
                        "generator.command",
                        "must not be empty for the cli backend",
                    ));
                }
            }
            GeneratorBackend::Http => match url::Url::parse(&generator.endpoint) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => {}
                _ => {
                    return Err(CodeloopError::invalid_config(
                        "generator.endpoint",
                        format!("'{}' is not an http(s) URL", generator.endpoint),
                    ));
                }
            },
        }

        Ok(())
    }
}
