//! Custom error types for codeloop.
//!
//! This module provides the structured error taxonomy used across the
//! orchestrator. Each variant maps onto one of the terminal reasons a
//! session can end with, so a failure deep inside a collaborator can be
//! surfaced to callers without string matching.

use std::path::PathBuf;
use thiserror::Error;

use crate::session::TerminalReason;

/// Main error type for codeloop operations
#[derive(Error, Debug)]
pub enum CodeloopError {
    // =========================================================================
    // Input Errors
    // =========================================================================
    /// Malformed or unsupported input, rejected before any session exists
    #[error("Invalid input: {field} - {reason}")]
    Validation { field: String, reason: String },

    /// Session lookup failed
    #[error("Session not found: {session_id}")]
    NotFound { session_id: String },

    /// Operation not allowed in the session's current state
    #[error("Session {session_id}: {reason}")]
    InvalidState { session_id: String, reason: String },

    /// Admission control refused a new session
    #[error("Admission rejected: {running} sessions running (limit {limit})")]
    AdmissionRejected { running: usize, limit: usize },

    // =========================================================================
    // Pipeline Errors
    // =========================================================================
    /// Code generation backend failed after internal retries
    #[error("Code generation failed after {attempts} attempt(s): {message}")]
    Generation { message: String, attempts: u32 },

    /// Neither the isolated nor the process execution path is usable
    #[error("Sandbox unavailable: {message}")]
    Sandbox { message: String },

    /// Callback delivery failed (never affects session status)
    #[error("Callback delivery to {url} failed after {attempts} attempt(s): {message}")]
    Notification {
        url: String,
        attempts: u32,
        message: String,
    },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// TOML parse error wrapper
    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CodeloopError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a validation error
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(session_id: impl Into<String>) -> Self {
        Self::NotFound {
            session_id: session_id.into(),
        }
    }

    /// Create an invalid-state error
    pub fn invalid_state(session_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidState {
            session_id: session_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a generation error
    pub fn generation(message: impl Into<String>, attempts: u32) -> Self {
        Self::Generation {
            message: message.into(),
            attempts,
        }
    }

    /// Create a sandbox error
    pub fn sandbox(message: impl Into<String>) -> Self {
        Self::Sandbox {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Check if this error is worth retrying inside a collaborator
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Generation { .. } | Self::Notification { .. } | Self::Io(_)
        )
    }

    /// The terminal reason a session resolves to when this error ends it.
    ///
    /// Returns `None` for errors that never terminate a session
    /// (notification failures, lookups, configuration).
    pub fn terminal_reason(&self) -> Option<TerminalReason> {
        match self {
            Self::Validation { .. } => Some(TerminalReason::InvalidInput),
            Self::Generation { .. } => Some(TerminalReason::GenerationFailed),
            Self::Sandbox { .. } => Some(TerminalReason::SandboxUnavailable),
            _ => None,
        }
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation { .. } => 2,
            Self::Generation { .. } => 3,
            Self::Sandbox { .. } => 4,
            Self::AdmissionRejected { .. } => 5,
            Self::NotFound { .. } => 6,
            Self::Config { .. } | Self::InvalidConfig { .. } | Self::Toml(_) => 7,
            _ => 1,
        }
    }
}

/// Type alias for codeloop results
pub type Result<T> = std::result::Result<T, CodeloopError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CodeloopError::validation("language", "unsupported language 'cobol'");
        assert!(err.to_string().contains("language"));
        assert!(err.to_string().contains("cobol"));

        let err = CodeloopError::generation("backend unavailable", 3);
        assert!(err.to_string().contains("3 attempt"));
    }

    #[test]
    fn test_terminal_reason_mapping() {
        assert_eq!(
            CodeloopError::validation("x", "y").terminal_reason(),
            Some(TerminalReason::InvalidInput)
        );
        assert_eq!(
            CodeloopError::generation("boom", 1).terminal_reason(),
            Some(TerminalReason::GenerationFailed)
        );
        assert_eq!(
            CodeloopError::sandbox("no runtime").terminal_reason(),
            Some(TerminalReason::SandboxUnavailable)
        );
        assert_eq!(CodeloopError::not_found("abc").terminal_reason(), None);
        assert_eq!(
            CodeloopError::Notification {
                url: "http://x".into(),
                attempts: 3,
                message: "refused".into()
            }
            .terminal_reason(),
            None
        );
    }

    #[test]
    fn test_is_retryable() {
        assert!(CodeloopError::generation("timeout", 1).is_retryable());
        assert!(!CodeloopError::sandbox("missing").is_retryable());
        assert!(!CodeloopError::validation("a", "b").is_retryable());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(CodeloopError::validation("a", "b").exit_code(), 2);
        assert_eq!(CodeloopError::generation("a", 1).exit_code(), 3);
        assert_eq!(CodeloopError::sandbox("a").exit_code(), 4);
        assert_eq!(CodeloopError::config("bad").exit_code(), 7);
        assert_eq!(
            CodeloopError::AdmissionRejected {
                running: 4,
                limit: 4
            }
            .exit_code(),
            5
        );
    }

    #[test]
    fn test_config_with_path() {
        let path = PathBuf::from("/test/config.toml");
        let err = CodeloopError::config_with_path("failed to parse", path.clone());
        if let CodeloopError::Config {
            message,
            path: opt_path,
        } = err
        {
            assert_eq!(message, "failed to parse");
            assert_eq!(opt_path, Some(path));
        } else {
            panic!("Wrong error variant");
        }
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: CodeloopError = io_err.into();
        assert!(matches!(err, CodeloopError::Io(_)));
        assert!(err.to_string().contains("access denied"));
    }
}
