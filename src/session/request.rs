//! Inbound task requests and their validation.
//!
//! [`TaskRequest`] is the transport-agnostic shape of a "submit task" call.
//! [`TaskRequest::validate`] turns it into a [`ValidatedTask`] or rejects it
//! with [`CodeloopError::Validation`] before any session exists.

use serde::{Deserialize, Serialize};

use crate::analyzer::normalize;
use crate::error::{CodeloopError, Result};
use crate::language::Language;
use crate::task::{TaskCapability, TaskKind};

/// Submit-task input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_description: String,
    pub programming_language: String,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub test_criteria: Vec<String>,
    #[serde(default)]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub quality_threshold: Option<u32>,
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub task_kind: TaskKind,
}

impl TaskRequest {
    /// Start a request with the two mandatory fields.
    pub fn new(task_description: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            task_description: task_description.into(),
            programming_language: language.into(),
            ..Self::default()
        }
    }

    /// Add a requirement.
    #[must_use]
    pub fn with_requirement(mut self, requirement: impl Into<String>) -> Self {
        self.requirements.push(requirement.into());
        self
    }

    /// Add a test criterion.
    #[must_use]
    pub fn with_criterion(mut self, criterion: impl Into<String>) -> Self {
        self.test_criteria.push(criterion.into());
        self
    }

    /// Override the iteration budget.
    #[must_use]
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = Some(max);
        self
    }

    /// Override the quality threshold.
    #[must_use]
    pub fn with_quality_threshold(mut self, threshold: u32) -> Self {
        self.quality_threshold = Some(threshold);
        self
    }

    /// Ask for a terminal callback.
    #[must_use]
    pub fn with_callback_url(mut self, url: impl Into<String>) -> Self {
        self.callback_url = Some(url.into());
        self
    }

    /// Select a task kind.
    #[must_use]
    pub fn with_task_kind(mut self, kind: TaskKind) -> Self {
        self.task_kind = kind;
        self
    }

    /// Check every field and resolve defaults.
    ///
    /// # Errors
    ///
    /// Returns [`CodeloopError::Validation`] naming the first offending field.
    pub fn validate(&self, limits: &SessionLimits) -> Result<ValidatedTask> {
        let task_description = self.task_description.trim();
        if task_description.is_empty() {
            return Err(CodeloopError::validation(
                "task_description",
                "must not be empty",
            ));
        }

        let language: Language = self
            .programming_language
            .parse()
            .map_err(|e| CodeloopError::validation("programming_language", format!("{}", e)))?;

        let requirements = validate_entries("requirements", &self.requirements)?;
        let mut test_criteria = validate_entries("test_criteria", &self.test_criteria)?;
        for (i, criterion) in test_criteria.iter().enumerate() {
            let key = normalize(criterion);
            if requirements.iter().any(|r| normalize(r) == key) {
                return Err(CodeloopError::validation(
                    format!("test_criteria[{}]", i),
                    format!("'{}' is already listed as a requirement", criterion),
                ));
            }
        }

        let max_iterations = self.max_iterations.unwrap_or(limits.default_max_iterations);
        if max_iterations == 0 {
            return Err(CodeloopError::validation(
                "max_iterations",
                "must be at least 1",
            ));
        }
        if max_iterations > limits.max_iterations_limit {
            return Err(CodeloopError::validation(
                "max_iterations",
                format!("must not exceed {}", limits.max_iterations_limit),
            ));
        }

        let threshold = self
            .quality_threshold
            .unwrap_or(u32::from(limits.default_quality_threshold));
        let quality_threshold = u8::try_from(threshold)
            .ok()
            .filter(|t| *t <= 100)
            .ok_or_else(|| {
                CodeloopError::validation("quality_threshold", "must be between 0 and 100")
            })?;

        let callback_url = match &self.callback_url {
            Some(raw) => Some(validate_callback_url(raw)?),
            None => None,
        };

        self.task_kind.validate_params()?;
        for implied in self.task_kind.implied_criteria() {
            let key = normalize(&implied);
            let listed = requirements
                .iter()
                .chain(test_criteria.iter())
                .any(|c| normalize(c) == key);
            if !listed {
                test_criteria.push(implied);
            }
        }

        Ok(ValidatedTask {
            task_description: task_description.to_string(),
            language,
            task_kind: self.task_kind.clone(),
            requirements,
            test_criteria,
            max_iterations,
            quality_threshold,
            callback_url,
        })
    }
}

/// A request that passed validation, with defaults resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedTask {
    pub task_description: String,
    pub language: Language,
    pub task_kind: TaskKind,
    pub requirements: Vec<String>,
    pub test_criteria: Vec<String>,
    pub max_iterations: u32,
    pub quality_threshold: u8,
    pub callback_url: Option<String>,
}

/// Defaults and bounds applied during validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub default_max_iterations: u32,
    pub default_quality_threshold: u8,
    pub max_iterations_limit: u32,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            default_max_iterations: 5,
            default_quality_threshold: 80,
            max_iterations_limit: 50,
        }
    }
}

fn validate_entries(field: &str, entries: &[String]) -> Result<Vec<String>> {
    let mut out: Vec<String> = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        let trimmed = entry.trim();
        if trimmed.is_empty() {
            return Err(CodeloopError::validation(
                format!("{}[{}]", field, i),
                "must not be blank",
            ));
        }
        if out.iter().any(|e| normalize(e) == normalize(trimmed)) {
            return Err(CodeloopError::validation(
                format!("{}[{}]", field, i),
                format!("duplicate entry '{}'", trimmed),
            ));
        }
        out.push(trimmed.to_string());
    }
    Ok(out)
}

fn validate_callback_url(raw: &str) -> Result<String> {
    let parsed = url::Url::parse(raw.trim())
        .map_err(|e| CodeloopError::validation("callback_url", e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed.to_string()),
        other => Err(CodeloopError::validation(
            "callback_url",
            format!("unsupported scheme '{}'", other),
        )),
    }
}
