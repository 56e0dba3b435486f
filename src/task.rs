//! Task kinds.
//!
//! Every session carries a [`TaskKind`]. The set is closed: each variant
//! holds its own parameters and answers the same [`TaskCapability`]
//! questions, which shape the generation prompt and add implied checks to
//! the session's test criteria.

use serde::{Deserialize, Serialize};

use crate::error::{CodeloopError, Result};

/// Fixed interface every task kind implements.
pub trait TaskCapability {
    /// Short identifier used in logs.
    fn kind_name(&self) -> &'static str;

    /// Extra guidance appended to the generation prompt.
    fn prompt_guidance(&self) -> Option<String>;

    /// Checks implied by this kind, appended to the session criteria.
    fn implied_criteria(&self) -> Vec<String>;

    /// Reject malformed per-kind parameters.
    ///
    /// # Errors
    ///
    /// Returns [`CodeloopError::Validation`] naming the bad parameter.
    fn validate_params(&self) -> Result<()>;
}

/// What kind of program a session asks for.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// Free-form task, no extra constraints
    #[default]
    General,
    /// Transform records from one format to another
    DataProcessing {
        input_format: String,
        output_format: String,
    },
    /// Extract data from HTML
    WebScraping {
        target_url: String,
        #[serde(default)]
        selectors: Vec<String>,
    },
    /// Run a model over an input
    ModelInference {
        model_name: String,
        #[serde(default)]
        input_shape: Vec<u32>,
    },
}

impl TaskCapability for TaskKind {
    fn kind_name(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::DataProcessing { .. } => "data_processing",
            Self::WebScraping { .. } => "web_scraping",
            Self::ModelInference { .. } => "model_inference",
        }
    }

    fn prompt_guidance(&self) -> Option<String> {
        match self {
            Self::General => None,
            Self::DataProcessing {
                input_format,
                output_format,
            } => Some(format!(
                "The program processes {} input and must emit valid {} output. \
                 Embed a small representative sample input instead of reading files.",
                input_format, output_format
            )),
            Self::WebScraping {
                target_url,
                selectors,
            } => {
                let mut text = format!(
                    "The program extracts data from HTML served at {}. \
                     The sandbox has no network access: parse an embedded HTML fixture \
                     that mirrors the page structure.",
                    target_url
                );
                if !selectors.is_empty() {
                    text.push_str(&format!(" Target selectors: {}.", selectors.join(", ")));
                }
                Some(text)
            }
            Self::ModelInference {
                model_name,
                input_shape,
            } => {
                let shape = if input_shape.is_empty() {
                    "unspecified".to_string()
                } else {
                    input_shape
                        .iter()
                        .map(u32::to_string)
                        .collect::<Vec<_>>()
                        .join("x")
                };
                Some(format!(
                    "The program runs inference with a stand-in for model '{}' \
                     (input shape {}) using only the standard library.",
                    model_name, shape
                ))
            }
        }
    }

    fn implied_criteria(&self) -> Vec<String> {
        match self {
            Self::General => Vec::new(),
            Self::DataProcessing { output_format, .. } => {
                vec![format!("output is valid {}", output_format)]
            }
            Self::WebScraping { .. } => vec!["extracted records are non-empty".to_string()],
            Self::ModelInference { .. } => {
                vec!["prediction output matches the expected shape".to_string()]
            }
        }
    }

    fn validate_params(&self) -> Result<()> {
        match self {
            Self::General => Ok(()),
            Self::DataProcessing {
                input_format,
                output_format,
            } => {
                if input_format.trim().is_empty() {
                    return Err(CodeloopError::validation(
                        "task_kind.input_format",
                        "must not be empty",
                    ));
                }
                if output_format.trim().is_empty() {
                    return Err(CodeloopError::validation(
                        "task_kind.output_format",
                        "must not be empty",
                    ));
                }
                Ok(())
            }
            Self::WebScraping { target_url, .. } => url::Url::parse(target_url)
                .map(|_| ())
                .map_err(|e| CodeloopError::validation("task_kind.target_url", e.to_string())),
            Self::ModelInference {
                model_name,
                input_shape,
            } => {
                if model_name.trim().is_empty() {
                    return Err(CodeloopError::validation(
                        "task_kind.model_name",
                        "must not be empty",
                    ));
                }
                if input_shape.contains(&0) {
                    return Err(CodeloopError::validation(
                        "task_kind.input_shape",
                        "dimensions must be positive",
                    ));
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_general_is_neutral() {
        let kind = TaskKind::General;
        assert_eq!(kind.kind_name(), "general");
        assert!(kind.prompt_guidance().is_none());
        assert!(kind.implied_criteria().is_empty());
        assert!(kind.validate_params().is_ok());
    }

    #[test]
    fn test_tagged_serialization() {
        let kind = TaskKind::WebScraping {
            target_url: "https://example.com".to_string(),
            selectors: vec!["h1".to_string()],
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "web_scraping");
        assert_eq!(json["target_url"], "https://example.com");

        let parsed: TaskKind =
            serde_json::from_str(r#"{"type":"model_inference","model_name":"resnet"}"#).unwrap();
        assert_eq!(
            parsed,
            TaskKind::ModelInference {
                model_name: "resnet".to_string(),
                input_shape: vec![]
            }
        );
    }

    #[test]
    fn test_unknown_kind_rejected_by_serde() {
        let parsed: std::result::Result<TaskKind, _> =
            serde_json::from_str(r#"{"type":"crypto_mining"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_param_validation() {
        let bad = TaskKind::WebScraping {
            target_url: "not a url".to_string(),
            selectors: vec![],
        };
        assert!(bad.validate_params().is_err());

        let bad = TaskKind::ModelInference {
            model_name: "m".to_string(),
            input_shape: vec![1, 0],
        };
        assert!(bad.validate_params().is_err());

        let bad = TaskKind::DataProcessing {
            input_format: "csv".to_string(),
            output_format: " ".to_string(),
        };
        assert!(bad.validate_params().is_err());
    }

    #[test]
    fn test_guidance_mentions_parameters() {
        let kind = TaskKind::ModelInference {
            model_name: "tiny-mlp".to_string(),
            input_shape: vec![1, 28, 28],
        };
        let guidance = kind.prompt_guidance().unwrap();
        assert!(guidance.contains("tiny-mlp"));
        assert!(guidance.contains("1x28x28"));
    }
}
