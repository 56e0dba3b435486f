//! Supported target languages and how to run them.
//!
//! [`Language`] is the closed set of languages a session may target. Each
//! variant knows the file name its source is written to, the interpreter
//! used by the process backend, and the container image used by the
//! isolated backend.
//!
//! # Example
//!
//! ```rust
//! use codeloop::Language;
//!
//! let lang: Language = "py".parse().unwrap();
//! assert_eq!(lang, Language::Python);
//! assert_eq!(lang.source_file(), "main.py");
//! assert!("cobol".parse::<Language>().is_err());
//! ```

use std::fmt;
use std::str::FromStr;

/// Programming languages the orchestrator can generate and execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// Python 3
    Python,
    /// JavaScript on Node.js
    JavaScript,
    /// POSIX shell / Bash
    Bash,
    /// Ruby
    Ruby,
    /// Go, via `go run`
    Go,
}

static ALL_LANGUAGES: &[Language] = &[
    Language::Python,
    Language::JavaScript,
    Language::Bash,
    Language::Ruby,
    Language::Go,
];

impl Language {
    /// Returns all supported languages.
    pub fn all() -> &'static [Language] {
        ALL_LANGUAGES
    }

    /// Canonical lowercase identifier used in requests and config.
    pub fn id(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Bash => "bash",
            Language::Ruby => "ruby",
            Language::Go => "go",
        }
    }

    /// File name the generated source is written to inside the workspace.
    pub fn source_file(&self) -> &'static str {
        match self {
            Language::Python => "main.py",
            Language::JavaScript => "main.js",
            Language::Bash => "main.sh",
            Language::Ruby => "main.rb",
            Language::Go => "main.go",
        }
    }

    /// Interpreter program and leading arguments; the source path is appended.
    pub fn interpreter(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            Language::Python => ("python3", &["-u"]),
            Language::JavaScript => ("node", &[]),
            Language::Bash => ("bash", &[]),
            Language::Ruby => ("ruby", &[]),
            Language::Go => ("go", &["run"]),
        }
    }

    /// Container image used by the isolated backend.
    pub fn container_image(&self) -> &'static str {
        match self {
            Language::Python => "python:3.12-slim",
            Language::JavaScript => "node:20-slim",
            Language::Bash => "bash:5",
            Language::Ruby => "ruby:3.3-slim",
            Language::Go => "golang:1.22-alpine",
        }
    }

    /// Info-strings that identify this language on a markdown code fence.
    pub fn fence_tags(&self) -> &'static [&'static str] {
        match self {
            Language::Python => &["python", "py", "python3"],
            Language::JavaScript => &["javascript", "js", "node"],
            Language::Bash => &["bash", "sh", "shell"],
            Language::Ruby => &["ruby", "rb"],
            Language::Go => &["go", "golang"],
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Language::Python => "Python",
            Language::JavaScript => "JavaScript",
            Language::Bash => "Bash",
            Language::Ruby => "Ruby",
            Language::Go => "Go",
        };
        write!(f, "{}", name)
    }
}

/// Error returned when parsing an unsupported language name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseLanguageError {
    input: String,
}

impl ParseLanguageError {
    /// The rejected input.
    pub fn input(&self) -> &str {
        &self.input
    }
}

impl fmt::Display for ParseLanguageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let supported: Vec<&str> = Language::all().iter().map(Language::id).collect();
        write!(
            f,
            "unsupported language: '{}' (supported: {})",
            self.input,
            supported.join(", ")
        )
    }
}

impl std::error::Error for ParseLanguageError {}

impl FromStr for Language {
    type Err = ParseLanguageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        match lower.as_str() {
            "python" | "py" | "python3" => Ok(Language::Python),
            "javascript" | "js" | "node" | "nodejs" => Ok(Language::JavaScript),
            "bash" | "sh" | "shell" => Ok(Language::Bash),
            "ruby" | "rb" => Ok(Language::Ruby),
            "go" | "golang" => Ok(Language::Go),
            _ => Err(ParseLanguageError {
                input: s.to_string(),
            }),
        }
    }
}
