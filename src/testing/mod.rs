//! Testing infrastructure.
//!
//! Mocks for every collaborator the orchestrator talks to, plus
//! assertions over session invariants.
//!
//! # Example
//!
//! ```rust,ignore
//! use codeloop::testing::{MockBackend, MockGenerator, MockNotifier};
//!
//! let generator = MockGenerator::new().with_code("print(1)");
//! let backend = MockBackend::new().with_stdout("PASS: prints one\n");
//! let notifier = MockNotifier::new();
//! ```

pub mod assertions;
#[cfg(test)]
pub(crate) mod http_stub;
pub mod mocks;

pub use assertions::*;
pub use mocks::*;
