//! Generation prompt assembly.
//!
//! The prompt tells the generator what to build and how the program must
//! report on its own checks, so the analyzer can score it.

use crate::generator::GenerationRequest;
use crate::task::TaskCapability;

/// Builds the text sent to a [`CodeGenerator`](crate::generator::CodeGenerator).
#[derive(Debug, Clone, Default)]
pub struct PromptBuilder;

impl PromptBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Render the prompt for one generation call.
    #[must_use]
    pub fn build(&self, request: &GenerationRequest) -> String {
        let mut out = String::new();

        out.push_str(&format!(
            "Write a complete, self-contained {} program.\n\n",
            request.language
        ));
        out.push_str("## Task\n\n");
        out.push_str(request.task_description.trim());
        out.push_str("\n\n");

        if let Some(guidance) = request.task_kind.prompt_guidance() {
            out.push_str("## Context\n\n");
            out.push_str(&guidance);
            out.push_str("\n\n");
        }

        let checks: Vec<&String> = request
            .requirements
            .iter()
            .chain(request.test_criteria.iter())
            .collect();

        if !request.requirements.is_empty() {
            out.push_str("## Requirements\n\n");
            for req in &request.requirements {
                out.push_str(&format!("- {}\n", req));
            }
            out.push('\n');
        }

        if !request.test_criteria.is_empty() {
            out.push_str("## Test criteria\n\n");
            for criterion in &request.test_criteria {
                out.push_str(&format!("- {}\n", criterion));
            }
            out.push('\n');
        }

        out.push_str("## Self-checks\n\n");
        if checks.is_empty() {
            out.push_str("Run a short demonstration of the program when executed.\n");
        } else {
            out.push_str(
                "When executed, the program must verify each requirement and criterion \
                 above and print exactly one line per check, using the check text verbatim:\n\n",
            );
            out.push_str("    PASS: <check>\n");
            out.push_str("    FAIL: <check>: <what went wrong>\n\n");
            out.push_str("For example:\n\n");
            out.push_str(&format!("    PASS: {}\n", checks[0]));
        }
        out.push_str(
            "\nThe program runs without network access, without stdin, and under a short \
             time limit. Exit with status 0 on success. Use only the standard library.\n\n",
        );

        if let Some(feedback) = request.feedback.as_deref().filter(|f| !f.trim().is_empty()) {
            out.push_str(&format!(
                "## Feedback from attempt {}\n\n",
                request.iteration.saturating_sub(1)
            ));
            out.push_str(feedback.trim());
            out.push_str("\n\n");
        }

        let fence = request.language.fence_tags()[0];
        out.push_str(&format!(
            "Respond with the full program in a single ```{} code block and nothing else.\n",
            fence
        ));
        out
    }
}
