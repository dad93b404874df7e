//! Question abstraction.
//!
//! A question knows its name, its template text, how to instruct a model to
//! answer it, and how to validate (and normalize) whatever comes back.

mod kinds;

use std::fmt;

use serde_json::Value;

pub use kinds::{Checkbox, FreeText, FunctionalQuestion, LinearScale, MultipleChoice, Numerical};

use crate::agent::Agent;
use crate::error::ValidationError;
use crate::prompt::{self, PromptContext, PromptError, RenderedPrompt};
use crate::scenario::Scenario;

/// A validated (or raw) answer value.
pub type Answer = Value;

/// Appended to every model-facing instruction block.
pub const JSON_FORMAT_HINT: &str =
    r#"Return only JSON of the form {"answer": <your answer>, "comment": "<optional comment>"}."#;

pub trait Question: Send + Sync + fmt::Debug {
    /// Unique identifier within a survey.
    fn name(&self) -> &str;

    /// Template text, possibly containing `{{ }}` placeholders.
    fn text(&self) -> &str;

    /// Short type tag, e.g. `multiple_choice`.
    fn kind(&self) -> &'static str;

    /// Format instructions appended after the question text.
    fn answer_instructions(&self) -> String;

    /// Check a raw answer and return its normalized form.
    fn validate(&self, raw: &Answer) -> Result<Answer, ValidationError>;

    /// A deterministic schema-valid answer, used by dry runs.
    fn simulate_answer(&self) -> Answer;

    /// Functional questions compute their own answer and never reach a model.
    fn is_functional(&self) -> bool {
        false
    }

    fn answer_functionally(&self, _scenario: &Scenario, _agent: &Agent) -> Option<Answer> {
        None
    }

    fn render_instructions(&self, ctx: &PromptContext<'_>) -> Result<RenderedPrompt, PromptError> {
        prompt::render_question(self.text(), &self.answer_instructions(), ctx)
    }
}
