//! Agents: the simulated respondents an interview speaks for.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::question::{Answer, Question};
use crate::scenario::Scenario;

/// Answers questions without a model call.
///
/// An agent carrying a direct answerer is asked first for every question it
/// `handles`; the returned answer still goes through question validation.
pub trait DirectAnswerer: Send + Sync + fmt::Debug {
    fn handles(&self, question: &dyn Question) -> bool;

    fn answer(
        &self,
        question: &dyn Question,
        scenario: &Scenario,
        agent: &Agent,
    ) -> Result<Answer, String>;
}

/// Fixed answers keyed by question name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CannedAnswers(pub BTreeMap<String, Answer>);

impl CannedAnswers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, question: impl Into<String>, answer: impl Into<Answer>) -> Self {
        self.0.insert(question.into(), answer.into());
        self
    }
}

impl DirectAnswerer for CannedAnswers {
    fn handles(&self, question: &dyn Question) -> bool {
        self.0.contains_key(question.name())
    }

    fn answer(
        &self,
        question: &dyn Question,
        _scenario: &Scenario,
        _agent: &Agent,
    ) -> Result<Answer, String> {
        self.0
            .get(question.name())
            .cloned()
            .ok_or_else(|| format!("no canned answer for {}", question.name()))
    }
}

/// A persona with traits that shape its answers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Agent {
    pub name: String,
    #[serde(default)]
    pub traits: BTreeMap<String, Value>,
    /// Extra persona instruction appended to the system prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    #[serde(skip)]
    direct: Option<Arc<dyn DirectAnswerer>>,
}

impl Agent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_trait(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.traits.insert(name.into(), value.into());
        self
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = Some(instruction.into());
        self
    }

    pub fn with_direct_answerer(mut self, answerer: Arc<dyn DirectAnswerer>) -> Self {
        self.direct = Some(answerer);
        self
    }

    pub fn direct_answerer(&self) -> Option<&Arc<dyn DirectAnswerer>> {
        self.direct.as_ref()
    }

    pub fn trait_value(&self, name: &str) -> Option<&Value> {
        self.traits.get(name)
    }

    /// Traits as shown to a model.
    pub fn persona_context(&self) -> &BTreeMap<String, Value> {
        &self.traits
    }
}

impl PartialEq for Agent {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.traits == other.traits && self.instruction == other.instruction
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::question::FreeText;

    #[test]
    fn test_canned_answers_handle_only_known_questions() {
        let canned = CannedAnswers::new().with("age", 42);
        let agent = Agent::new("a");
        let known = FreeText::new("age", "How old are you?");
        let unknown = FreeText::new("pet", "Favourite pet?");

        assert!(canned.handles(&known));
        assert!(!canned.handles(&unknown));
        assert_eq!(
            canned.answer(&known, &Scenario::new(), &agent).unwrap(),
            Value::from(42)
        );
    }

    #[test]
    fn test_direct_answerer_is_not_serialized() {
        let agent = Agent::new("a")
            .with_trait("age", 30)
            .with_direct_answerer(Arc::new(CannedAnswers::new()));
        let json = serde_json::to_value(&agent).unwrap();
        assert_eq!(json, serde_json::json!({"name": "a", "traits": {"age": 30}}));

        let back: Agent = serde_json::from_value(json).unwrap();
        assert!(back.direct_answerer().is_none());
        assert_eq!(back, agent);
    }
}
