//! Survey navigation: which question comes next, and whether to skip it.

use std::collections::HashMap;

use serde_json::Value;

use crate::agent::Agent;
use crate::expr::{Reference, Resolve};
use crate::question::Answer;
use crate::scenario::Scenario;
use crate::survey::{RuleTarget, Survey};

/// The position an interview moves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Question(usize),
    EndOfSurvey,
}

/// Name resolution over one interview's answers, scenario, and agent.
#[derive(Debug, Clone, Copy)]
pub struct AnswerScope<'a> {
    pub answers: &'a HashMap<String, Answer>,
    pub scenario: &'a Scenario,
    pub agent: &'a Agent,
}

impl Resolve for AnswerScope<'_> {
    fn resolve(&self, reference: &Reference) -> Value {
        match reference {
            Reference::Answer(q) => self.answers.get(q).cloned(),
            Reference::Scenario(field) => self.scenario.get(field).cloned(),
            Reference::AgentName => Some(Value::String(self.agent.name.clone())),
            Reference::AgentTrait(name) => self.agent.trait_value(name).cloned(),
        }
        .unwrap_or(Value::Null)
    }
}

/// Evaluates skip, jump, and stop rules against an interview's state.
#[derive(Debug, Clone, Copy)]
pub struct SurveyFlowResolver<'a> {
    survey: &'a Survey,
}

impl<'a> SurveyFlowResolver<'a> {
    pub fn new(survey: &'a Survey) -> Self {
        Self { survey }
    }

    pub fn start(&self) -> Next {
        if self.survey.is_empty() {
            Next::EndOfSurvey
        } else {
            Next::Question(0)
        }
    }

    /// The question after `current`. The first matching rule from `current`
    /// wins; otherwise flow continues in declaration order.
    pub fn next_question(&self, current: usize, scope: &dyn Resolve) -> Next {
        for rule in self.survey.rules_from(current) {
            if rule.expression.evaluate(scope) {
                return match (&rule.target, rule.target_index) {
                    (RuleTarget::Question(_), Some(i)) => Next::Question(i),
                    _ => Next::EndOfSurvey,
                };
            }
        }
        if current + 1 < self.survey.len() {
            Next::Question(current + 1)
        } else {
            Next::EndOfSurvey
        }
    }

    /// Whether any skip rule on `question` holds.
    pub fn should_skip(&self, question: usize, scope: &dyn Resolve) -> bool {
        self.survey
            .skip_rules_for(question)
            .any(|rule| rule.expression.evaluate(scope))
    }
}
