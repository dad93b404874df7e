//! Survey definition: ordered questions, navigation rules, and memory plan.
//!
//! Every mutator validates what it can immediately (names, forward-only
//! jumps, reference ordering). Whole-graph checks run in [`Survey::validate`].

mod memory_plan;
mod rules;
mod validate;

use std::collections::HashMap;
use std::sync::Arc;

pub use memory_plan::{MemoryMode, MemoryPlan};
pub use rules::{Rule, RuleTarget, SkipRule};

use crate::error::{Result, SurveyError};
use crate::expr::{is_identifier, Expression, Reference};
use crate::question::Question;

const RESERVED_NAMES: [&str; 2] = ["scenario", "agent"];

#[derive(Debug, Clone)]
pub struct Survey {
    questions: Vec<Arc<dyn Question>>,
    index: HashMap<String, usize>,
    rules: Vec<Rule>,
    skip_rules: Vec<SkipRule>,
    memory: MemoryPlan,
}

impl Survey {
    pub fn new(questions: Vec<Arc<dyn Question>>) -> Result<Self> {
        if questions.is_empty() {
            return Err(SurveyError::EmptySurvey);
        }
        let mut index = HashMap::with_capacity(questions.len());
        for (i, q) in questions.iter().enumerate() {
            let name = q.name();
            if !is_identifier(name) || RESERVED_NAMES.contains(&name) {
                return Err(SurveyError::InvalidQuestionName {
                    name: name.to_string(),
                    reason: "must be an identifier other than 'scenario' or 'agent'".to_string(),
                });
            }
            if index.insert(name.to_string(), i).is_some() {
                return Err(SurveyError::DuplicateQuestion(name.to_string()));
            }
        }
        Ok(Self {
            questions,
            index,
            rules: Vec::new(),
            skip_rules: Vec::new(),
            memory: MemoryPlan::default(),
        })
    }

    // ---- Accessors ----

    pub fn questions(&self) -> &[Arc<dyn Question>] {
        &self.questions
    }

    pub fn len(&self) -> usize {
        self.questions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn question(&self, index: usize) -> Option<&Arc<dyn Question>> {
        self.questions.get(index)
    }

    pub fn question_named(&self, name: &str) -> Option<&Arc<dyn Question>> {
        self.index_of(name).and_then(|i| self.questions.get(i))
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn skip_rules(&self) -> &[SkipRule] {
        &self.skip_rules
    }

    pub fn memory_plan(&self) -> &MemoryPlan {
        &self.memory
    }

    /// Rules leaving `source`, in evaluation order.
    pub fn rules_from(&self, source: usize) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(move |r| r.source == source)
    }

    pub fn skip_rules_for(&self, question: usize) -> impl Iterator<Item = &SkipRule> {
        self.skip_rules.iter().filter(move |r| r.question == question)
    }

    pub fn has_skip_rule(&self, question: usize) -> bool {
        self.skip_rules_for(question).next().is_some()
    }

    /// Indices of the earlier questions whose answers `question` may see,
    /// in declaration order.
    pub fn memory_candidates(&self, question: usize) -> Vec<usize> {
        let Some(q) = self.questions.get(question) else {
            return Vec::new();
        };
        let mut visible: Vec<usize> = match self.memory.mode {
            MemoryMode::None => Vec::new(),
            MemoryMode::Full => (0..question).collect(),
            MemoryMode::Lagged(k) => (question.saturating_sub(k)..question).collect(),
        };
        for target in self.memory.explicit_targets(q.name()) {
            if let Some(i) = self.index_of(target) {
                if i < question && !visible.contains(&i) {
                    visible.push(i);
                }
            }
        }
        visible.sort_unstable();
        visible
    }

    // ---- Rules ----

    fn require(&self, name: &str, context: &str) -> Result<usize> {
        self.index_of(name).ok_or_else(|| SurveyError::UnknownQuestion {
            context: context.to_string(),
            name: name.to_string(),
        })
    }

    fn parse_expression(source: &str) -> Result<Expression> {
        Expression::parse(source).map_err(|e| SurveyError::ExpressionSyntax {
            expression: source.to_string(),
            reason: e.to_string(),
        })
    }

    /// Answer references must name questions at or before `limit`.
    fn check_answer_refs(&self, expr: &Expression, limit: usize, inclusive: bool, context: &str) -> Result<()> {
        for reference in expr.references() {
            if let Reference::Answer(name) = &reference {
                let i = self.require(name, context)?;
                let visible = if inclusive { i <= limit } else { i < limit };
                if !visible {
                    return Err(SurveyError::ForwardReference {
                        context: context.to_string(),
                        reference: reference.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Jump to `target` after `source` when `expression` holds.
    pub fn add_rule(mut self, source: &str, expression: &str, target: RuleTarget) -> Result<Self> {
        let context = format!("rule on {source}");
        let source_index = self.require(source, &context)?;
        let expression = Self::parse_expression(expression)?;
        self.check_answer_refs(&expression, source_index, true, &context)?;

        let target_index = match &target {
            RuleTarget::EndOfSurvey => None,
            RuleTarget::Question(name) => {
                let i = self.require(name, &context)?;
                if i <= source_index {
                    return Err(SurveyError::BackwardRule {
                        source_question: source.to_string(),
                        target: name.clone(),
                    });
                }
                Some(i)
            }
        };

        self.rules.push(Rule {
            source: source_index,
            expression,
            target,
            target_index,
        });
        Ok(self)
    }

    /// End the survey after `source` when `expression` holds.
    pub fn add_stop_rule(self, source: &str, expression: &str) -> Result<Self> {
        self.add_rule(source, expression, RuleTarget::EndOfSurvey)
    }

    /// Do not ask `question` when `expression` holds.
    pub fn add_skip_rule(mut self, question: &str, expression: &str) -> Result<Self> {
        let context = format!("skip rule on {question}");
        let index = self.require(question, &context)?;
        let expression = Self::parse_expression(expression)?;
        self.check_answer_refs(&expression, index, false, &context)?;
        self.skip_rules.push(SkipRule {
            question: index,
            expression,
        });
        Ok(self)
    }

    // ---- Memory ----

    pub fn set_full_memory_mode(mut self) -> Self {
        self.memory.mode = MemoryMode::Full;
        self
    }

    pub fn set_lagged_memory(mut self, lags: usize) -> Self {
        self.memory.mode = MemoryMode::Lagged(lags);
        self
    }

    /// Let `question` see the answer to `prior`.
    pub fn add_targeted_memory(mut self, question: &str, prior: &str) -> Result<Self> {
        let context = format!("memory for {question}");
        let q = self.require(question, &context)?;
        let t = self.require(prior, &context)?;
        if t >= q {
            return Err(SurveyError::MemoryTargetNotBefore {
                question: question.to_string(),
                target: prior.to_string(),
            });
        }
        self.memory.add_target(question, prior);
        Ok(self)
    }

    pub fn add_memory_collection<S: AsRef<str>>(mut self, question: &str, priors: &[S]) -> Result<Self> {
        for prior in priors {
            self = self.add_targeted_memory(question, prior.as_ref())?;
        }
        Ok(self)
    }

    /// Replace the memory plan wholesale, checking target ordering.
    pub fn with_memory_plan(mut self, plan: MemoryPlan) -> Result<Self> {
        self.memory = MemoryPlan {
            mode: plan.mode,
            targets: Default::default(),
        };
        for (question, targets) in &plan.targets {
            self = self.add_memory_collection(question, targets.as_slice())?;
        }
        Ok(self)
    }

    /// Whole-graph checks: no explicit memory target may be bypassed on any
    /// path to the question that remembers it.
    pub fn validate(&self) -> Result<()> {
        validate::check_memory_reachability(self)
    }
}
