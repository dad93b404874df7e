use std::fmt;

use serde::{Deserialize, Serialize};

use crate::expr::Expression;

/// Where a rule sends the interview when its expression holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleTarget {
    Question(String),
    EndOfSurvey,
}

impl RuleTarget {
    pub fn question(name: impl Into<String>) -> Self {
        RuleTarget::Question(name.into())
    }
}

impl fmt::Display for RuleTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleTarget::Question(q) => f.write_str(q),
            RuleTarget::EndOfSurvey => f.write_str("EndOfSurvey"),
        }
    }
}

/// A post-answer rule. Rules with the same source are tried in
/// registration order and the first whose expression holds wins.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub source: usize,
    pub expression: Expression,
    pub target: RuleTarget,
    /// Declaration index of the target, `None` for end of survey.
    pub target_index: Option<usize>,
}

/// A pre-question rule: when it holds the question is not asked.
#[derive(Debug, Clone, PartialEq)]
pub struct SkipRule {
    pub question: usize,
    pub expression: Expression,
}
