//! Immutable outcomes of a job run.

use std::collections::BTreeMap;
use std::ops::AddAssign;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use survey_cache::Usage;

use crate::agent::Agent;
use crate::error::QuestionError;
use crate::prompt::RenderedPrompt;
use crate::question::Answer;
use crate::scenario::Scenario;

/// Lifecycle of one question within one interview.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionStatus {
    NotStarted,
    InFlight,
    Succeeded,
    Failed,
    /// Never reached: bypassed by flow, a skip rule, or a local stop.
    Skipped,
    /// Not finished because the whole job was cancelled.
    Aborted,
}

impl QuestionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, QuestionStatus::NotStarted | QuestionStatus::InFlight)
    }
}

/// Which invigilator produced an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerSource {
    Functional,
    Direct,
    Model,
    Simulated,
}

/// Token usage split by origin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSplit {
    /// Tokens spent on calls made during this run.
    pub new: Usage,
    /// Tokens of responses served from the cache.
    pub cached: Usage,
}

impl AddAssign for UsageSplit {
    fn add_assign(&mut self, rhs: Self) {
        self.new += rhs.new;
        self.cached += rhs.cached;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionRecord {
    pub name: String,
    pub status: QuestionStatus,
    pub answer: Option<Answer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<QuestionError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<AnswerSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<RenderedPrompt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,
    /// Cache lookups made, including repairs.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub usage: UsageSplit,
}

impl QuestionRecord {
    pub fn not_started(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: QuestionStatus::NotStarted,
            answer: None,
            comment: None,
            error: None,
            source: None,
            prompt: None,
            raw_output: None,
            attempts: 0,
            usage: UsageSplit::default(),
        }
    }
}

/// Everything one interview produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterviewResult {
    /// Position in the job's canonical ordering.
    pub index: usize,
    pub agent: Agent,
    pub scenario: Scenario,
    pub model: String,
    pub iteration: u32,
    /// One record per survey question, in declaration order.
    pub questions: Vec<QuestionRecord>,
    pub usage: UsageSplit,
    pub cost_usd: f64,
}

impl InterviewResult {
    pub fn record(&self, question: &str) -> Option<&QuestionRecord> {
        self.questions.iter().find(|q| q.name == question)
    }

    pub fn answer(&self, question: &str) -> Option<&Answer> {
        self.record(question).and_then(|q| q.answer.as_ref())
    }

    pub fn status(&self, question: &str) -> Option<QuestionStatus> {
        self.record(question).map(|q| q.status)
    }

    pub fn count(&self, status: QuestionStatus) -> usize {
        self.questions.iter().filter(|q| q.status == status).count()
    }

    pub fn has_failures(&self) -> bool {
        self.count(QuestionStatus::Failed) > 0
    }
}

/// Usage and cost attributed to one model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub usage: UsageSplit,
    pub cost_usd: f64,
}

/// A failed question, as listed by [`Results::failures`].
#[derive(Debug, Clone, PartialEq)]
pub struct Failure<'a> {
    pub interview: usize,
    pub question: &'a str,
    pub error: Option<&'a QuestionError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Results {
    pub job_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// True when the run was stopped early.
    pub cancelled: bool,
    pub interviews: Vec<InterviewResult>,
    pub usage: UsageSplit,
    pub cost_usd: f64,
    pub per_model: BTreeMap<String, ModelUsage>,
}

impl Results {
    /// Aggregate interview results, which must already be in canonical order.
    pub fn new(
        job_id: impl Into<String>,
        started_at: DateTime<Utc>,
        interviews: Vec<InterviewResult>,
        cancelled: bool,
    ) -> Self {
        let mut usage = UsageSplit::default();
        let mut cost_usd = 0.0;
        let mut per_model: BTreeMap<String, ModelUsage> = BTreeMap::new();
        for interview in &interviews {
            usage += interview.usage;
            cost_usd += interview.cost_usd;
            let entry = per_model.entry(interview.model.clone()).or_default();
            entry.usage += interview.usage;
            entry.cost_usd += interview.cost_usd;
        }
        Self {
            job_id: job_id.into(),
            started_at,
            finished_at: Utc::now(),
            cancelled,
            interviews,
            usage,
            cost_usd,
            per_model,
        }
    }

    pub fn len(&self) -> usize {
        self.interviews.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interviews.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &InterviewResult> {
        self.interviews.iter()
    }

    /// One question's answers across all interviews, in canonical order.
    pub fn select(&self, question: &str) -> Vec<Option<&Answer>> {
        self.interviews.iter().map(|i| i.answer(question)).collect()
    }

    pub fn failures(&self) -> Vec<Failure<'_>> {
        self.interviews
            .iter()
            .flat_map(|i| {
                i.questions
                    .iter()
                    .filter(|q| q.status == QuestionStatus::Failed)
                    .map(move |q| Failure {
                        interview: i.index,
                        question: q.name.as_str(),
                        error: q.error.as_ref(),
                    })
            })
            .collect()
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn interview(index: usize, model: &str, answer: Option<Answer>, status: QuestionStatus) -> InterviewResult {
        let mut record = QuestionRecord::not_started("q1");
        record.status = status;
        record.answer = answer;
        if status == QuestionStatus::Failed {
            record.error = Some(QuestionError::new(ErrorKind::Validation, "bad"));
        }
        InterviewResult {
            index,
            agent: Agent::new(format!("a{index}")),
            scenario: Scenario::new(),
            model: model.to_string(),
            iteration: 0,
            questions: vec![record],
            usage: UsageSplit {
                new: Usage::new(10, 2),
                cached: Usage::new(5, 1),
            },
            cost_usd: 0.5,
        }
    }

    #[test]
    fn test_aggregates_usage_per_model() {
        let results = Results::new(
            "job",
            Utc::now(),
            vec![
                interview(0, "m1", Some(json!("Yes")), QuestionStatus::Succeeded),
                interview(1, "m1", None, QuestionStatus::Failed),
                interview(2, "m2", None, QuestionStatus::Skipped),
            ],
            false,
        );
        assert_eq!(results.usage.new, Usage::new(30, 6));
        assert_eq!(results.usage.cached, Usage::new(15, 3));
        assert!((results.cost_usd - 1.5).abs() < 1e-9);
        assert_eq!(results.per_model["m1"].usage.new, Usage::new(20, 4));
        assert_eq!(results.per_model["m2"].usage.new, Usage::new(10, 2));
    }

    #[test]
    fn test_select_and_failures() {
        let results = Results::new(
            "job",
            Utc::now(),
            vec![
                interview(0, "m", Some(json!("Yes")), QuestionStatus::Succeeded),
                interview(1, "m", None, QuestionStatus::Failed),
            ],
            false,
        );
        assert_eq!(results.select("q1"), vec![Some(&json!("Yes")), None]);
        let failures = results.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].interview, 1);
        assert_eq!(failures[0].question, "q1");
        assert_eq!(failures[0].error.map(|e| e.kind), Some(ErrorKind::Validation));
    }

    #[test]
    fn test_json_export_roundtrip() {
        let results = Results::new(
            "job",
            Utc::now(),
            vec![interview(0, "m", Some(json!(3)), QuestionStatus::Succeeded)],
            true,
        );
        let text = results.to_json_pretty().unwrap();
        assert!(text.contains("\"status\": \"succeeded\""));
        let back: Results = serde_json::from_str(&text).unwrap();
        assert_eq!(back, results);
    }
}
