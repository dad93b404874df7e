//! Error taxonomy for survey construction, model calls, and job runs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors raised while building a survey or job.
///
/// These are always fatal and surface before any interview runs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SurveyError {
    #[error("survey has no questions")]
    EmptySurvey,

    #[error("duplicate question name: {0}")]
    DuplicateQuestion(String),

    #[error("invalid question name {name:?}: {reason}")]
    InvalidQuestionName { name: String, reason: String },

    #[error("invalid question {name}: {reason}")]
    InvalidQuestion { name: String, reason: String },

    #[error("{context} references unknown question {name}")]
    UnknownQuestion { context: String, name: String },

    #[error("rule from {source_question} to {target} jumps backwards; rules may only move forward")]
    BackwardRule {
        source_question: String,
        target: String,
    },

    #[error("invalid expression {expression:?}: {reason}")]
    ExpressionSyntax { expression: String, reason: String },

    #[error("{context} references {reference}, which is not yet answered at that point")]
    ForwardReference { context: String, reference: String },

    #[error("{context} references {reference}, which is not defined")]
    UnknownReference { context: String, reference: String },

    #[error("memory for {question} targets {target}, which is not asked before it")]
    MemoryTargetNotBefore { question: String, target: String },

    #[error("memory for {question} targets {target}, which some survey path skips")]
    MemoryTargetMayBeSkipped { question: String, target: String },

    #[error("scenario {scenario} has no field {field}")]
    MissingScenarioField { scenario: String, field: String },

    #[error("agent {agent} has no trait {name}")]
    MissingAgentTrait { agent: String, name: String },

    #[error("question {question} template error: {reason}")]
    Template { question: String, reason: String },
}

/// An answer that does not satisfy its question's schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("invalid answer for {question}: {message}")]
pub struct ValidationError {
    pub question: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(question: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            message: message.into(),
        }
    }
}

/// Errors from a single model call.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// Network or provider fault worth retrying.
    #[error("transient model error: {0}")]
    Transient(String),

    #[error("model call timed out after {limit_ms}ms")]
    Timeout { limit_ms: u64 },

    /// Provider asked us to slow down. Absorbed by the limiter.
    #[error("provider rate limit signalled")]
    RateLimited { retry_after: Option<Duration> },

    #[error("missing credentials for {model}: {detail}")]
    MissingCredentials { model: String, detail: String },

    #[error("model error: {0}")]
    Fatal(String),

    #[error("cache error: {0}")]
    Cache(#[from] survey_cache::CacheError),
}

impl ModelError {
    /// Whether the call should be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ModelError::Transient(_) | ModelError::Timeout { .. } | ModelError::RateLimited { .. }
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ModelError::Timeout { .. } => ErrorKind::Timeout,
            ModelError::Cache(_) => ErrorKind::Cache,
            _ => ErrorKind::ModelCall,
        }
    }
}

/// Errors that stop a job before or while it runs.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("survey construction error: {0}")]
    Construction(#[from] SurveyError),

    #[error("credential check failed for {model}: {reason}")]
    MissingCredentials { model: String, reason: String },

    #[error("model {model} requires remote inference, which is disabled")]
    RemoteInferenceDisabled { model: String },

    #[error("invalid run options: {0}")]
    InvalidOptions(String),

    #[error("interview task failed: {0}")]
    Join(String),
}

/// Coarse classification of a recorded per-question failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    ModelCall,
    Timeout,
    Prompt,
    DirectAnswer,
    Cache,
    Aborted,
}

/// A failure recorded on a question result. Serializable, unlike the error
/// enums it is built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl QuestionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&ValidationError> for QuestionError {
    fn from(err: &ValidationError) -> Self {
        Self::new(ErrorKind::Validation, err.to_string())
    }
}

impl From<&ModelError> for QuestionError {
    fn from(err: &ModelError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl std::fmt::Display for QuestionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Result type for survey construction.
pub type Result<T> = std::result::Result<T, SurveyError>;
