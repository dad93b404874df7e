//! Survey Core Library
//!
//! Runs surveys as batches of interviews: each interview puts a survey's
//! questions to one agent, under one model and one scenario. Flow rules,
//! memory scoping, answer validation with repair, rate limiting, and the
//! response cache all live here.

pub mod agent;
pub mod definition;
pub mod environment;
pub mod error;
pub mod expr;
pub mod flow;
pub mod interview;
pub mod invigilator;
pub mod job;
pub mod limiter;
pub mod memory;
pub mod metrics;
pub mod model;
pub mod obs;
pub mod prompt;
pub mod question;
pub mod results;
pub mod scenario;
pub mod survey;
pub mod telemetry;

pub use agent::{Agent, CannedAnswers, DirectAnswerer};
pub use definition::{DefinitionError, JobDefinition};
pub use environment::{RunEnvironment, StopHandle};
pub use error::{ErrorKind, JobError, ModelError, QuestionError, Result, SurveyError, ValidationError};
pub use expr::{Expression, Reference};
pub use flow::{AnswerScope, Next, SurveyFlowResolver};
pub use interview::{Interview, InterviewRunner};
pub use invigilator::{AnswerSettings, Invigilator, QuestionTask};
pub use job::{Job, JobBuilder, JobScheduler, RunOptions};
pub use limiter::{BucketCollection, LimiterConfig, ModelLimiter};
pub use memory::{MemoryItem, MemoryScope};
pub use model::{
    CallControls, LanguageModel, Locality, ModelInfo, ModelResponse, NullModel,
    OpenAiCompatibleModel, Pricing, RateLimits, ScriptedFailure, ScriptedModel,
};
pub use prompt::{PromptContext, RenderedPrompt};
pub use question::{
    Answer, Checkbox, FreeText, FunctionalQuestion, LinearScale, MultipleChoice, Numerical,
    Question,
};
pub use results::{
    AnswerSource, InterviewResult, ModelUsage, QuestionRecord, QuestionStatus, Results, UsageSplit,
};
pub use scenario::Scenario;
pub use survey::{MemoryMode, MemoryPlan, RuleTarget, Survey};
pub use telemetry::init_tracing;

pub use survey_cache::{CacheEntry, CacheKey, FsCacheStore, ResponseCache, Usage};
