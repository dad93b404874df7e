//! Answering a single question.
//!
//! An [`Invigilator`] is chosen per (agent, question) pair: a functional
//! question answers itself, an agent with a direct answerer that handles the
//! question answers it without a model, and everything else goes through a
//! model call with caching, rate limiting, and a bounded repair loop.

use std::sync::Arc;

use survey_cache::{CacheKey, Usage};
use tracing::{debug, trace};

use crate::agent::{Agent, DirectAnswerer};
use crate::environment::RunEnvironment;
use crate::error::{ErrorKind, ModelError, QuestionError};
use crate::memory::MemoryItem;
use crate::metrics::METRICS;
use crate::model::{execute_with_controls, CallControls, LanguageModel, ModelResponse};
use crate::prompt::{self, PromptContext};
use crate::question::{Answer, Question};
use crate::results::{AnswerSource, QuestionRecord, QuestionStatus, UsageSplit};
use crate::scenario::Scenario;

/// Knobs that shape how one question is answered.
#[derive(Debug, Clone)]
pub struct AnswerSettings {
    pub controls: CallControls,
    /// Extra model calls allowed after an answer fails validation.
    pub max_repair_attempts: u32,
    pub bypass_cache: bool,
    /// Use the question's simulated answer instead of calling the model.
    pub dry_run: bool,
}

impl Default for AnswerSettings {
    fn default() -> Self {
        Self {
            controls: CallControls::default(),
            max_repair_attempts: 2,
            bypass_cache: false,
            dry_run: false,
        }
    }
}

/// Everything needed to answer one question in one interview.
#[derive(Debug, Clone, Copy)]
pub struct QuestionTask<'a> {
    pub question: &'a dyn Question,
    pub agent: &'a Agent,
    pub scenario: &'a Scenario,
    pub model: &'a dyn LanguageModel,
    pub memory: &'a [MemoryItem],
    pub iteration: u32,
}

#[derive(Debug, Clone)]
pub enum Invigilator {
    Functional,
    Direct(Arc<dyn DirectAnswerer>),
    Model,
}

impl Invigilator {
    pub fn select(question: &dyn Question, agent: &Agent) -> Self {
        if question.is_functional() {
            return Invigilator::Functional;
        }
        match agent.direct_answerer() {
            Some(direct) if direct.handles(question) => Invigilator::Direct(Arc::clone(direct)),
            _ => Invigilator::Model,
        }
    }

    /// Answer the question. Failures are recorded on the returned record,
    /// never raised.
    pub async fn answer(
        &self,
        task: &QuestionTask<'_>,
        env: &RunEnvironment,
        settings: &AnswerSettings,
    ) -> QuestionRecord {
        match self {
            Invigilator::Functional => {
                let mut record = start_record(task, AnswerSource::Functional);
                match task.question.answer_functionally(task.scenario, task.agent) {
                    Some(answer) => {
                        settle(&mut record, task.question, &answer, None);
                    }
                    None => fail(
                        &mut record,
                        QuestionError::new(ErrorKind::DirectAnswer, "functional question produced no answer"),
                    ),
                }
                record
            }
            Invigilator::Direct(direct) => {
                let mut record = start_record(task, AnswerSource::Direct);
                match direct.answer(task.question, task.scenario, task.agent) {
                    Ok(answer) => {
                        settle(&mut record, task.question, &answer, None);
                    }
                    Err(reason) => fail(&mut record, QuestionError::new(ErrorKind::DirectAnswer, reason)),
                }
                record
            }
            Invigilator::Model => answer_with_model(task, env, settings).await,
        }
    }
}

fn start_record(task: &QuestionTask<'_>, source: AnswerSource) -> QuestionRecord {
    let mut record = QuestionRecord::not_started(task.question.name());
    record.status = QuestionStatus::InFlight;
    record.source = Some(source);
    record
}

fn fail(record: &mut QuestionRecord, error: QuestionError) {
    record.status = QuestionStatus::Failed;
    record.answer = None;
    record.error = Some(error);
}

/// Validate a candidate answer and close the record. Returns the validation
/// error message on failure so callers can repair.
fn settle(
    record: &mut QuestionRecord,
    question: &dyn Question,
    candidate: &Answer,
    comment: Option<String>,
) -> Option<String> {
    match question.validate(candidate) {
        Ok(answer) => {
            record.status = QuestionStatus::Succeeded;
            record.answer = Some(answer);
            record.comment = comment;
            record.error = None;
            None
        }
        Err(err) => {
            fail(record, QuestionError::from(&err));
            Some(err.message)
        }
    }
}

async fn answer_with_model(
    task: &QuestionTask<'_>,
    env: &RunEnvironment,
    settings: &AnswerSettings,
) -> QuestionRecord {
    let source = if settings.dry_run {
        AnswerSource::Simulated
    } else {
        AnswerSource::Model
    };
    let mut record = start_record(task, source);

    let ctx = PromptContext {
        scenario: task.scenario,
        agent: task.agent,
        memory: task.memory,
    };
    let rendered = match task.question.render_instructions(&ctx) {
        Ok(rendered) => rendered,
        Err(err) => {
            fail(&mut record, QuestionError::new(ErrorKind::Prompt, err.to_string()));
            return record;
        }
    };
    record.prompt = Some(rendered.clone());

    if settings.dry_run {
        let simulated = task.question.simulate_answer();
        settle(&mut record, task.question, &simulated, None);
        return record;
    }

    let mut user = rendered.user.clone();
    for repair in 0..=settings.max_repair_attempts {
        if repair > 0 {
            METRICS.inc_repairs();
        }
        record.attempts += 1;
        let iteration = task.iteration.saturating_add(repair);

        let fetched = match fetch(task, env, settings, &rendered.system, &user, iteration).await {
            Ok(fetched) => fetched,
            Err(err) => {
                fail(&mut record, QuestionError::from(&err));
                return record;
            }
        };
        record.usage += fetched.usage;

        let parsed = prompt::parse_model_output(&fetched.output);
        let problem = settle(&mut record, task.question, &parsed.answer, parsed.comment);
        record.raw_output = Some(fetched.output);
        let Some(problem) = problem else {
            return record;
        };

        debug!(
            question = %task.question.name(),
            repair,
            error = %problem,
            "answer failed validation"
        );
        let invalid = record.raw_output.as_deref().unwrap_or_default();
        user = prompt::repair_prompt(&rendered.user, invalid, &problem);
    }
    record
}

struct Fetched {
    output: String,
    usage: UsageSplit,
}

/// Model output for one prompt, through the cache when there is one.
async fn fetch(
    task: &QuestionTask<'_>,
    env: &RunEnvironment,
    settings: &AnswerSettings,
    system: &str,
    user: &str,
    iteration: u32,
) -> Result<Fetched, ModelError> {
    let Some(cache) = env.cache() else {
        let response = call_model(task.model, env, &settings.controls, system, user).await?;
        return Ok(Fetched {
            output: response.text,
            usage: UsageSplit {
                new: response.usage,
                cached: Usage::default(),
            },
        });
    };

    let info = task.model.info();
    let key = CacheKey::new(&info.id, info.parameters.clone(), system, user, iteration);
    let (entry, outcome) = cache
        .get_or_compute(&key, settings.bypass_cache, || async {
            let response = call_model(task.model, env, &settings.controls, system, user).await?;
            Ok::<_, ModelError>((response.text, response.usage))
        })
        .await?;

    let usage = if outcome.was_hit() {
        METRICS.inc_cache_hits();
        UsageSplit {
            new: Usage::default(),
            cached: entry.usage,
        }
    } else {
        METRICS.inc_cache_misses();
        UsageSplit {
            new: entry.usage,
            cached: Usage::default(),
        }
    };
    trace!(model = %info.id, ?outcome, "model output resolved");
    Ok(Fetched {
        output: entry.output,
        usage,
    })
}

/// One logical model call: limiter admission, timeout, and retries.
async fn call_model(
    model: &dyn LanguageModel,
    env: &RunEnvironment,
    controls: &CallControls,
    system: &str,
    user: &str,
) -> Result<ModelResponse, ModelError> {
    let limiter = env.limiters().limiter_for(model.info());
    let estimate = prompt::estimate_tokens(system)
        + prompt::estimate_tokens(user)
        + model.info().output_token_estimate();

    let controlled = execute_with_controls(controls, |attempt| {
        let limiter = Arc::clone(&limiter);
        async move {
            let waited = limiter.acquire(estimate).await;
            if !waited.is_zero() {
                trace!(model = %model.id(), attempt, ?waited, "admitted by limiter");
            }
            METRICS.inc_model_calls();
            match controls.with_timeout(model.call(system, user)).await {
                Ok(response) => {
                    limiter.on_success();
                    let actual = if response.usage.is_zero() {
                        estimate
                    } else {
                        response.usage.total()
                    };
                    limiter.reconcile(estimate, actual);
                    Ok(response)
                }
                Err(err) => {
                    if matches!(err, ModelError::RateLimited { .. }) {
                        METRICS.inc_rate_limit_signals();
                        limiter.on_rate_limited();
                    }
                    Err(err)
                }
            }
        }
    })
    .await?;
    Ok(controlled.value)
}
