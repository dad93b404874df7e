//! Jobs: a survey crossed with agents, scenarios, and models, and the
//! scheduler that runs the resulting interviews.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::agent::Agent;
use crate::environment::RunEnvironment;
use crate::error::{JobError, SurveyError};
use crate::expr::Reference;
use crate::interview::{Interview, InterviewRunner};
use crate::invigilator::AnswerSettings;
use crate::metrics::METRICS;
use crate::model::{CallControls, LanguageModel, Locality, NullModel};
use crate::obs;
use crate::prompt;
use crate::results::{InterviewResult, Results};
use crate::scenario::Scenario;
use crate::survey::Survey;

// ---- Options ----

/// How a job is run. Unset fields take their defaults when deserialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Upper bound on interviews running at once.
    pub max_concurrency: usize,
    /// Stop an interview at its first failure and start no new interviews.
    pub stop_on_exception: bool,
    /// Iterations per (model, scenario, agent) combination.
    pub n: u32,
    pub disable_remote_inference: bool,
    pub check_api_keys: bool,
    pub print_exceptions: bool,
    pub max_repair_attempts: u32,
    #[serde(flatten)]
    pub controls: CallControls,
    pub job_timeout_ms: Option<u64>,
    pub bypass_cache: bool,
    pub dry_run: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            stop_on_exception: false,
            n: 1,
            disable_remote_inference: false,
            check_api_keys: false,
            print_exceptions: true,
            max_repair_attempts: 2,
            controls: CallControls::default(),
            job_timeout_ms: None,
            bypass_cache: false,
            dry_run: false,
        }
    }
}

impl RunOptions {
    pub fn validate(&self) -> Result<(), JobError> {
        if self.max_concurrency == 0 {
            return Err(JobError::InvalidOptions("max_concurrency must be at least 1".into()));
        }
        if self.n == 0 {
            return Err(JobError::InvalidOptions("n must be at least 1".into()));
        }
        if self.controls.timeout_ms == 0 {
            return Err(JobError::InvalidOptions("timeout_ms must be positive".into()));
        }
        Ok(())
    }

    fn answer_settings(&self) -> AnswerSettings {
        AnswerSettings {
            controls: self.controls.clone(),
            max_repair_attempts: self.max_repair_attempts,
            bypass_cache: self.bypass_cache,
            dry_run: self.dry_run,
        }
    }
}

// ---- Job ----

#[derive(Debug, Clone)]
pub struct Job {
    survey: Arc<Survey>,
    agents: Vec<Arc<Agent>>,
    scenarios: Vec<Arc<Scenario>>,
    models: Vec<Arc<dyn LanguageModel>>,
}

impl Job {
    pub fn builder(survey: Survey) -> JobBuilder {
        JobBuilder {
            survey,
            agents: Vec::new(),
            scenarios: Vec::new(),
            models: Vec::new(),
        }
    }

    pub fn survey(&self) -> &Survey {
        &self.survey
    }

    pub fn agents(&self) -> &[Arc<Agent>] {
        &self.agents
    }

    pub fn scenarios(&self) -> &[Arc<Scenario>] {
        &self.scenarios
    }

    pub fn models(&self) -> &[Arc<dyn LanguageModel>] {
        &self.models
    }

    /// Interviews in canonical order: model, scenario, agent, iteration.
    pub fn interviews(&self, n: u32) -> Vec<Interview> {
        let mut out = Vec::with_capacity(
            self.models.len() * self.scenarios.len() * self.agents.len() * n as usize,
        );
        for model in &self.models {
            for scenario in &self.scenarios {
                for agent in &self.agents {
                    for iteration in 0..n {
                        out.push(Interview::new(
                            out.len(),
                            Arc::clone(&self.survey),
                            Arc::clone(agent),
                            Arc::clone(scenario),
                            Arc::clone(model),
                            iteration,
                        ));
                    }
                }
            }
        }
        out
    }

    pub async fn run(&self, env: RunEnvironment, options: RunOptions) -> Result<Results, JobError> {
        JobScheduler::new(options).run(self, env).await
    }
}

pub struct JobBuilder {
    survey: Survey,
    agents: Vec<Agent>,
    scenarios: Vec<Scenario>,
    models: Vec<Arc<dyn LanguageModel>>,
}

impl JobBuilder {
    pub fn agent(mut self, agent: Agent) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn agents(mut self, agents: impl IntoIterator<Item = Agent>) -> Self {
        self.agents.extend(agents);
        self
    }

    pub fn scenario(mut self, scenario: Scenario) -> Self {
        self.scenarios.push(scenario);
        self
    }

    pub fn scenarios(mut self, scenarios: impl IntoIterator<Item = Scenario>) -> Self {
        self.scenarios.extend(scenarios);
        self
    }

    pub fn model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.models.push(model);
        self
    }

    pub fn models(mut self, models: impl IntoIterator<Item = Arc<dyn LanguageModel>>) -> Self {
        self.models.extend(models);
        self
    }

    /// Validate the survey against the job's agents and scenarios.
    ///
    /// Empty agent and scenario lists become one empty agent and one empty
    /// scenario; an empty model list becomes a model that always fails.
    pub fn build(self) -> Result<Job, SurveyError> {
        let JobBuilder {
            survey,
            mut agents,
            mut scenarios,
            mut models,
        } = self;
        if agents.is_empty() {
            agents.push(Agent::default());
        }
        if scenarios.is_empty() {
            scenarios.push(Scenario::new());
        }
        if models.is_empty() {
            models.push(Arc::new(NullModel::default()));
        }

        survey.validate()?;
        check_rule_references(&survey, &agents, &scenarios)?;
        check_templates(&survey, &agents, &scenarios)?;

        Ok(Job {
            survey: Arc::new(survey),
            agents: agents.into_iter().map(Arc::new).collect(),
            scenarios: scenarios.into_iter().map(Arc::new).collect(),
            models,
        })
    }
}

/// Every scenario and agent must define the fields a reference reads.
fn check_context_reference(
    reference: &Reference,
    agents: &[Agent],
    scenarios: &[Scenario],
) -> Result<(), SurveyError> {
    match reference {
        Reference::Scenario(field) => {
            for (i, scenario) in scenarios.iter().enumerate() {
                if scenario.get(field).is_none() {
                    return Err(SurveyError::MissingScenarioField {
                        scenario: scenario.label(i),
                        field: field.clone(),
                    });
                }
            }
        }
        Reference::AgentTrait(name) => {
            for agent in agents {
                if agent.trait_value(name).is_none() {
                    return Err(SurveyError::MissingAgentTrait {
                        agent: agent.name.clone(),
                        name: name.clone(),
                    });
                }
            }
        }
        Reference::Answer(_) | Reference::AgentName => {}
    }
    Ok(())
}

fn check_rule_references(
    survey: &Survey,
    agents: &[Agent],
    scenarios: &[Scenario],
) -> Result<(), SurveyError> {
    let expressions = survey
        .rules()
        .iter()
        .map(|r| &r.expression)
        .chain(survey.skip_rules().iter().map(|r| &r.expression));
    for expression in expressions {
        for reference in expression.references() {
            check_context_reference(&reference, agents, scenarios)?;
        }
    }
    Ok(())
}

/// Placeholders must parse, and answer placeholders must be visible through
/// the question's memory.
fn check_templates(
    survey: &Survey,
    agents: &[Agent],
    scenarios: &[Scenario],
) -> Result<(), SurveyError> {
    for (index, question) in survey.questions().iter().enumerate() {
        let references =
            prompt::placeholders(question.text()).map_err(|e| SurveyError::Template {
                question: question.name().to_string(),
                reason: e.to_string(),
            })?;
        for reference in references {
            if let Reference::Answer(target) = &reference {
                let Some(target_index) = survey.index_of(target) else {
                    return Err(SurveyError::UnknownReference {
                        context: format!("question {}", question.name()),
                        reference: reference.to_string(),
                    });
                };
                if !survey.memory_candidates(index).contains(&target_index) {
                    return Err(SurveyError::Template {
                        question: question.name().to_string(),
                        reason: format!("{target} is not in this question's memory"),
                    });
                }
            }
            check_context_reference(&reference, agents, scenarios)?;
        }
    }
    Ok(())
}

// ---- Scheduler ----

/// Runs a job's interviews concurrently and collects their results.
#[derive(Debug, Clone, Default)]
pub struct JobScheduler {
    options: RunOptions,
}

impl JobScheduler {
    pub fn new(options: RunOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    pub async fn run(&self, job: &Job, env: RunEnvironment) -> Result<Results, JobError> {
        self.options.validate()?;
        self.preflight(job).await?;
        let job_id = Uuid::new_v4().to_string();
        let span = obs::job_span(&job_id);
        self.execute(job, env, job_id).instrument(span).await
    }

    async fn preflight(&self, job: &Job) -> Result<(), JobError> {
        for model in job.models() {
            let info = model.info();
            if self.options.disable_remote_inference && info.locality == Locality::Remote {
                return Err(JobError::RemoteInferenceDisabled {
                    model: info.id.clone(),
                });
            }
            if self.options.check_api_keys && !self.options.dry_run {
                model
                    .check_credentials()
                    .await
                    .map_err(|e| JobError::MissingCredentials {
                        model: info.id.clone(),
                        reason: e.to_string(),
                    })?;
            }
        }
        Ok(())
    }

    /// `max_concurrency`, clamped to the combined request burst of the job's
    /// models. Models without a request limit lift the clamp.
    pub fn effective_concurrency(&self, job: &Job, env: &RunEnvironment) -> usize {
        let requested = self.options.max_concurrency.max(1);
        let mut seen: Vec<&str> = Vec::new();
        let mut burst: u64 = 0;
        for model in job.models() {
            if seen.contains(&model.id()) {
                continue;
            }
            seen.push(model.id());
            match env.limiters().limiter_for(model.info()).request_capacity() {
                Some(capacity) => burst = burst.saturating_add(capacity),
                None => return requested,
            }
        }
        let cap = usize::try_from(burst).unwrap_or(usize::MAX).max(1);
        if cap < requested {
            obs::emit_concurrency_clamped(requested, cap);
            cap
        } else {
            requested
        }
    }

    async fn execute(
        &self,
        job: &Job,
        env: RunEnvironment,
        job_id: String,
    ) -> Result<Results, JobError> {
        let started_at = Utc::now();
        let clock = tokio::time::Instant::now();
        let env = Arc::new(env);
        let interviews = job.interviews(self.options.n);
        let total = interviews.len();
        let concurrency = self.effective_concurrency(job, &env);
        obs::emit_job_started(&job_id, total, concurrency);

        let timeout = self.options.job_timeout_ms.map(|ms| {
            let env = Arc::clone(&env);
            tokio::spawn(
                async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    warn!(timeout_ms = ms, "job timed out, stopping");
                    env.request_stop();
                }
                .in_current_span(),
            )
        });

        let runner = Arc::new(InterviewRunner {
            settings: self.options.answer_settings(),
            stop_on_exception: self.options.stop_on_exception,
            print_exceptions: self.options.print_exceptions,
        });
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut slots: Vec<Option<InterviewResult>> = (0..total).map(|_| None).collect();
        let mut tasks = JoinSet::new();

        for interview in interviews {
            let index = interview.index;
            if env.is_stopped() {
                slots[index] = Some(interview.abort());
                continue;
            }
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|e| JobError::Join(e.to_string()))?;
            if env.is_stopped() {
                drop(permit);
                slots[index] = Some(interview.abort());
                continue;
            }

            let runner = Arc::clone(&runner);
            let env = Arc::clone(&env);
            let stop_on_exception = self.options.stop_on_exception;
            tasks.spawn(
                async move {
                    let _permit = permit;
                    let result = runner.run(interview, &env).await;
                    if stop_on_exception && result.has_failures() {
                        info!(interview = result.index, "stopping job after failure");
                        env.request_stop();
                    }
                    result
                }
                .in_current_span(),
            );
        }

        let mut join_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => {
                    if let Some(slot) = slots.get_mut(result.index) {
                        *slot = Some(result);
                    }
                }
                Err(e) => {
                    join_error.get_or_insert_with(|| e.to_string());
                }
            }
        }
        if let Some(handle) = timeout {
            handle.abort();
        }
        if let Some(e) = join_error {
            return Err(JobError::Join(e));
        }

        let cancelled = env.is_stopped();
        let results = Results::new(
            job_id.as_str(),
            started_at,
            slots.into_iter().flatten().collect(),
            cancelled,
        );
        METRICS.flush();
        obs::emit_job_finished(
            &job_id,
            u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX),
            results.len(),
            results.usage.new.total(),
            results.usage.cached.total(),
            cancelled,
        );
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelInfo, RateLimits, ScriptedModel};
    use crate::question::{FreeText, Question};
    use crate::survey::RuleTarget;

    fn survey(text: &str) -> Survey {
        let questions: Vec<Arc<dyn Question>> = vec![
            Arc::new(FreeText::new("q0", "First?")),
            Arc::new(FreeText::new("q1", text)),
        ];
        Survey::new(questions).unwrap()
    }

    #[test]
    fn test_expansion_order_is_canonical() {
        let job = Job::builder(survey("Second?"))
            .agents([Agent::new("a0"), Agent::new("a1")])
            .scenarios([Scenario::named("s0"), Scenario::named("s1")])
            .model(Arc::new(ScriptedModel::new("m0")))
            .model(Arc::new(ScriptedModel::new("m1")))
            .build()
            .unwrap();

        let order: Vec<(String, String, String, u32)> = job
            .interviews(2)
            .iter()
            .map(|i| {
                (
                    i.model.id().to_string(),
                    i.scenario.label(0),
                    i.agent.name.clone(),
                    i.iteration,
                )
            })
            .collect();
        assert_eq!(order.len(), 16);
        assert_eq!(order[0], ("m0".into(), "s0".into(), "a0".into(), 0));
        assert_eq!(order[1], ("m0".into(), "s0".into(), "a0".into(), 1));
        assert_eq!(order[2], ("m0".into(), "s0".into(), "a1".into(), 0));
        assert_eq!(order[4], ("m0".into(), "s1".into(), "a0".into(), 0));
        assert_eq!(order[8], ("m1".into(), "s0".into(), "a0".into(), 0));
        assert!(job.interviews(2).iter().enumerate().all(|(i, iv)| iv.index == i));
    }

    #[test]
    fn test_empty_lists_get_defaults() {
        let job = Job::builder(survey("Second?")).build().unwrap();
        assert_eq!(job.agents().len(), 1);
        assert_eq!(job.scenarios().len(), 1);
        assert_eq!(job.models()[0].id(), "none");
    }

    #[test]
    fn test_rule_reference_to_missing_scenario_field() {
        let s = survey("Second?")
            .add_rule("q0", "scenario.season == 'winter'", RuleTarget::EndOfSurvey)
            .unwrap();
        let err = Job::builder(s)
            .scenario(Scenario::named("s0").with("season", "winter"))
            .scenario(Scenario::named("s1"))
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            SurveyError::MissingScenarioField {
                scenario: "s1".into(),
                field: "season".into(),
            }
        );
    }

    #[test]
    fn test_template_answer_must_be_in_memory() {
        let err = Job::builder(survey("You said {{ q0 }}?")).build().unwrap_err();
        assert!(matches!(err, SurveyError::Template { ref question, .. } if question == "q1"));

        let with_memory = survey("You said {{ q0 }}?")
            .add_targeted_memory("q1", "q0")
            .unwrap();
        assert!(Job::builder(with_memory).build().is_ok());
    }

    #[test]
    fn test_template_agent_trait_checked() {
        let err = Job::builder(survey("At {{ agent.age }}?"))
            .agent(Agent::new("young").with_trait("age", 20))
            .agent(Agent::new("unknown"))
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            SurveyError::MissingAgentTrait {
                agent: "unknown".into(),
                name: "age".into(),
            }
        );
    }

    #[test]
    fn test_concurrency_clamped_to_request_burst() {
        let limited = ModelInfo::new("m").with_limits(RateLimits::new(20, 1_000_000));
        let job = Job::builder(survey("Second?"))
            .model(Arc::new(ScriptedModel::with_info(limited)))
            .build()
            .unwrap();
        let scheduler = JobScheduler::new(RunOptions {
            max_concurrency: 50,
            ..RunOptions::default()
        });
        assert_eq!(scheduler.effective_concurrency(&job, &RunEnvironment::new()), 2);

        let unlimited = Job::builder(survey("Second?"))
            .model(Arc::new(ScriptedModel::new("free")))
            .build()
            .unwrap();
        assert_eq!(scheduler.effective_concurrency(&unlimited, &RunEnvironment::new()), 50);
    }

    #[tokio::test]
    async fn test_remote_models_rejected_when_disabled() {
        let remote = ModelInfo::new("cloud").remote();
        let job = Job::builder(survey("Second?"))
            .model(Arc::new(ScriptedModel::with_info(remote)))
            .build()
            .unwrap();
        let options = RunOptions {
            disable_remote_inference: true,
            ..RunOptions::default()
        };
        let err = job.run(RunEnvironment::new(), options).await.unwrap_err();
        assert!(matches!(err, JobError::RemoteInferenceDisabled { ref model } if model == "cloud"));
    }

    #[tokio::test]
    async fn test_invalid_options_rejected() {
        let job = Job::builder(survey("Second?")).build().unwrap();
        let options = RunOptions {
            max_concurrency: 0,
            ..RunOptions::default()
        };
        assert!(matches!(
            job.run(RunEnvironment::new(), options).await,
            Err(JobError::InvalidOptions(_))
        ));
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        let options: RunOptions =
            serde_json::from_str(r#"{"max_concurrency": 3, "timeout_ms": 500}"#).unwrap();
        assert_eq!(options.max_concurrency, 3);
        assert_eq!(options.controls.timeout_ms, 500);
        assert_eq!(options.controls.max_retries, 2);
        assert_eq!(options.n, 1);
        assert!(options.print_exceptions);
    }
}
