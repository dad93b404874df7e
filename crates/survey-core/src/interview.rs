//! One agent answering one survey under one model and scenario.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::agent::Agent;
use crate::environment::{self, RunEnvironment};
use crate::flow::{AnswerScope, Next, SurveyFlowResolver};
use crate::invigilator::{AnswerSettings, Invigilator, QuestionTask};
use crate::memory::MemoryScope;
use crate::metrics::METRICS;
use crate::model::LanguageModel;
use crate::obs;
use crate::question::Answer;
use crate::results::{InterviewResult, QuestionRecord, QuestionStatus, UsageSplit};
use crate::scenario::Scenario;
use crate::survey::Survey;

/// Mutable state of an interview while it runs.
#[derive(Debug)]
pub struct Interview {
    pub index: usize,
    pub survey: Arc<Survey>,
    pub agent: Arc<Agent>,
    pub scenario: Arc<Scenario>,
    pub model: Arc<dyn LanguageModel>,
    pub iteration: u32,
    answers: HashMap<String, Answer>,
    records: Vec<QuestionRecord>,
}

impl Interview {
    pub fn new(
        index: usize,
        survey: Arc<Survey>,
        agent: Arc<Agent>,
        scenario: Arc<Scenario>,
        model: Arc<dyn LanguageModel>,
        iteration: u32,
    ) -> Self {
        let records = survey
            .questions()
            .iter()
            .map(|q| QuestionRecord::not_started(q.name()))
            .collect();
        Self {
            index,
            survey,
            agent,
            scenario,
            model,
            iteration,
            answers: HashMap::new(),
            records,
        }
    }

    pub fn answers(&self) -> &HashMap<String, Answer> {
        &self.answers
    }

    pub fn status(&self, question: &str) -> Option<QuestionStatus> {
        self.records.iter().find(|r| r.name == question).map(|r| r.status)
    }

    fn record(&mut self, index: usize, record: QuestionRecord) {
        if let Some(answer) = &record.answer {
            self.answers.insert(record.name.clone(), answer.clone());
        }
        if let Some(slot) = self.records.get_mut(index) {
            *slot = record;
        }
    }

    fn mark(&mut self, index: usize, status: QuestionStatus) {
        if let Some(slot) = self.records.get_mut(index) {
            slot.status = status;
        }
    }

    /// Close every unfinished question with `status`.
    fn close_remaining(&mut self, status: QuestionStatus) {
        for record in &mut self.records {
            if !record.status.is_terminal() {
                record.status = status;
            }
        }
    }

    /// Result for an interview that never started because the job stopped.
    pub fn abort(mut self) -> InterviewResult {
        self.close_remaining(QuestionStatus::Aborted);
        self.into_result()
    }

    pub fn into_result(self) -> InterviewResult {
        let mut usage = UsageSplit::default();
        for record in &self.records {
            usage += record.usage;
        }
        let cost_usd = self
            .model
            .info()
            .pricing
            .as_ref()
            .map(|p| p.cost(&usage.new))
            .unwrap_or(0.0);
        InterviewResult {
            index: self.index,
            agent: Agent::clone(&self.agent),
            scenario: Scenario::clone(&self.scenario),
            model: self.model.id().to_string(),
            iteration: self.iteration,
            questions: self.records,
            usage,
            cost_usd,
        }
    }
}

/// Drives an interview to completion.
#[derive(Debug, Clone, Default)]
pub struct InterviewRunner {
    pub settings: AnswerSettings,
    /// Stop this interview at its first failed question.
    pub stop_on_exception: bool,
    /// Log each failed question at warn level.
    pub print_exceptions: bool,
}

impl InterviewRunner {
    pub fn new(settings: AnswerSettings) -> Self {
        Self {
            settings,
            stop_on_exception: false,
            print_exceptions: true,
        }
    }

    pub async fn run(&self, mut interview: Interview, env: &RunEnvironment) -> InterviewResult {
        let survey = Arc::clone(&interview.survey);
        let agent = Arc::clone(&interview.agent);
        let scenario = Arc::clone(&interview.scenario);
        let model = Arc::clone(&interview.model);
        let resolver = SurveyFlowResolver::new(&survey);
        let memory = MemoryScope::new(&survey);
        let mut stop = env.subscribe();

        let mut cursor = resolver.start();
        let mut cancelled = false;
        let mut halted = false;

        while let Next::Question(index) = cursor {
            if *stop.borrow() {
                cancelled = true;
                break;
            }
            let Some(question) = survey.question(index) else {
                break;
            };

            let skip = {
                let scope = AnswerScope {
                    answers: &interview.answers,
                    scenario: &scenario,
                    agent: &agent,
                };
                resolver.should_skip(index, &scope)
            };
            if skip {
                debug!(interview = interview.index, question = %question.name(), "skip rule matched");
                interview.mark(index, QuestionStatus::Skipped);
            } else {
                interview.mark(index, QuestionStatus::InFlight);
                let context = memory.context_for(index, &interview.answers, &scenario, &agent);
                let task = QuestionTask {
                    question: question.as_ref(),
                    agent: &agent,
                    scenario: &scenario,
                    model: model.as_ref(),
                    memory: &context,
                    iteration: interview.iteration,
                };
                let invigilator = Invigilator::select(question.as_ref(), &agent);

                let outcome = tokio::select! {
                    biased;
                    _ = environment::stopped(&mut stop) => None,
                    record = invigilator.answer(&task, env, &self.settings) => Some(record),
                };
                let Some(record) = outcome else {
                    cancelled = true;
                    break;
                };

                let failed = record.status == QuestionStatus::Failed;
                if let (true, Some(error)) = (failed, record.error.as_ref()) {
                    if self.print_exceptions {
                        obs::emit_question_failed(interview.index, question.name(), error);
                    } else {
                        debug!(interview = interview.index, question = %question.name(), %error, "question failed");
                    }
                }
                interview.record(index, record);
                if failed && self.stop_on_exception {
                    halted = true;
                    break;
                }
            }

            let scope = AnswerScope {
                answers: &interview.answers,
                scenario: &scenario,
                agent: &agent,
            };
            cursor = resolver.next_question(index, &scope);
        }

        if cancelled {
            interview.close_remaining(QuestionStatus::Aborted);
        } else {
            if halted {
                debug!(interview = interview.index, "stopping interview after failure");
            }
            interview.close_remaining(QuestionStatus::Skipped);
        }

        let result = interview.into_result();
        METRICS.inc_interviews_finished();
        obs::emit_interview_finished(
            result.index,
            result.count(QuestionStatus::Succeeded),
            result.count(QuestionStatus::Failed),
            result.count(QuestionStatus::Skipped),
        );
        result
    }
}
