//! JSON job definition files.
//!
//! A definition describes the survey, agents, scenarios, models, and run
//! options of a job:
//!
//! ```json
//! {
//!   "survey": {
//!     "questions": [
//!       {"type": "yes_no", "name": "tea", "text": "Do you drink tea?"},
//!       {"type": "free_text", "name": "why", "text": "Why not?"}
//!     ],
//!     "rules": [{"source": "tea", "expression": "tea == 'Yes'", "target": "end_of_survey"}]
//!   },
//!   "agents": [{"name": "alice", "traits": {"age": 30}}],
//!   "models": [{"type": "scripted", "id": "fixture", "default": "Yes"}],
//!   "options": {"max_concurrency": 4}
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::{Agent, CannedAnswers};
use crate::error::{ModelError, SurveyError};
use crate::job::{Job, RunOptions};
use crate::model::{LanguageModel, ModelInfo, OpenAiCompatibleModel, ScriptedModel};
use crate::question::{Checkbox, FreeText, LinearScale, MultipleChoice, Numerical, Question};
use crate::scenario::Scenario;
use crate::survey::{MemoryPlan, RuleTarget, Survey};

#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid job definition: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Survey(#[from] SurveyError),

    #[error(transparent)]
    Model(#[from] ModelError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QuestionDefinition {
    FreeText {
        name: String,
        text: String,
    },
    MultipleChoice {
        name: String,
        text: String,
        options: Vec<String>,
    },
    YesNo {
        name: String,
        text: String,
    },
    Numerical {
        name: String,
        text: String,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    Checkbox {
        name: String,
        text: String,
        options: Vec<String>,
        #[serde(default)]
        min_selections: Option<usize>,
        #[serde(default)]
        max_selections: Option<usize>,
    },
    LinearScale {
        name: String,
        text: String,
        options: Vec<i64>,
        /// Point labels keyed by the point, e.g. `{"1": "never"}`.
        #[serde(default)]
        labels: BTreeMap<String, String>,
    },
}

impl QuestionDefinition {
    pub fn build(&self) -> Result<Arc<dyn Question>, SurveyError> {
        let question: Arc<dyn Question> = match self {
            QuestionDefinition::FreeText { name, text } => Arc::new(FreeText::new(name, text)),
            QuestionDefinition::MultipleChoice { name, text, options } => {
                Arc::new(MultipleChoice::new(name, text, options.iter().cloned()))
            }
            QuestionDefinition::YesNo { name, text } => Arc::new(MultipleChoice::yes_no(name, text)),
            QuestionDefinition::Numerical { name, text, min, max } => {
                Arc::new(Numerical::new(name, text).with_range(*min, *max))
            }
            QuestionDefinition::Checkbox {
                name,
                text,
                options,
                min_selections,
                max_selections,
            } => Arc::new(
                Checkbox::new(name, text, options.iter().cloned())
                    .with_selections(*min_selections, *max_selections),
            ),
            QuestionDefinition::LinearScale {
                name,
                text,
                options,
                labels,
            } => {
                let mut scale = LinearScale::new(name, text, options.clone());
                for (point, label) in labels {
                    let point = point.trim().parse::<i64>().map_err(|_| SurveyError::InvalidQuestion {
                        name: name.clone(),
                        reason: format!("label key {point:?} is not an integer"),
                    })?;
                    scale = scale.with_label(point, label);
                }
                Arc::new(scale)
            }
        };
        Ok(question)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub source: String,
    pub expression: String,
    pub target: RuleTarget,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipRuleDefinition {
    pub question: String,
    pub expression: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurveyDefinition {
    pub questions: Vec<QuestionDefinition>,
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
    #[serde(default)]
    pub skip_rules: Vec<SkipRuleDefinition>,
    #[serde(default)]
    pub memory: MemoryPlan,
}

impl SurveyDefinition {
    pub fn build(&self) -> Result<Survey, SurveyError> {
        let questions = self
            .questions
            .iter()
            .map(QuestionDefinition::build)
            .collect::<Result<Vec<_>, _>>()?;
        let mut survey = Survey::new(questions)?.with_memory_plan(self.memory.clone())?;
        for rule in &self.rules {
            survey = survey.add_rule(&rule.source, &rule.expression, rule.target.clone())?;
        }
        for skip in &self.skip_rules {
            survey = survey.add_skip_rule(&skip.question, &skip.expression)?;
        }
        Ok(survey)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    #[serde(flatten)]
    pub agent: Agent,
    /// Canned answers by question name, answered without a model.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub answers: BTreeMap<String, Value>,
}

impl AgentDefinition {
    pub fn build(&self) -> Agent {
        if self.answers.is_empty() {
            return self.agent.clone();
        }
        self.agent
            .clone()
            .with_direct_answerer(Arc::new(CannedAnswers(self.answers.clone())))
    }
}

/// A scripted response: `output` is returned when the prompts contain every
/// string in `contains`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptedResponse {
    #[serde(default)]
    pub contains: Vec<String>,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptedDefinition {
    #[serde(flatten)]
    pub info: ModelInfo,
    #[serde(default)]
    pub responses: Vec<ScriptedResponse>,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAiDefinition {
    #[serde(flatten)]
    pub info: ModelInfo,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelDefinition {
    Scripted(ScriptedDefinition),
    OpenaiCompatible(OpenAiDefinition),
}

impl ModelDefinition {
    pub fn build(&self) -> Result<Arc<dyn LanguageModel>, ModelError> {
        match self {
            ModelDefinition::Scripted(def) => {
                let mut model = ScriptedModel::with_info(def.info.clone());
                for response in &def.responses {
                    model = model.on_prompt_containing(response.contains.iter().cloned(), &response.output);
                }
                if let Some(default) = &def.default {
                    model = model.with_default(default);
                }
                if let Some(ms) = def.latency_ms {
                    model = model.with_latency(Duration::from_millis(ms));
                }
                Ok(Arc::new(model))
            }
            ModelDefinition::OpenaiCompatible(def) => Ok(Arc::new(OpenAiCompatibleModel::new(
                def.info.clone(),
                def.base_url.clone(),
                &def.api_key_env,
            )?)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub survey: SurveyDefinition,
    #[serde(default)]
    pub agents: Vec<AgentDefinition>,
    #[serde(default)]
    pub scenarios: Vec<Scenario>,
    #[serde(default)]
    pub models: Vec<ModelDefinition>,
    #[serde(default)]
    pub options: RunOptions,
}

impl JobDefinition {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, DefinitionError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| DefinitionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, DefinitionError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Build the job; the definition's run options are returned alongside.
    pub fn into_job(self) -> Result<(Job, RunOptions), DefinitionError> {
        let survey = self.survey.build()?;
        let models = self
            .models
            .iter()
            .map(ModelDefinition::build)
            .collect::<Result<Vec<_>, _>>()?;
        let job = Job::builder(survey)
            .agents(self.agents.iter().map(AgentDefinition::build))
            .scenarios(self.scenarios)
            .models(models)
            .build()?;
        Ok((job, self.options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Locality;

    const DEFINITION: &str = r#"{
        "survey": {
            "questions": [
                {"type": "yes_no", "name": "tea", "text": "Do you drink tea, {{ agent.name }}?"},
                {"type": "free_text", "name": "why", "text": "Why not?"},
                {"type": "linear_scale", "name": "love", "text": "How much?", "options": [1, 2, 3],
                 "labels": {"1": "a little", "3": "a lot"}}
            ],
            "rules": [{"source": "tea", "expression": "tea == 'Yes'", "target": {"question": "love"}}],
            "skip_rules": [{"question": "why", "expression": "scenario.season == 'summer'"}],
            "memory": {"mode": "none", "targets": {"love": ["tea"]}}
        },
        "agents": [
            {"name": "alice", "traits": {"age": 30}},
            {"name": "bob", "answers": {"tea": "No"}}
        ],
        "scenarios": [{"name": "winter", "season": "winter"}],
        "models": [
            {"type": "scripted", "id": "fixture", "responses": [{"contains": ["tea"], "output": "Yes"}],
             "default": "2", "limits": {"requests_per_minute": 600, "tokens_per_minute": 100000}}
        ],
        "options": {"max_concurrency": 2, "n": 1, "timeout_ms": 5000}
    }"#;

    #[test]
    fn test_parse_and_build_job() {
        let def = JobDefinition::from_json(DEFINITION).unwrap();
        assert_eq!(def.survey.questions.len(), 3);
        assert_eq!(def.options.max_concurrency, 2);
        assert_eq!(def.options.controls.timeout_ms, 5000);

        let (job, options) = def.into_job().unwrap();
        assert_eq!(options.max_concurrency, 2);
        assert_eq!(job.survey().len(), 3);
        assert_eq!(job.agents().len(), 2);
        assert!(job.agents()[1].direct_answerer().is_some());
        assert!(job.agents()[0].direct_answerer().is_none());
        assert_eq!(job.models()[0].id(), "fixture");
        assert_eq!(
            job.models()[0].info().limits.requests_per_minute,
            Some(600)
        );
        assert_eq!(job.survey().rules().len(), 1);
        assert_eq!(job.survey().skip_rules().len(), 1);
    }

    #[test]
    fn test_openai_model_is_remote() {
        let def: ModelDefinition = serde_json::from_str(
            r#"{"type": "openai_compatible", "id": "gpt-test", "base_url": "http://localhost:9/v1",
                "parameters": {"temperature": 0.5}}"#,
        )
        .unwrap();
        let model = def.build().unwrap();
        assert_eq!(model.info().locality, Locality::Remote);
        assert_eq!(model.info().parameters["temperature"], 0.5);
    }

    #[test]
    fn test_construction_errors_surface() {
        let text = DEFINITION.replace("\"source\": \"tea\"", "\"source\": \"nope\"");
        let err = JobDefinition::from_json(&text).unwrap().into_job().unwrap_err();
        assert!(matches!(
            err,
            DefinitionError::Survey(SurveyError::UnknownQuestion { ref name, .. }) if name == "nope"
        ));
    }

    #[test]
    fn test_scale_label_keys_must_be_points() {
        let text = DEFINITION.replace("\"3\": \"a lot\"", "\"lots\": \"a lot\"");
        let err = JobDefinition::from_json(&text).unwrap().into_job().unwrap_err();
        assert!(matches!(
            err,
            DefinitionError::Survey(SurveyError::InvalidQuestion { ref name, .. }) if name == "love"
        ));
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = JobDefinition::from_path("/definitely/not/here.json").unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.json"));
    }
}
