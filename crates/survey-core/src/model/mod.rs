//! Language model abstraction.

pub mod controls;
mod openai;
mod scripted;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use survey_cache::Usage;

pub use controls::{execute_with_controls, CallControls, Controlled};
pub use openai::OpenAiCompatibleModel;
pub use scripted::{ScriptedFailure, ScriptedModel};

use crate::error::ModelError;

/// Where inference happens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Locality {
    #[default]
    Local,
    Remote,
}

/// Provider limits. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_per_minute: Option<u64>,
}

impl RateLimits {
    pub fn new(requests_per_minute: u64, tokens_per_minute: u64) -> Self {
        Self {
            requests_per_minute: Some(requests_per_minute),
            tokens_per_minute: Some(tokens_per_minute),
        }
    }

    pub fn unlimited() -> Self {
        Self::default()
    }
}

/// USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl Pricing {
    pub fn cost(&self, usage: &Usage) -> f64 {
        (usage.input_tokens as f64 * self.input_per_million
            + usage.output_tokens as f64 * self.output_per_million)
            / 1_000_000.0
    }
}

/// Identity and operating envelope of a model. `id` and `parameters` are
/// part of every cache key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default)]
    pub limits: RateLimits,
    #[serde(default)]
    pub locality: Locality,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing: Option<Pricing>,
    /// Output tokens assumed when estimating a request for the limiter.
    #[serde(default = "default_expected_output_tokens")]
    pub expected_output_tokens: u64,
}

fn default_expected_output_tokens() -> u64 {
    256
}

impl ModelInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parameters: BTreeMap::new(),
            limits: RateLimits::default(),
            locality: Locality::Local,
            pricing: None,
            expected_output_tokens: default_expected_output_tokens(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn with_limits(mut self, limits: RateLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_pricing(mut self, pricing: Pricing) -> Self {
        self.pricing = Some(pricing);
        self
    }

    pub fn remote(mut self) -> Self {
        self.locality = Locality::Remote;
        self
    }

    /// `max_tokens` when set, else the configured expectation.
    pub fn output_token_estimate(&self) -> u64 {
        self.parameters
            .get("max_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(self.expected_output_tokens)
    }
}

/// Raw text returned by a model call.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelResponse {
    pub text: String,
    pub usage: Usage,
}

impl ModelResponse {
    pub fn new(text: impl Into<String>, usage: Usage) -> Self {
        Self {
            text: text.into(),
            usage,
        }
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync + fmt::Debug {
    fn info(&self) -> &ModelInfo;

    fn id(&self) -> &str {
        &self.info().id
    }

    async fn call(&self, system_prompt: &str, user_prompt: &str) -> Result<ModelResponse, ModelError>;

    /// Pre-flight check that credentials are present.
    async fn check_credentials(&self) -> Result<(), ModelError> {
        Ok(())
    }
}

/// Stand-in when a job has no model. Every call fails.
#[derive(Debug, Clone)]
pub struct NullModel {
    info: ModelInfo,
}

impl Default for NullModel {
    fn default() -> Self {
        Self {
            info: ModelInfo::new("none"),
        }
    }
}

#[async_trait]
impl LanguageModel for NullModel {
    fn info(&self) -> &ModelInfo {
        &self.info
    }

    async fn call(&self, _system: &str, _user: &str) -> Result<ModelResponse, ModelError> {
        Err(ModelError::Fatal("no model configured for this job".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pricing_per_million() {
        let p = Pricing {
            input_per_million: 2.0,
            output_per_million: 10.0,
        };
        let cost = p.cost(&Usage::new(500_000, 100_000));
        assert!((cost - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_output_estimate_prefers_max_tokens() {
        let info = ModelInfo::new("m");
        assert_eq!(info.output_token_estimate(), 256);
        let info = info.with_parameter("max_tokens", 64);
        assert_eq!(info.output_token_estimate(), 64);
    }

    #[test]
    fn test_model_info_serde_defaults() {
        let info: ModelInfo = serde_json::from_str(r#"{"id": "gpt"}"#).unwrap();
        assert_eq!(info, ModelInfo::new("gpt"));
    }

    #[tokio::test]
    async fn test_null_model_always_fails() {
        let m = NullModel::default();
        assert_eq!(m.id(), "none");
        assert!(matches!(m.call("s", "u").await, Err(ModelError::Fatal(_))));
    }
}
