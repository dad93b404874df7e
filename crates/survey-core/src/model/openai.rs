use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use survey_cache::Usage;
use tracing::debug;

use super::{LanguageModel, ModelInfo, ModelResponse};
use crate::error::ModelError;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Chat-completions client for any OpenAI-compatible endpoint.
///
/// The API key is read from the named environment variable at call time so
/// that a job definition never carries secrets.
pub struct OpenAiCompatibleModel {
    info: ModelInfo,
    base_url: String,
    api_key_env: String,
    http_client: reqwest::Client,
}

impl OpenAiCompatibleModel {
    pub fn new(info: ModelInfo, base_url: Option<String>, api_key_env: impl Into<String>) -> Result<Self, ModelError> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("survey-core/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ModelError::Fatal(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            info: info.remote(),
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key_env: api_key_env.into(),
            http_client,
        })
    }

    fn api_key(&self) -> Result<String, ModelError> {
        match std::env::var(&self.api_key_env) {
            Ok(key) if !key.trim().is_empty() => Ok(key),
            _ => Err(ModelError::MissingCredentials {
                model: self.info.id.clone(),
                detail: format!("environment variable {} is not set", self.api_key_env),
            }),
        }
    }

    fn request_body(&self, system_prompt: &str, user_prompt: &str) -> Value {
        let mut body = json!({
            "model": self.info.id,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
        });
        if let Some(obj) = body.as_object_mut() {
            for (k, v) in &self.info.parameters {
                obj.insert(k.clone(), v.clone());
            }
        }
        body
    }
}

impl fmt::Debug for OpenAiCompatibleModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiCompatibleModel")
            .field("id", &self.info.id)
            .field("base_url", &self.base_url)
            .field("api_key_env", &self.api_key_env)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn classify_transport(err: reqwest::Error) -> ModelError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        ModelError::Transient(err.to_string())
    } else {
        ModelError::Fatal(err.to_string())
    }
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|s| s.is_finite() && *s >= 0.0)
        .map(Duration::from_secs_f64)
}

/// Map a non-success HTTP status to a model error.
fn classify_status(status: StatusCode, retry: Option<Duration>, body: String, model: &str) -> ModelError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ModelError::RateLimited { retry_after: retry },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ModelError::MissingCredentials {
            model: model.to_string(),
            detail: format!("{status}: {body}"),
        },
        StatusCode::REQUEST_TIMEOUT => ModelError::Transient(format!("{status}: {body}")),
        s if s.is_server_error() => ModelError::Transient(format!("{status}: {body}")),
        _ => ModelError::Fatal(format!("{status}: {body}")),
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatibleModel {
    fn info(&self) -> &ModelInfo {
        &self.info
    }

    async fn call(&self, system_prompt: &str, user_prompt: &str) -> Result<ModelResponse, ModelError> {
        let key = self.api_key()?;
        let url = format!("{}/chat/completions", self.base_url);
        debug!(model = %self.info.id, %url, "calling model");

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(key)
            .json(&self.request_body(system_prompt, user_prompt))
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let retry = retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, retry, body, &self.info.id));
        }

        let payload: ChatResponse = response
            .json()
            .await
            .map_err(|e| ModelError::Transient(format!("malformed response body: {e}")))?;
        let text = payload
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ModelError::Fatal("response has no message content".into()))?;
        let usage = payload
            .usage
            .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();
        Ok(ModelResponse::new(text, usage))
    }

    async fn check_credentials(&self) -> Result<(), ModelError> {
        self.api_key().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Locality;

    fn model(env: &str) -> OpenAiCompatibleModel {
        OpenAiCompatibleModel::new(
            ModelInfo::new("gpt-test").with_parameter("temperature", 0.5),
            Some("http://localhost:9/v1/".into()),
            env,
        )
        .unwrap()
    }

    #[test]
    fn test_model_is_remote_and_trims_base_url() {
        let m = model("SURVEY_TEST_UNSET_KEY_A");
        assert_eq!(m.info().locality, Locality::Remote);
        assert_eq!(m.base_url, "http://localhost:9/v1");
    }

    #[test]
    fn test_request_body_merges_parameters() {
        let m = model("SURVEY_TEST_UNSET_KEY_B");
        let body = m.request_body("sys", "user");
        assert_eq!(body["model"], "gpt-test");
        assert_eq!(body["temperature"], 0.5);
        assert_eq!(body["messages"][1]["content"], "user");
    }

    #[tokio::test]
    async fn test_missing_key_fails_credential_check() {
        let m = model("SURVEY_TEST_UNSET_KEY_C");
        assert!(matches!(
            m.check_credentials().await,
            Err(ModelError::MissingCredentials { .. })
        ));
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(2)), String::new(), "m"),
            ModelError::RateLimited { retry_after: Some(d) } if d == Duration::from_secs(2)
        ));
        assert!(classify_status(StatusCode::BAD_GATEWAY, None, String::new(), "m").is_retryable());
        assert!(!classify_status(StatusCode::BAD_REQUEST, None, String::new(), "m").is_retryable());
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None, String::new(), "m"),
            ModelError::MissingCredentials { .. }
        ));
    }
}
