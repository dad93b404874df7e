use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use survey_cache::Usage;

use super::{LanguageModel, ModelInfo, ModelResponse};
use crate::error::ModelError;
use crate::prompt::estimate_tokens;

type Responder = dyn Fn(&str, &str) -> Option<String> + Send + Sync;

/// A failure to inject into the next scripted call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    Transient,
    RateLimited,
    Fatal,
    /// Never respond, so the caller's timeout fires.
    Hang,
}

/// Deterministic offline model.
///
/// Responders are tried in registration order against `(system, user)`; the
/// first to return `Some` supplies the output. Usage is estimated from text
/// length. Every prompt pair is recorded for inspection.
pub struct ScriptedModel {
    info: ModelInfo,
    responders: Vec<Arc<Responder>>,
    default_response: Option<String>,
    latency: Option<Duration>,
    failures: Mutex<VecDeque<ScriptedFailure>>,
    calls: AtomicU32,
    in_flight: AtomicU32,
    peak_in_flight: AtomicU32,
    prompts: Mutex<Vec<(String, String)>>,
}

impl ScriptedModel {
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_info(ModelInfo::new(id))
    }

    pub fn with_info(info: ModelInfo) -> Self {
        Self {
            info,
            responders: Vec::new(),
            default_response: None,
            latency: None,
            failures: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
            in_flight: AtomicU32::new(0),
            peak_in_flight: AtomicU32::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&str, &str) -> Option<String> + Send + Sync + 'static,
    {
        self.responders.push(Arc::new(responder));
        self
    }

    /// Respond with `response` when either prompt contains every pattern.
    pub fn on_prompt_containing<S: Into<String>>(
        self,
        patterns: impl IntoIterator<Item = S>,
        response: impl Into<String>,
    ) -> Self {
        let patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
        let response = response.into();
        self.with_responder(move |system, user| {
            patterns
                .iter()
                .all(|p| system.contains(p.as_str()) || user.contains(p.as_str()))
                .then(|| response.clone())
        })
    }

    pub fn with_default(mut self, response: impl Into<String>) -> Self {
        self.default_response = Some(response.into());
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queue `count` failures ahead of normal responses.
    pub fn fail_next(self, count: usize, failure: ScriptedFailure) -> Self {
        if let Ok(mut queue) = self.failures.lock() {
            queue.extend(std::iter::repeat(failure).take(count));
        }
        self
    }

    /// Number of calls received, including failed ones.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls observed running at once.
    pub fn peak_concurrency(&self) -> u32 {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Every `(system, user)` prompt pair received, in arrival order.
    pub fn prompts(&self) -> Vec<(String, String)> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    fn next_failure(&self) -> Option<ScriptedFailure> {
        self.failures.lock().ok().and_then(|mut q| q.pop_front())
    }

    fn respond(&self, system: &str, user: &str) -> Option<String> {
        self.responders
            .iter()
            .find_map(|r| r(system, user))
            .or_else(|| self.default_response.clone())
    }
}

impl fmt::Debug for ScriptedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedModel")
            .field("id", &self.info.id)
            .field("responders", &self.responders.len())
            .field("calls", &self.calls())
            .finish_non_exhaustive()
    }
}

struct InFlight<'a>(&'a AtomicU32);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn info(&self) -> &ModelInfo {
        &self.info
    }

    async fn call(&self, system_prompt: &str, user_prompt: &str) -> Result<ModelResponse, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push((system_prompt.to_string(), user_prompt.to_string()));
        }

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        match self.next_failure() {
            Some(ScriptedFailure::Transient) => {
                return Err(ModelError::Transient("scripted transient failure".into()))
            }
            Some(ScriptedFailure::RateLimited) => {
                return Err(ModelError::RateLimited { retry_after: None })
            }
            Some(ScriptedFailure::Fatal) => {
                return Err(ModelError::Fatal("scripted fatal failure".into()))
            }
            Some(ScriptedFailure::Hang) => {
                tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;
                return Err(ModelError::Transient("scripted hang elapsed".into()));
            }
            None => {}
        }

        let text = self
            .respond(system_prompt, user_prompt)
            .ok_or_else(|| ModelError::Fatal(format!("{}: no scripted response", self.info.id)))?;
        let usage = Usage::new(
            estimate_tokens(system_prompt) + estimate_tokens(user_prompt),
            estimate_tokens(&text),
        );
        Ok(ModelResponse::new(text, usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_matching_responder_wins() {
        let model = ScriptedModel::new("m")
            .on_prompt_containing(["age"], r#"{"answer": 30}"#)
            .on_prompt_containing(["name"], r#"{"answer": "x"}"#)
            .with_default("fallback");

        let out = model.call("sys", "your name and age?").await.unwrap();
        assert_eq!(out.text, r#"{"answer": 30}"#);
        let out = model.call("sys", "something else").await.unwrap();
        assert_eq!(out.text, "fallback");
        assert!(out.usage.input_tokens > 0);
        assert_eq!(model.calls(), 2);
        assert_eq!(model.prompts().len(), 2);
    }

    #[tokio::test]
    async fn test_injected_failures_come_first() {
        let model = ScriptedModel::new("m")
            .with_default("ok")
            .fail_next(2, ScriptedFailure::Transient);
        assert!(model.call("s", "u").await.is_err());
        assert!(model.call("s", "u").await.is_err());
        assert_eq!(model.call("s", "u").await.unwrap().text, "ok");
    }

    #[tokio::test]
    async fn test_no_response_is_fatal() {
        let model = ScriptedModel::new("m");
        assert!(matches!(model.call("s", "u").await, Err(ModelError::Fatal(_))));
    }
}
