//! Prompt rendering and model output parsing.
//!
//! Question text is a template: `{{ scenario.topic }}`, `{{ agent.age }}` and
//! `{{ q1 }}` placeholders are replaced from the scenario, the agent, and the
//! memory-visible prior answers. Anything the interview's memory scope does
//! not expose cannot be rendered.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::Agent;
use crate::expr::Reference;
use crate::memory::MemoryItem;
use crate::question::Answer;
use crate::scenario::Scenario;

const PERSONA_PREAMBLE: &str =
    "You are answering questions as if you were a human. Do not break character.";

/// The pair of prompts sent to a model for one question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedPrompt {
    pub system: String,
    pub user: String,
}

/// Everything a template may read while rendering one question.
#[derive(Debug, Clone, Copy)]
pub struct PromptContext<'a> {
    pub scenario: &'a Scenario,
    pub agent: &'a Agent,
    pub memory: &'a [MemoryItem],
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PromptError {
    #[error("malformed placeholder {0:?}")]
    Malformed(String),
    #[error("placeholder {0} has no value")]
    Unresolved(String),
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([^{}]*?)\s*\}\}").unwrap_or_else(|e| panic!("placeholder regex: {e}"))
    })
}

/// All references a template reads, in order of appearance.
pub fn placeholders(template: &str) -> Result<Vec<Reference>, PromptError> {
    placeholder_re()
        .captures_iter(template)
        .map(|cap| {
            let path = cap[1].to_string();
            Reference::parse(&path).ok_or(PromptError::Malformed(path))
        })
        .collect()
}

/// Text form of a value inside a prompt.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn resolve(reference: &Reference, ctx: &PromptContext<'_>) -> Result<String, PromptError> {
    let value = match reference {
        Reference::Scenario(field) => ctx.scenario.get(field).cloned(),
        Reference::AgentName => Some(Value::String(ctx.agent.name.clone())),
        Reference::AgentTrait(name) => ctx.agent.trait_value(name).cloned(),
        Reference::Answer(question) => Some(
            ctx.memory
                .iter()
                .find(|item| &item.question == question)
                .map(|item| item.answer.clone())
                .unwrap_or(Value::Null),
        ),
    };
    value
        .map(|v| display_value(&v))
        .ok_or_else(|| PromptError::Unresolved(reference.to_string()))
}

/// Substitute every placeholder in `template`.
pub fn render_template(template: &str, ctx: &PromptContext<'_>) -> Result<String, PromptError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for cap in placeholder_re().captures_iter(template) {
        let whole = cap.get(0).ok_or_else(|| PromptError::Malformed(template.to_string()))?;
        let path = &cap[1];
        let reference =
            Reference::parse(path).ok_or_else(|| PromptError::Malformed(path.to_string()))?;
        out.push_str(&template[last..whole.start()]);
        out.push_str(&resolve(&reference, ctx)?);
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// The persona prompt shared by every question an agent answers.
pub fn system_prompt(agent: &Agent) -> String {
    let mut prompt = PERSONA_PREAMBLE.to_string();
    let persona = agent.persona_context();
    if !persona.is_empty() {
        let traits = serde_json::to_string(persona).unwrap_or_default();
        prompt.push_str("\nYour traits: ");
        prompt.push_str(&traits);
    }
    if let Some(instruction) = &agent.instruction {
        prompt.push('\n');
        prompt.push_str(instruction);
    }
    prompt
}

fn memory_block(memory: &[MemoryItem]) -> String {
    if memory.is_empty() {
        return String::new();
    }
    let mut block = String::from("Before the question you are now answering, you already answered:\n");
    for item in memory {
        block.push_str(&format!(
            "Question: {}\nAnswer: {}\n",
            item.text,
            display_value(&item.answer)
        ));
    }
    block.push('\n');
    block
}

/// Standard rendering: persona system prompt, then memory, question text,
/// and the question's answer instructions.
pub fn render_question(
    text: &str,
    instructions: &str,
    ctx: &PromptContext<'_>,
) -> Result<RenderedPrompt, PromptError> {
    let body = render_template(text, ctx)?;
    let user = format!("{}{}\n\n{}", memory_block(ctx.memory), body, instructions);
    Ok(RenderedPrompt {
        system: system_prompt(ctx.agent),
        user,
    })
}

/// Follow-up prompt asking the model to fix an answer that failed validation.
pub fn repair_prompt(original_user: &str, invalid_output: &str, problem: &str) -> String {
    format!(
        "{original_user}\n\nYour previous response was:\n{invalid_output}\n\n\
         That response was invalid: {problem}\n\
         Answer again, following the answer format exactly."
    )
}

// ---- Output parsing ----

/// Answer and optional comment extracted from raw model text.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedOutput {
    pub answer: Answer,
    pub comment: Option<String>,
}

fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Parse a model response.
///
/// Accepts `{"answer": ..., "comment": ...}` (optionally fenced), any other
/// JSON value, or plain text where the first line is the answer and the rest
/// is the comment.
pub fn parse_model_output(raw: &str) -> ParsedOutput {
    let body = strip_fences(raw);
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        return match value {
            Value::Object(mut map) if map.contains_key("answer") => {
                let answer = map.remove("answer").unwrap_or(Value::Null);
                let comment = map.remove("comment").and_then(|c| match c {
                    Value::String(s) if !s.trim().is_empty() => Some(s),
                    Value::Null | Value::String(_) => None,
                    other => Some(other.to_string()),
                });
                ParsedOutput { answer, comment }
            }
            other => ParsedOutput {
                answer: other,
                comment: None,
            },
        };
    }

    let mut lines = body.lines();
    let answer = lines.next().unwrap_or_default().trim().to_string();
    let rest = lines.collect::<Vec<_>>().join("\n");
    let rest = rest.trim();
    ParsedOutput {
        answer: Value::String(answer),
        comment: (!rest.is_empty()).then(|| rest.to_string()),
    }
}

/// Rough token count used for limiter estimates.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(question: &str, text: &str, answer: Value) -> MemoryItem {
        MemoryItem {
            question: question.to_string(),
            text: text.to_string(),
            answer,
        }
    }

    #[test]
    fn test_placeholders_parse_references() {
        let refs = placeholders("Hi {{ agent.name }}, about {{scenario.topic}} and {{ q1 }}").unwrap();
        assert_eq!(
            refs,
            vec![
                Reference::AgentName,
                Reference::Scenario("topic".into()),
                Reference::Answer("q1".into()),
            ]
        );
        assert!(placeholders("{{ a.b.c }}").is_err());
    }

    #[test]
    fn test_render_substitutes_scenario_agent_and_memory() {
        let scenario = Scenario::new().with("topic", "tea");
        let agent = Agent::new("alice").with_trait("age", 30);
        let memory = vec![item("q1", "Do you drink tea?", json!("Yes"))];
        let ctx = PromptContext {
            scenario: &scenario,
            agent: &agent,
            memory: &memory,
        };

        let out = render_template(
            "{{ agent.name }} ({{ agent.age }}) said {{ q1 }} about {{ scenario.topic }}",
            &ctx,
        )
        .unwrap();
        assert_eq!(out, "alice (30) said Yes about tea");
    }

    #[test]
    fn test_answer_outside_memory_renders_none() {
        let scenario = Scenario::new();
        let agent = Agent::new("a");
        let ctx = PromptContext {
            scenario: &scenario,
            agent: &agent,
            memory: &[],
        };
        assert_eq!(render_template("prior: {{ q1 }}", &ctx).unwrap(), "prior: None");
        assert_eq!(
            render_template("{{ scenario.missing }}", &ctx),
            Err(PromptError::Unresolved("scenario.missing".into()))
        );
    }

    #[test]
    fn test_render_question_layout() {
        let scenario = Scenario::new();
        let agent = Agent::new("a").with_trait("mood", "calm");
        let memory = vec![item("q1", "First?", json!("Yes"))];
        let ctx = PromptContext {
            scenario: &scenario,
            agent: &agent,
            memory: &memory,
        };
        let prompt = render_question("Second?", "Reply briefly.", &ctx).unwrap();

        assert!(prompt.system.starts_with(PERSONA_PREAMBLE));
        assert!(prompt.system.contains(r#"{"mood":"calm"}"#));
        assert!(prompt.user.contains("Question: First?\nAnswer: Yes"));
        assert!(prompt.user.ends_with("Second?\n\nReply briefly."));
    }

    #[test]
    fn test_parse_structured_and_fenced_output() {
        let parsed = parse_model_output(r#"{"answer": "No", "comment": "not really"}"#);
        assert_eq!(parsed.answer, json!("No"));
        assert_eq!(parsed.comment.as_deref(), Some("not really"));

        let parsed = parse_model_output("```json\n{\"answer\": 7}\n```");
        assert_eq!(parsed.answer, json!(7));
        assert_eq!(parsed.comment, None);

        let parsed = parse_model_output("[\"a\", \"b\"]");
        assert_eq!(parsed.answer, json!(["a", "b"]));
    }

    #[test]
    fn test_parse_plain_text_output() {
        let parsed = parse_model_output("  Yes\nBecause I like it.\n");
        assert_eq!(parsed.answer, json!("Yes"));
        assert_eq!(parsed.comment.as_deref(), Some("Because I like it."));
    }

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
