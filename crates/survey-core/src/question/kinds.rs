use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::{Answer, Question, JSON_FORMAT_HINT};
use crate::agent::Agent;
use crate::error::ValidationError;
use crate::scenario::Scenario;

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', "").parse().ok(),
        _ => None,
    }
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Match an answer against option texts: exact, then case-insensitive, then
/// as a zero-based index.
fn match_option(options: &[String], raw: &Value) -> Option<String> {
    let text = match raw {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    if let Some(exact) = options.iter().find(|o| **o == text) {
        return Some(exact.clone());
    }
    if let Some(folded) = options.iter().find(|o| o.eq_ignore_ascii_case(&text)) {
        return Some(folded.clone());
    }
    text.parse::<usize>()
        .ok()
        .and_then(|i| options.get(i))
        .cloned()
}

fn option_listing(options: &[String]) -> String {
    options
        .iter()
        .enumerate()
        .map(|(i, o)| format!("{i}: {o}"))
        .collect::<Vec<_>>()
        .join("\n")
}

// ---- Free text ----

#[derive(Debug, Clone, PartialEq)]
pub struct FreeText {
    pub name: String,
    pub text: String,
}

impl FreeText {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }
}

impl Question for FreeText {
    fn name(&self) -> &str {
        &self.name
    }

    fn text(&self) -> &str {
        &self.text
    }

    fn kind(&self) -> &'static str {
        "free_text"
    }

    fn answer_instructions(&self) -> String {
        format!("Answer in your own words.\n{JSON_FORMAT_HINT}")
    }

    fn validate(&self, raw: &Answer) -> Result<Answer, ValidationError> {
        let text = match raw {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => return Err(ValidationError::new(&self.name, "expected a text answer")),
        };
        if text.is_empty() {
            return Err(ValidationError::new(&self.name, "answer is empty"));
        }
        Ok(Value::String(text))
    }

    fn simulate_answer(&self) -> Answer {
        Value::String("Lorem ipsum dolor sit amet.".to_string())
    }
}

// ---- Multiple choice ----

#[derive(Debug, Clone, PartialEq)]
pub struct MultipleChoice {
    pub name: String,
    pub text: String,
    pub options: Vec<String>,
}

impl MultipleChoice {
    pub fn new<S: Into<String>>(
        name: impl Into<String>,
        text: impl Into<String>,
        options: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
            options: options.into_iter().map(Into::into).collect(),
        }
    }

    pub fn yes_no(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(name, text, ["Yes", "No"])
    }
}

impl Question for MultipleChoice {
    fn name(&self) -> &str {
        &self.name
    }

    fn text(&self) -> &str {
        &self.text
    }

    fn kind(&self) -> &'static str {
        "multiple_choice"
    }

    fn answer_instructions(&self) -> String {
        format!(
            "Options:\n{}\nPick exactly one option and give its text as the answer.\n{JSON_FORMAT_HINT}",
            option_listing(&self.options)
        )
    }

    fn validate(&self, raw: &Answer) -> Result<Answer, ValidationError> {
        match_option(&self.options, raw)
            .map(Value::String)
            .ok_or_else(|| {
                ValidationError::new(
                    &self.name,
                    format!("{raw} is not one of {:?}", self.options),
                )
            })
    }

    fn simulate_answer(&self) -> Answer {
        self.options
            .first()
            .cloned()
            .map(Value::String)
            .unwrap_or(Value::Null)
    }
}

// ---- Numerical ----

#[derive(Debug, Clone, PartialEq)]
pub struct Numerical {
    pub name: String,
    pub text: String,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Numerical {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
            min: None,
            max: None,
        }
    }

    pub fn with_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }
}

impl Question for Numerical {
    fn name(&self) -> &str {
        &self.name
    }

    fn text(&self) -> &str {
        &self.text
    }

    fn kind(&self) -> &'static str {
        "numerical"
    }

    fn answer_instructions(&self) -> String {
        let mut bounds = String::new();
        if let Some(min) = self.min {
            bounds.push_str(&format!(" The minimum is {min}."));
        }
        if let Some(max) = self.max {
            bounds.push_str(&format!(" The maximum is {max}."));
        }
        format!("Answer with a single number.{bounds}\n{JSON_FORMAT_HINT}")
    }

    fn validate(&self, raw: &Answer) -> Result<Answer, ValidationError> {
        let n = numeric(raw)
            .filter(|n| n.is_finite())
            .ok_or_else(|| ValidationError::new(&self.name, format!("{raw} is not a number")))?;
        if self.min.is_some_and(|min| n < min) || self.max.is_some_and(|max| n > max) {
            return Err(ValidationError::new(
                &self.name,
                format!("{n} is outside [{:?}, {:?}]", self.min, self.max),
            ));
        }
        Ok(number_value(n))
    }

    fn simulate_answer(&self) -> Answer {
        number_value(self.min.or(self.max).unwrap_or(0.0))
    }
}

// ---- Checkbox ----

#[derive(Debug, Clone, PartialEq)]
pub struct Checkbox {
    pub name: String,
    pub text: String,
    pub options: Vec<String>,
    pub min_selections: Option<usize>,
    pub max_selections: Option<usize>,
}

impl Checkbox {
    pub fn new<S: Into<String>>(
        name: impl Into<String>,
        text: impl Into<String>,
        options: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
            options: options.into_iter().map(Into::into).collect(),
            min_selections: None,
            max_selections: None,
        }
    }

    pub fn with_selections(mut self, min: Option<usize>, max: Option<usize>) -> Self {
        self.min_selections = min;
        self.max_selections = max;
        self
    }
}

impl Question for Checkbox {
    fn name(&self) -> &str {
        &self.name
    }

    fn text(&self) -> &str {
        &self.text
    }

    fn kind(&self) -> &'static str {
        "checkbox"
    }

    fn answer_instructions(&self) -> String {
        format!(
            "Options:\n{}\nSelect all options that apply and give a JSON list of their texts as the answer.\n{JSON_FORMAT_HINT}",
            option_listing(&self.options)
        )
    }

    fn validate(&self, raw: &Answer) -> Result<Answer, ValidationError> {
        let items: Vec<Value> = match raw {
            Value::Array(items) => items.clone(),
            single @ (Value::String(_) | Value::Number(_)) => vec![single.clone()],
            _ => return Err(ValidationError::new(&self.name, "expected a list of options")),
        };

        let mut chosen: Vec<String> = Vec::with_capacity(items.len());
        for item in &items {
            let option = match_option(&self.options, item).ok_or_else(|| {
                ValidationError::new(&self.name, format!("{item} is not one of {:?}", self.options))
            })?;
            if !chosen.contains(&option) {
                chosen.push(option);
            }
        }

        if self.min_selections.is_some_and(|min| chosen.len() < min)
            || self.max_selections.is_some_and(|max| chosen.len() > max)
        {
            return Err(ValidationError::new(
                &self.name,
                format!(
                    "{} selections, expected between {:?} and {:?}",
                    chosen.len(),
                    self.min_selections,
                    self.max_selections
                ),
            ));
        }
        Ok(Value::Array(chosen.into_iter().map(Value::String).collect()))
    }

    fn simulate_answer(&self) -> Answer {
        let count = self.min_selections.unwrap_or(1).max(1).min(self.options.len());
        Value::Array(
            self.options[..count]
                .iter()
                .cloned()
                .map(Value::String)
                .collect(),
        )
    }
}

// ---- Linear scale ----

#[derive(Debug, Clone, PartialEq)]
pub struct LinearScale {
    pub name: String,
    pub text: String,
    pub options: Vec<i64>,
    pub labels: BTreeMap<i64, String>,
}

impl LinearScale {
    pub fn new(name: impl Into<String>, text: impl Into<String>, options: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
            options,
            labels: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, point: i64, label: impl Into<String>) -> Self {
        self.labels.insert(point, label.into());
        self
    }
}

impl Question for LinearScale {
    fn name(&self) -> &str {
        &self.name
    }

    fn text(&self) -> &str {
        &self.text
    }

    fn kind(&self) -> &'static str {
        "linear_scale"
    }

    fn answer_instructions(&self) -> String {
        let points = self
            .options
            .iter()
            .map(|p| match self.labels.get(p) {
                Some(label) => format!("{p} ({label})"),
                None => p.to_string(),
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("Answer with one point of the scale: {points}.\n{JSON_FORMAT_HINT}")
    }

    fn validate(&self, raw: &Answer) -> Result<Answer, ValidationError> {
        let by_label = match raw {
            Value::String(s) => self
                .labels
                .iter()
                .find(|(_, label)| label.eq_ignore_ascii_case(s.trim()))
                .map(|(point, _)| *point),
            _ => None,
        };
        let point = by_label
            .or_else(|| numeric(raw).filter(|n| n.fract() == 0.0).map(|n| n as i64))
            .filter(|p| self.options.contains(p))
            .ok_or_else(|| {
                ValidationError::new(&self.name, format!("{raw} is not a point in {:?}", self.options))
            })?;
        Ok(Value::from(point))
    }

    fn simulate_answer(&self) -> Answer {
        self.options
            .first()
            .map(|p| Value::from(*p))
            .unwrap_or(Value::Null)
    }
}

// ---- Functional ----

type AnswerFn = dyn Fn(&Scenario, &Agent) -> Answer + Send + Sync;

/// Answered by a function of the scenario and agent. Never reaches a model.
#[derive(Clone)]
pub struct FunctionalQuestion {
    pub name: String,
    pub text: String,
    func: Arc<AnswerFn>,
}

impl FunctionalQuestion {
    pub fn new<F>(name: impl Into<String>, text: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Scenario, &Agent) -> Answer + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            text: text.into(),
            func: Arc::new(func),
        }
    }
}

impl fmt::Debug for FunctionalQuestion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionalQuestion")
            .field("name", &self.name)
            .field("text", &self.text)
            .finish_non_exhaustive()
    }
}

impl Question for FunctionalQuestion {
    fn name(&self) -> &str {
        &self.name
    }

    fn text(&self) -> &str {
        &self.text
    }

    fn kind(&self) -> &'static str {
        "functional"
    }

    fn answer_instructions(&self) -> String {
        String::new()
    }

    fn validate(&self, raw: &Answer) -> Result<Answer, ValidationError> {
        if raw.is_null() {
            return Err(ValidationError::new(&self.name, "function returned no answer"));
        }
        Ok(raw.clone())
    }

    fn simulate_answer(&self) -> Answer {
        Value::Null
    }

    fn is_functional(&self) -> bool {
        true
    }

    fn answer_functionally(&self, scenario: &Scenario, agent: &Agent) -> Option<Answer> {
        Some((self.func)(scenario, agent))
    }
}
