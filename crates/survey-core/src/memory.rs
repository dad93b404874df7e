//! Memory scoping: the prior answers a question is allowed to see.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::agent::Agent;
use crate::prompt::{render_template, PromptContext};
use crate::question::Answer;
use crate::scenario::Scenario;
use crate::survey::Survey;

/// One prior question and its answer, as shown to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub question: String,
    pub text: String,
    pub answer: Answer,
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryScope<'a> {
    survey: &'a Survey,
}

impl<'a> MemoryScope<'a> {
    pub fn new(survey: &'a Survey) -> Self {
        Self { survey }
    }

    /// Prior answers visible to `question`, in declaration order.
    ///
    /// Only questions in the memory plan that actually have an answer are
    /// returned. Question texts are rendered against the scenario and agent.
    pub fn context_for(
        &self,
        question: usize,
        answers: &HashMap<String, Answer>,
        scenario: &Scenario,
        agent: &Agent,
    ) -> Vec<MemoryItem> {
        let bare = PromptContext {
            scenario,
            agent,
            memory: &[],
        };
        self.survey
            .memory_candidates(question)
            .into_iter()
            .filter_map(|i| self.survey.question(i))
            .filter_map(|q| {
                let answer = answers.get(q.name())?;
                let text = render_template(q.text(), &bare).unwrap_or_else(|_| q.text().to_string());
                Some(MemoryItem {
                    question: q.name().to_string(),
                    text,
                    answer: answer.clone(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::question::{FreeText, Question};
    use serde_json::json;
    use std::sync::Arc;

    fn survey() -> Survey {
        let qs: Vec<Arc<dyn Question>> = vec![
            Arc::new(FreeText::new("q1", "What do you think of {{ scenario.topic }}?")),
            Arc::new(FreeText::new("q2", "Second?")),
            Arc::new(FreeText::new("q3", "Third?")),
        ];
        Survey::new(qs).unwrap()
    }

    fn answers() -> HashMap<String, Answer> {
        HashMap::from([
            ("q1".to_string(), json!("great")),
            ("q2".to_string(), json!("fine")),
        ])
    }

    #[test]
    fn test_empty_plan_sees_nothing() {
        let s = survey();
        let scope = MemoryScope::new(&s);
        let ctx = scope.context_for(2, &answers(), &Scenario::new(), &Agent::new("a"));
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_targeted_memory_renders_prior_text() {
        let s = survey().add_targeted_memory("q3", "q1").unwrap();
        let scope = MemoryScope::new(&s);
        let scenario = Scenario::new().with("topic", "tea");
        let ctx = scope.context_for(2, &answers(), &scenario, &Agent::new("a"));
        assert_eq!(
            ctx,
            vec![MemoryItem {
                question: "q1".into(),
                text: "What do you think of tea?".into(),
                answer: json!("great"),
            }]
        );
    }

    #[test]
    fn test_full_memory_omits_unanswered() {
        let s = survey().set_full_memory_mode();
        let scope = MemoryScope::new(&s);
        let only_q2 = HashMap::from([("q2".to_string(), json!("fine"))]);
        let ctx = scope.context_for(2, &only_q2, &Scenario::new(), &Agent::new("a"));
        assert_eq!(ctx.len(), 1);
        assert_eq!(ctx[0].question, "q2");
    }
}
