use super::Survey;
use crate::error::{Result, SurveyError};

/// Successor nodes of `index` when every rule might fire. `None` is the end.
fn successors(survey: &Survey, index: usize) -> Vec<Option<usize>> {
    let default = (index + 1 < survey.len()).then_some(index + 1);
    let mut next = vec![default];
    for rule in survey.rules_from(index) {
        if !next.contains(&rule.target_index) {
            next.push(rule.target_index);
        }
    }
    next
}

/// Can `question` be reached from the start without `target` being asked?
///
/// A target with a skip rule can be passed through unanswered; any other
/// visit to it blocks the path.
fn bypass_exists(survey: &Survey, question: usize, target: usize) -> bool {
    let target_skippable = survey.has_skip_rule(target);
    let mut seen = vec![false; survey.len()];
    let mut stack = vec![0usize];

    while let Some(node) = stack.pop() {
        if seen[node] {
            continue;
        }
        seen[node] = true;
        if node == question {
            return true;
        }
        if node == target && !target_skippable {
            continue;
        }
        for next in successors(survey, node).into_iter().flatten() {
            if !seen[next] {
                stack.push(next);
            }
        }
    }
    false
}

pub(super) fn check_memory_reachability(survey: &Survey) -> Result<()> {
    for (question, targets) in &survey.memory_plan().targets {
        let Some(q) = survey.index_of(question) else {
            return Err(SurveyError::UnknownQuestion {
                context: "memory plan".to_string(),
                name: question.clone(),
            });
        };
        for target in targets {
            let Some(t) = survey.index_of(target) else {
                return Err(SurveyError::UnknownQuestion {
                    context: format!("memory for {question}"),
                    name: target.clone(),
                });
            };
            if bypass_exists(survey, q, t) {
                return Err(SurveyError::MemoryTargetMayBeSkipped {
                    question: question.clone(),
                    target: target.clone(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::RuleTarget;
    use super::*;
    use crate::question::{FreeText, Question};
    use std::sync::Arc;

    fn survey(n: usize) -> Survey {
        Survey::new(
            (1..=n)
                .map(|i| Arc::new(FreeText::new(format!("q{i}"), "?")) as Arc<dyn Question>)
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_linear_survey_memory_is_valid() {
        let s = survey(3).add_targeted_memory("q3", "q1").unwrap();
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_jump_over_target_is_rejected() {
        let s = survey(4)
            .add_rule("q1", "q1 == 'skip'", RuleTarget::question("q3"))
            .unwrap()
            .add_targeted_memory("q4", "q2")
            .unwrap();
        assert_eq!(
            s.validate().unwrap_err(),
            SurveyError::MemoryTargetMayBeSkipped {
                question: "q4".into(),
                target: "q2".into()
            }
        );
    }

    #[test]
    fn test_jump_that_lands_after_question_is_fine() {
        // q1 -> q5 bypasses both q2 and q4, so q4 never runs without q2.
        let s = survey(5)
            .add_rule("q1", "q1 == 'x'", RuleTarget::question("q5"))
            .unwrap()
            .add_targeted_memory("q4", "q2")
            .unwrap();
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_skip_rule_on_target_is_rejected() {
        let s = survey(3)
            .add_skip_rule("q2", "q1 == 'x'")
            .unwrap()
            .add_targeted_memory("q3", "q2")
            .unwrap();
        assert!(matches!(
            s.validate(),
            Err(SurveyError::MemoryTargetMayBeSkipped { .. })
        ));
    }

    #[test]
    fn test_stop_rule_before_target_is_fine() {
        let s = survey(3)
            .add_stop_rule("q1", "q1 == 'done'")
            .unwrap()
            .add_targeted_memory("q3", "q2")
            .unwrap();
        assert!(s.validate().is_ok());
    }
}
