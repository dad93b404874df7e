use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Survey-wide default for which earlier answers a question sees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryMode {
    /// Each question sees only its explicit targets.
    #[default]
    None,
    /// Every earlier question.
    Full,
    /// The `k` questions declared immediately before.
    Lagged(usize),
}

/// Per-question visibility of prior answers.
///
/// Explicit targets are checked against every survey path at job
/// construction. Full and lagged modes expose whatever prior answers exist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryPlan {
    #[serde(default)]
    pub mode: MemoryMode,
    /// Question name to explicitly remembered question names.
    #[serde(default)]
    pub targets: BTreeMap<String, Vec<String>>,
}

impl MemoryPlan {
    pub fn is_empty(&self) -> bool {
        self.mode == MemoryMode::None && self.targets.values().all(Vec::is_empty)
    }

    pub fn explicit_targets(&self, question: &str) -> &[String] {
        self.targets.get(question).map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn add_target(&mut self, question: &str, target: &str) {
        let entry = self.targets.entry(question.to_string()).or_default();
        if !entry.iter().any(|t| t == target) {
            entry.push(target.to_string());
        }
    }
}
