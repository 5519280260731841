//! Pipeline stage identifiers
//!
//! A stage names both a generation scope (what kind of output the text
//! model is asked for) and the writer recorded on the sections it
//! revises.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The generative stages of the pipeline, in forward order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    /// Decompose the objective.
    Analysis,
    /// Draft candidate strategies against the library catalogue.
    Candidates,
    /// Pick or merge one strategy.
    Selection,
    /// Propose a library upgrade for a novel or merged strategy.
    LibraryUpgrade,
    /// Produce the live plan.
    Planning,
    /// Drive the tool loop and produce the final answer.
    Execution,
}

impl StageId {
    pub fn as_str(&self) -> &str {
        match self {
            StageId::Analysis => "analysis",
            StageId::Candidates => "candidates",
            StageId::Selection => "selection",
            StageId::LibraryUpgrade => "library_upgrade",
            StageId::Planning => "planning",
            StageId::Execution => "execution",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_serde_uses_snake_case() {
        let json = serde_json::to_string(&StageId::LibraryUpgrade).unwrap();
        assert_eq!(json, "\"library_upgrade\"");
        let back: StageId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, StageId::LibraryUpgrade);
    }
}
