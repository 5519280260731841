//! Watcher intervention events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::section::SectionName;

/// Which detection rule fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Same step failed repeatedly with a matching error signature.
    RepeatedFailure,
    /// Execution drifted away from the stated objective.
    GoalDeviation,
    /// Consecutive tool calls returned empty output.
    EmptyResultStreak,
}

impl TriggerKind {
    pub fn as_str(&self) -> &str {
        match self {
            TriggerKind::RepeatedFailure => "repeated_failure",
            TriggerKind::GoalDeviation => "goal_deviation",
            TriggerKind::EmptyResultStreak => "empty_result_streak",
        }
    }
}

/// What the watcher wants the controller to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Replan,
    Rollback,
    Escalate,
}

impl RecommendedAction {
    /// Rank used when several rules fire in one cycle; the highest wins.
    pub fn severity(&self) -> u8 {
        match self {
            RecommendedAction::Replan => 1,
            RecommendedAction::Rollback => 2,
            RecommendedAction::Escalate => 3,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RecommendedAction::Replan => "replan",
            RecommendedAction::Rollback => "rollback",
            RecommendedAction::Escalate => "escalate",
        }
    }
}

impl std::fmt::Display for RecommendedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A section revision the watcher cites as proof.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub section: SectionName,
    pub revision: u64,
    pub detail: String,
}

impl Evidence {
    pub fn new(section: SectionName, revision: u64, detail: impl Into<String>) -> Self {
        Self {
            section,
            revision,
            detail: detail.into(),
        }
    }
}

/// One intervention emitted by the watcher monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherEvent {
    pub trigger: TriggerKind,
    pub action: RecommendedAction,
    pub evidence: Vec<Evidence>,
    pub detail: String,
    pub at: DateTime<Utc>,
}

impl WatcherEvent {
    pub fn new(
        trigger: TriggerKind,
        action: RecommendedAction,
        evidence: Vec<Evidence>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            trigger,
            action,
            evidence,
            detail: detail.into(),
            at: Utc::now(),
        }
    }

    /// One-line rendering for the audit section.
    pub fn audit_line(&self) -> String {
        let refs: Vec<String> = self
            .evidence
            .iter()
            .map(|e| format!("{}@r{}", e.section, e.revision))
            .collect();
        format!(
            "- [{}] {} -> {} ({}) {}",
            self.at.format("%Y-%m-%dT%H:%M:%SZ"),
            self.trigger.as_str(),
            self.action,
            refs.join(", "),
            self.detail
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(RecommendedAction::Escalate.severity() > RecommendedAction::Rollback.severity());
        assert!(RecommendedAction::Rollback.severity() > RecommendedAction::Replan.severity());
    }

    #[test]
    fn test_audit_line_cites_evidence() {
        let event = WatcherEvent::new(
            TriggerKind::RepeatedFailure,
            RecommendedAction::Rollback,
            vec![Evidence::new(SectionName::execution_log(), 12, "3 failures on step 2")],
            "same signature three times",
        );
        let line = event.audit_line();
        assert!(line.contains("repeated_failure"));
        assert!(line.contains("rollback"));
        assert!(line.contains("execution_log@r12"));
    }
}
