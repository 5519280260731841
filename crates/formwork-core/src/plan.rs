//! Live plan parsing and rendering
//!
//! The plan is stored as text in the shared document and re-read on
//! every execution-loop iteration, so replans take effect immediately.
//! Each numbered step carries a status marker, an optional bound
//! tool-call block (indented under the step) and an optional error
//! note from a failed attempt.
//!
//! ```text
//! Objective: find the population of Lisbon
//!
//! 1. [pending] Search for the latest census figure
//!    [TOOL_CALL]
//!    tool: web_search
//!    query: lisbon population census
//!    [/TOOL_CALL]
//! 2. [pending] State the figure with its source
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

const STEP_INDENT: &str = "   ";

static STEP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+)\.\s*(?:\[(pending|in_progress|done|skipped)\]\s*)?(.*)$")
        .expect("step regex")
});
static OBJECTIVE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Objective:\s*(.*)$").expect("objective regex"));

/// Lifecycle of one plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::Done => "done",
            StepStatus::Skipped => "skipped",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(StepStatus::Pending),
            "in_progress" => Some(StepStatus::InProgress),
            "done" => Some(StepStatus::Done),
            "skipped" => Some(StepStatus::Skipped),
            _ => None,
        }
    }
}

/// One step of the live plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// 1-based position in the plan.
    pub index: usize,
    pub description: String,
    pub status: StepStatus,
    /// Raw tool-call block bound to this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation: Option<String>,
    /// Error note from the last failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl PlanStep {
    pub fn new(index: usize, description: impl Into<String>) -> Self {
        Self {
            index,
            description: description.into(),
            status: StepStatus::Pending,
            invocation: None,
            note: None,
        }
    }

    pub fn with_invocation(mut self, invocation: impl Into<String>) -> Self {
        self.invocation = Some(invocation.into());
        self
    }
}

/// The parsed live plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub objective: String,
    pub steps: Vec<PlanStep>,
}

impl Plan {
    /// Parse plan text. Lenient: lines that fit no rule are ignored, a
    /// numbered line without a status marker is a pending step.
    pub fn parse(text: &str) -> Self {
        let mut plan = Plan::default();
        let mut current: Option<PlanStep> = None;
        let mut invocation_lines: Vec<String> = Vec::new();
        let mut in_invocation = false;

        for line in text.lines() {
            if let Some(caps) = OBJECTIVE_RE.captures(line) {
                plan.objective = caps[1].trim().to_string();
                continue;
            }
            let indented = line.starts_with(STEP_INDENT) || line.starts_with('\t');
            if !indented {
                if let Some(caps) = STEP_RE.captures(line) {
                    if let Some(step) = current.take() {
                        plan.push_parsed(step, &mut invocation_lines, &mut in_invocation);
                    }
                    let index: usize = caps[1].parse().unwrap_or(plan.steps.len() + 1);
                    let status = caps
                        .get(2)
                        .and_then(|m| StepStatus::parse(m.as_str()))
                        .unwrap_or_default();
                    let mut step = PlanStep::new(index, caps[3].trim());
                    step.status = status;
                    current = Some(step);
                    continue;
                }
                continue;
            }

            let Some(step) = current.as_mut() else {
                continue;
            };
            let body = line
                .strip_prefix(STEP_INDENT)
                .or_else(|| line.strip_prefix('\t'))
                .unwrap_or(line);
            if body.trim() == crate::protocol::TOOL_CALL_OPEN {
                in_invocation = true;
                invocation_lines.push(body.trim().to_string());
            } else if in_invocation {
                invocation_lines.push(body.to_string());
                if body.trim() == crate::protocol::TOOL_CALL_CLOSE {
                    in_invocation = false;
                }
            } else if let Some(note) = body.strip_prefix("note:") {
                step.note = Some(note.trim().to_string());
            }
        }
        if let Some(step) = current.take() {
            plan.push_parsed(step, &mut invocation_lines, &mut in_invocation);
        }
        plan
    }

    fn push_parsed(
        &mut self,
        mut step: PlanStep,
        invocation_lines: &mut Vec<String>,
        in_invocation: &mut bool,
    ) {
        if !invocation_lines.is_empty() {
            step.invocation = Some(invocation_lines.join("\n"));
            invocation_lines.clear();
        }
        *in_invocation = false;
        self.steps.push(step);
    }

    /// Render back to the stored text form. `parse` of the result
    /// yields an equal plan.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.objective.is_empty() {
            out.push_str(&format!("Objective: {}\n\n", self.objective));
        }
        for step in &self.steps {
            out.push_str(&format!(
                "{}. [{}] {}\n",
                step.index,
                step.status.as_str(),
                step.description
            ));
            if let Some(note) = &step.note {
                out.push_str(&format!("{}note: {}\n", STEP_INDENT, note));
            }
            if let Some(invocation) = &step.invocation {
                for line in invocation.lines() {
                    out.push_str(STEP_INDENT);
                    out.push_str(line);
                    out.push('\n');
                }
            }
        }
        out
    }

    /// First step still waiting to run, in plan order.
    pub fn first_pending(&self) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.status == StepStatus::Pending)
    }

    pub fn step_mut(&mut self, index: usize) -> Option<&mut PlanStep> {
        self.steps.iter_mut().find(|s| s.index == index)
    }

    pub fn set_status(&mut self, index: usize, status: StepStatus) -> bool {
        match self.step_mut(index) {
            Some(step) => {
                step.status = status;
                true
            }
            None => false,
        }
    }

    pub fn set_note(&mut self, index: usize, note: impl Into<String>) -> bool {
        match self.step_mut(index) {
            Some(step) => {
                step.note = Some(note.into());
                true
            }
            None => false,
        }
    }

    pub fn statuses(&self) -> Vec<StepStatus> {
        self.steps.iter().map(|s| s.status).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Objective: find the population of Lisbon\n\n1. [pending] Search for the latest census figure\n   [TOOL_CALL]\n   tool: web_search\n   query: lisbon population census\n   [/TOOL_CALL]\n2. [done] Decide which source to trust\n   note: municipal register preferred\n3. [pending] State the figure with its source\n";

    #[test]
    fn test_parse_sample() {
        let plan = Plan::parse(SAMPLE);
        assert_eq!(plan.objective, "find the population of Lisbon");
        assert_eq!(plan.steps.len(), 3);
        assert_eq!(plan.steps[0].status, StepStatus::Pending);
        assert!(plan.steps[0]
            .invocation
            .as_deref()
            .unwrap()
            .contains("tool: web_search"));
        assert_eq!(plan.steps[1].status, StepStatus::Done);
        assert_eq!(
            plan.steps[1].note.as_deref(),
            Some("municipal register preferred")
        );
        assert!(plan.steps[2].invocation.is_none());
    }

    #[test]
    fn test_first_pending_in_order() {
        let mut plan = Plan::parse(SAMPLE);
        assert_eq!(plan.first_pending().unwrap().index, 1);
        plan.set_status(1, StepStatus::Done);
        assert_eq!(plan.first_pending().unwrap().index, 3);
        plan.set_status(3, StepStatus::InProgress);
        assert!(plan.first_pending().is_none());
    }

    #[test]
    fn test_render_parse_round_trip() {
        let plan = Plan::parse(SAMPLE);
        let rendered = plan.render();
        let reparsed = Plan::parse(&rendered);
        assert_eq!(reparsed, plan);
    }

    #[test]
    fn test_unmarked_steps_default_to_pending() {
        let plan = Plan::parse("1. Look something up\n2. Write it down\n");
        assert_eq!(plan.steps.len(), 2);
        assert!(plan.steps.iter().all(|s| s.status == StepStatus::Pending));
    }

    #[test]
    fn test_note_survives_round_trip_after_update() {
        let mut plan = Plan::parse(SAMPLE);
        plan.set_note(1, "HTTP 503 from provider");
        plan.set_status(1, StepStatus::Pending);
        let reparsed = Plan::parse(&plan.render());
        assert_eq!(
            reparsed.steps[0].note.as_deref(),
            Some("HTTP 503 from provider")
        );
    }
}
