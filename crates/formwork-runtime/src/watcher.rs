//! Watcher monitor
//!
//! A spawned task subscribed to the revision bus. On every revision of
//! the plan, execution-log or final-answer sections it takes a
//! document snapshot, runs the detection rules and emits at most one
//! intervention event, the most severe that fired. The execution loop
//! synchronizes on the watch channel before each iteration, so an
//! intervention is always seen before the next step runs.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};

use formwork_core::protocol::parse_result_blocks;
use formwork_core::store::{DocumentStore, RevisionEvent};
use formwork_core::types::{
    Document, Evidence, RecommendedAction, SectionName, ToolCallStatus, TriggerKind, WatcherEvent,
};

/// Detection thresholds.
#[derive(Debug, Clone)]
pub struct WatcherRules {
    /// Consecutive matching failures on one step before rollback.
    pub repeated_failure_threshold: usize,
    /// Consecutive empty tool outputs before replan.
    pub empty_streak_threshold: usize,
}

impl Default for WatcherRules {
    fn default() -> Self {
        Self {
            repeated_failure_threshold: 3,
            empty_streak_threshold: 2,
        }
    }
}

/// Decides whether a stated conclusion still serves the objective.
pub trait GoalComparator: Send + Sync {
    fn deviates(&self, objective: &str, conclusion: &str) -> bool;
}

/// Token-overlap comparator: deviation when the conclusion shares
/// almost no vocabulary with the objective. A model-backed comparator
/// can replace this without touching the watcher.
#[derive(Debug, Clone)]
pub struct LexicalOverlapComparator {
    pub min_overlap: f64,
}

impl Default for LexicalOverlapComparator {
    fn default() -> Self {
        Self { min_overlap: 0.1 }
    }
}

impl GoalComparator for LexicalOverlapComparator {
    fn deviates(&self, objective: &str, conclusion: &str) -> bool {
        let objective_tokens = tokens(objective);
        let conclusion_tokens = tokens(conclusion);
        if objective_tokens.is_empty() || conclusion_tokens.is_empty() {
            return false;
        }
        let shared = objective_tokens.intersection(&conclusion_tokens).count();
        let base = objective_tokens.len().min(conclusion_tokens.len());
        (shared as f64 / base as f64) < self.min_overlap
    }
}

fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(|w| w.to_lowercase())
        .collect()
}

impl WatcherRules {
    /// Run all detectors over a snapshot. Returns the most severe
    /// finding, or nothing. Pure; the monitor task wraps this.
    pub fn evaluate(
        &self,
        document: &Document,
        comparator: &dyn GoalComparator,
    ) -> Option<WatcherEvent> {
        let mut findings: Vec<WatcherEvent> = Vec::new();

        if let Some(event) = self.check_goal_deviation(document, comparator) {
            findings.push(event);
        }
        if let Some(event) = self.check_repeated_failure(document) {
            findings.push(event);
        }
        if let Some(event) = self.check_empty_streak(document) {
            findings.push(event);
        }

        findings
            .into_iter()
            .max_by_key(|e| e.action.severity())
    }

    fn check_goal_deviation(
        &self,
        document: &Document,
        comparator: &dyn GoalComparator,
    ) -> Option<WatcherEvent> {
        let objective = document.section(&SectionName::objective())?;
        let answer = document.section(&SectionName::final_answer())?;
        if answer.is_empty() || !comparator.deviates(&objective.content, &answer.content) {
            return None;
        }
        let mut evidence = vec![Evidence::new(
            SectionName::objective(),
            objective.revision,
            "stated objective",
        )];
        // The analysis section is the run's own reading of the objective;
        // cite it so the escalation shows where the drift began.
        if let Some(analysis) = document.section(&SectionName::analysis()) {
            evidence.push(Evidence::new(
                SectionName::analysis(),
                analysis.revision,
                "analysis of the objective",
            ));
        }
        evidence.push(Evidence::new(
            SectionName::final_answer(),
            answer.revision,
            "deviating conclusion",
        ));
        Some(WatcherEvent::new(
            TriggerKind::GoalDeviation,
            RecommendedAction::Escalate,
            evidence,
            "conclusion does not address the stated objective",
        ))
    }

    fn check_repeated_failure(&self, document: &Document) -> Option<WatcherEvent> {
        let log = document.section(&SectionName::execution_log())?;
        let entries = parse_result_blocks(&log.content);
        let last = entries.last()?;
        if !matches!(last.status, ToolCallStatus::ToolError | ToolCallStatus::Timeout) {
            return None;
        }
        let signature = last.error_signature();
        let run = entries
            .iter()
            .rev()
            .take_while(|e| {
                e.step == last.step
                    && matches!(e.status, ToolCallStatus::ToolError | ToolCallStatus::Timeout)
                    && e.error_signature() == signature
            })
            .count();
        if run < self.repeated_failure_threshold {
            return None;
        }
        Some(WatcherEvent::new(
            TriggerKind::RepeatedFailure,
            RecommendedAction::Rollback,
            vec![Evidence::new(
                SectionName::execution_log(),
                log.revision,
                format!(
                    "{} consecutive failures on step {} with signature '{}'",
                    run, last.step, signature
                ),
            )],
            "the current approach to this step keeps failing the same way",
        ))
    }

    fn check_empty_streak(&self, document: &Document) -> Option<WatcherEvent> {
        let log = document.section(&SectionName::execution_log())?;
        let entries = parse_result_blocks(&log.content);
        if entries.len() < self.empty_streak_threshold {
            return None;
        }
        let streak = entries
            .iter()
            .rev()
            .take_while(|e| e.output.trim().is_empty())
            .count();
        if streak < self.empty_streak_threshold {
            return None;
        }
        Some(WatcherEvent::new(
            TriggerKind::EmptyResultStreak,
            RecommendedAction::Replan,
            vec![Evidence::new(
                SectionName::execution_log(),
                log.revision,
                format!("last {} tool outputs were empty", streak),
            )],
            "recent tool calls are producing nothing usable",
        ))
    }
}

/// Loop-side handle: pending interventions plus the synchronization
/// point guaranteeing the watcher has caught up with a given revision.
pub struct WatcherHandle {
    events: mpsc::UnboundedReceiver<WatcherEvent>,
    seen: watch::Receiver<u64>,
    // Keeps the watch alive for the disabled handle.
    _keepalive: Option<watch::Sender<u64>>,
}

impl WatcherHandle {
    /// Handle that never intervenes and never blocks.
    pub fn disabled() -> Self {
        let (_tx, events) = mpsc::unbounded_channel();
        let (keepalive, seen) = watch::channel(u64::MAX);
        Self {
            events,
            seen,
            _keepalive: Some(keepalive),
        }
    }

    /// Wait until the watcher has processed `revision`.
    pub async fn sync(&mut self, revision: u64) {
        // An error means the monitor is gone; nothing left to wait for.
        let _ = self.seen.wait_for(|r| *r >= revision).await;
    }

    /// Drain pending interventions and return the most severe.
    pub fn poll(&mut self) -> Option<WatcherEvent> {
        let mut best: Option<WatcherEvent> = None;
        while let Ok(event) = self.events.try_recv() {
            let better = best
                .as_ref()
                .map(|b| event.action.severity() > b.action.severity())
                .unwrap_or(true);
            if better {
                best = Some(event);
            }
        }
        best
    }
}

/// The spawned monitor task.
pub struct WatcherMonitor;

impl WatcherMonitor {
    pub fn spawn(
        store: Arc<dyn DocumentStore>,
        mut receiver: broadcast::Receiver<RevisionEvent>,
        rules: WatcherRules,
        comparator: Arc<dyn GoalComparator>,
    ) -> WatcherHandle {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (seen_tx, seen) = watch::channel(0u64);

        tokio::spawn(async move {
            // Suppresses refiring the same trigger until the log grows.
            let mut last_fired: Option<(TriggerKind, usize)> = None;
            loop {
                let event = match receiver.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "watcher lagged behind the revision bus");
                        let _ = seen_tx.send(store.max_revision().await);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                if is_watched(&event.section) {
                    let document = store.snapshot().await;
                    let log_len = document
                        .content(&SectionName::execution_log())
                        .map(|log| parse_result_blocks(log).len())
                        .unwrap_or(0);
                    if let Some(finding) = rules.evaluate(&document, comparator.as_ref()) {
                        let repeat = last_fired == Some((finding.trigger, log_len));
                        if !repeat {
                            tracing::info!(
                                trigger = finding.trigger.as_str(),
                                action = %finding.action,
                                revision = event.revision,
                                "watcher intervention"
                            );
                            last_fired = Some((finding.trigger, log_len));
                            if events_tx.send(finding).is_err() {
                                break;
                            }
                        }
                    }
                }
                let _ = seen_tx.send(event.revision);
            }
        });

        WatcherHandle {
            events,
            seen,
            _keepalive: None,
        }
    }
}

fn is_watched(section: &SectionName) -> bool {
    *section == SectionName::plan()
        || *section == SectionName::execution_log()
        || *section == SectionName::final_answer()
}

#[cfg(test)]
mod tests {
    use super::*;
    use formwork_core::protocol::render_result;
    use formwork_core::types::{ToolCallRequest, ToolCallResult, WriterId};

    struct NeverDeviates;

    impl GoalComparator for NeverDeviates {
        fn deviates(&self, _: &str, _: &str) -> bool {
            false
        }
    }

    fn result(status: ToolCallStatus, output: &str) -> ToolCallResult {
        ToolCallResult::new(ToolCallRequest::new("web_search"), status, output, 5)
    }

    fn document_with_log(entries: &[(usize, ToolCallStatus, &str)]) -> Document {
        let mut document = Document::new();
        document.apply_revision(
            SectionName::objective(),
            "find the lisbon census figure",
            WriterId::intake(),
            1,
        );
        let log: Vec<String> = entries
            .iter()
            .map(|(step, status, output)| render_result(*step, &result(*status, output)))
            .collect();
        document.apply_revision(
            SectionName::execution_log(),
            log.join("\n\n"),
            WriterId::new("execution"),
            2,
        );
        document
    }

    #[test]
    fn test_repeated_failure_fires_exactly_at_threshold() {
        let rules = WatcherRules::default();
        let two = document_with_log(&[
            (2, ToolCallStatus::ToolError, "HTTP 503"),
            (2, ToolCallStatus::ToolError, "HTTP 503"),
        ]);
        assert!(rules.evaluate(&two, &NeverDeviates).is_none());

        let three = document_with_log(&[
            (2, ToolCallStatus::ToolError, "HTTP 503"),
            (2, ToolCallStatus::Timeout, "HTTP 503"),
            (2, ToolCallStatus::ToolError, "HTTP 503"),
        ]);
        let event = rules.evaluate(&three, &NeverDeviates).unwrap();
        assert_eq!(event.trigger, TriggerKind::RepeatedFailure);
        assert_eq!(event.action, RecommendedAction::Rollback);
    }

    #[test]
    fn test_repeated_failure_requires_matching_signature_and_step() {
        let rules = WatcherRules::default();
        let mixed_signature = document_with_log(&[
            (2, ToolCallStatus::ToolError, "HTTP 503"),
            (2, ToolCallStatus::ToolError, "HTTP 404"),
            (2, ToolCallStatus::ToolError, "HTTP 503"),
        ]);
        assert!(rules.evaluate(&mixed_signature, &NeverDeviates).is_none());

        let mixed_step = document_with_log(&[
            (1, ToolCallStatus::ToolError, "HTTP 503"),
            (2, ToolCallStatus::ToolError, "HTTP 503"),
            (2, ToolCallStatus::ToolError, "HTTP 503"),
        ]);
        assert!(rules.evaluate(&mixed_step, &NeverDeviates).is_none());
    }

    #[test]
    fn test_empty_streak_fires_at_two() {
        let rules = WatcherRules::default();
        let one = document_with_log(&[
            (1, ToolCallStatus::Ok, "some text"),
            (2, ToolCallStatus::Ok, ""),
        ]);
        assert!(rules.evaluate(&one, &NeverDeviates).is_none());

        let two = document_with_log(&[
            (1, ToolCallStatus::Ok, ""),
            (2, ToolCallStatus::Ok, ""),
        ]);
        let event = rules.evaluate(&two, &NeverDeviates).unwrap();
        assert_eq!(event.trigger, TriggerKind::EmptyResultStreak);
        assert_eq!(event.action, RecommendedAction::Replan);
    }

    #[test]
    fn test_most_severe_finding_wins() {
        // Three matching empty failures trip both rules; rollback outranks replan.
        let rules = WatcherRules::default();
        let document = document_with_log(&[
            (2, ToolCallStatus::ToolError, ""),
            (2, ToolCallStatus::ToolError, ""),
            (2, ToolCallStatus::ToolError, ""),
        ]);
        let event = rules.evaluate(&document, &NeverDeviates).unwrap();
        assert_eq!(event.action, RecommendedAction::Rollback);
    }

    #[test]
    fn test_goal_deviation_escalates_with_evidence() {
        struct AlwaysDeviates;
        impl GoalComparator for AlwaysDeviates {
            fn deviates(&self, _: &str, _: &str) -> bool {
                true
            }
        }

        let mut document = document_with_log(&[(1, ToolCallStatus::Ok, "fine")]);
        document.apply_revision(
            SectionName::final_answer(),
            "the weather is nice",
            WriterId::new("execution"),
            3,
        );
        document.apply_revision(
            SectionName::analysis(),
            "the objective needs one census lookup",
            WriterId::new("analysis"),
            4,
        );
        let event = WatcherRules::default()
            .evaluate(&document, &AlwaysDeviates)
            .unwrap();
        assert_eq!(event.trigger, TriggerKind::GoalDeviation);
        assert_eq!(event.action, RecommendedAction::Escalate);
        assert!(event
            .evidence
            .iter()
            .any(|e| e.section == SectionName::final_answer() && e.revision == 3));
        assert!(event
            .evidence
            .iter()
            .any(|e| e.section == SectionName::analysis() && e.revision == 4));
    }

    #[test]
    fn test_goal_deviation_without_analysis_still_fires() {
        struct AlwaysDeviates;
        impl GoalComparator for AlwaysDeviates {
            fn deviates(&self, _: &str, _: &str) -> bool {
                true
            }
        }

        let mut document = document_with_log(&[(1, ToolCallStatus::Ok, "fine")]);
        document.apply_revision(
            SectionName::final_answer(),
            "the weather is nice",
            WriterId::new("execution"),
            3,
        );
        let event = WatcherRules::default()
            .evaluate(&document, &AlwaysDeviates)
            .unwrap();
        assert_eq!(event.trigger, TriggerKind::GoalDeviation);
        assert!(event
            .evidence
            .iter()
            .all(|e| e.section != SectionName::analysis()));
    }

    #[test]
    fn test_lexical_comparator() {
        let comparator = LexicalOverlapComparator::default();
        assert!(!comparator.deviates(
            "find the population of lisbon",
            "Final population figure for Lisbon is 545,923"
        ));
        assert!(comparator.deviates(
            "find the population of lisbon",
            "quarterly revenue grew nine percent"
        ));
    }

    #[test]
    fn test_disabled_handle_never_blocks() {
        tokio_test::block_on(async {
            let mut handle = WatcherHandle::disabled();
            handle.sync(1_000_000).await;
            assert!(handle.poll().is_none());
        });
    }
}
