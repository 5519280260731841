//! Stage controller
//!
//! Drives the forward stage order ANALYSIS -> CANDIDATES -> SELECTION
//! -> (LIBRARY_UPGRADE) -> PLANNING -> EXECUTION, retrying failed
//! generations up to a bound and committing every stage output to the
//! shared document. Watcher interventions re-enter PLANNING; an
//! escalation or an exhausted plan ends the run in FAILED with the
//! last coherent document state attached.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use formwork_core::library::gate::{evaluate, parse_candidate, GateDecision, GatePolicy};
use formwork_core::registry::CapabilityRegistry;
use formwork_core::store::{DocumentStore, StoreError, StrategyLibrary};
use formwork_core::types::{
    Document, RecommendedAction, SectionName, StageId, WatcherEvent, WriterId,
};
use formwork_llm::{GenerationError, GenerationRequest, StageGenerator};

use crate::execution::{ExecutionLoop, LoopOutcome};
use crate::watcher::WatcherHandle;

const REPLAN_HINT: &str =
    "Revise the plan using the notes and execution log; keep steps already marked done.";
const ROLLBACK_HINT: &str =
    "The previous approach failed repeatedly. Discard the previous plan and plan a different approach.";

/// Infrastructure errors that end a run abnormally. Expected terminal
/// conditions (exhausted plan, escalation, generation giving up) are
/// reported through [`HaltReason`] instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("generation error: {0}")]
    Generation(#[from] GenerationError),
}

/// Controller state, the six stages plus the two terminals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlState {
    Analysis,
    Candidates,
    Selection,
    LibraryUpgrade,
    Planning,
    Execution,
    Done,
    Failed,
}

impl ControlState {
    pub fn as_str(&self) -> &str {
        match self {
            ControlState::Analysis => "analysis",
            ControlState::Candidates => "candidates",
            ControlState::Selection => "selection",
            ControlState::LibraryUpgrade => "library_upgrade",
            ControlState::Planning => "planning",
            ControlState::Execution => "execution",
            ControlState::Done => "done",
            ControlState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ControlState::Done | ControlState::Failed)
    }
}

/// Why the run stopped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HaltReason {
    Completed,
    /// A stage generation failed on every allowed attempt.
    GenerationFailed(String),
    /// Every step ran but no final-answer marker appeared, or the
    /// iteration bound was hit.
    PlanExhaustedWithoutAnswer(String),
    /// The watcher escalated; the evidence trail is attached.
    WatcherEscalation(WatcherEvent),
}

impl HaltReason {
    pub fn summary(&self) -> String {
        match self {
            HaltReason::Completed => "completed".to_string(),
            HaltReason::GenerationFailed(reason) => format!("generation failed: {}", reason),
            HaltReason::PlanExhaustedWithoutAnswer(reason) => reason.clone(),
            HaltReason::WatcherEscalation(event) => {
                format!("watcher escalation: {}", event.detail)
            }
        }
    }
}

/// Final state of one run, with the last coherent document attached.
/// A failed run reports what it has; it never fabricates an answer.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub state: ControlState,
    pub halt: HaltReason,
    pub document: Document,
}

impl RunReport {
    pub fn final_answer(&self) -> Option<&str> {
        self.document.content(&SectionName::final_answer())
    }
}

/// The stage state machine.
pub struct StageController {
    store: Arc<dyn DocumentStore>,
    generator: Arc<dyn StageGenerator>,
    library: Arc<dyn StrategyLibrary>,
    registry: Arc<CapabilityRegistry>,
    gate_policy: GatePolicy,
    generation_retries: u32,
    stage_timeout: Duration,
    executor: ExecutionLoop,
    /// New entries admitted this run, keyed by category (gate quota).
    session_new_counts: HashMap<char, usize>,
}

impl StageController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        generator: Arc<dyn StageGenerator>,
        library: Arc<dyn StrategyLibrary>,
        registry: Arc<CapabilityRegistry>,
        gate_policy: GatePolicy,
        generation_retries: u32,
        stage_timeout: Duration,
        max_iterations: u32,
    ) -> Self {
        let executor = ExecutionLoop::new(
            store.clone(),
            registry.clone(),
            generator.clone(),
            generation_retries,
            stage_timeout,
            max_iterations,
        );
        Self {
            store,
            generator,
            library,
            registry,
            gate_policy,
            generation_retries,
            stage_timeout,
            executor,
            session_new_counts: HashMap::new(),
        }
    }

    /// Run the pipeline to a terminal state.
    pub async fn run(&mut self, watcher: &mut WatcherHandle) -> Result<RunReport, PipelineError> {
        let mut state = ControlState::Analysis;
        let mut replan_hint: Option<&'static str> = None;

        loop {
            tracing::info!(state = state.as_str(), "entering stage");
            match state {
                ControlState::Analysis => {
                    let text = match self.generate(StageId::Analysis, None).await {
                        Ok(text) => text,
                        Err(e) => return self.fail(HaltReason::GenerationFailed(e.to_string())).await,
                    };
                    self.commit(&SectionName::analysis(), text, StageId::Analysis)
                        .await?;
                    state = ControlState::Candidates;
                }
                ControlState::Candidates => {
                    let catalogue = self.library.snapshot().await?.render();
                    let text = match self.generate(StageId::Candidates, Some(catalogue)).await {
                        Ok(text) => text,
                        Err(e) => return self.fail(HaltReason::GenerationFailed(e.to_string())).await,
                    };
                    self.commit(&SectionName::candidate_strategies(), text, StageId::Candidates)
                        .await?;
                    state = ControlState::Selection;
                }
                ControlState::Selection => {
                    let text = match self.generate(StageId::Selection, None).await {
                        Ok(text) => text,
                        Err(e) => return self.fail(HaltReason::GenerationFailed(e.to_string())).await,
                    };
                    let wants_upgrade = selection_requests_upgrade(&text);
                    self.commit(&SectionName::selected_strategy(), text, StageId::Selection)
                        .await?;
                    state = if wants_upgrade {
                        ControlState::LibraryUpgrade
                    } else {
                        ControlState::Planning
                    };
                }
                ControlState::LibraryUpgrade => {
                    let catalogue = self.library.snapshot().await?.render();
                    let text = match self.generate(StageId::LibraryUpgrade, Some(catalogue)).await {
                        Ok(text) => text,
                        Err(e) => return self.fail(HaltReason::GenerationFailed(e.to_string())).await,
                    };
                    let outcome = self.apply_gate(&text).await?;
                    self.commit(&SectionName::library_upgrade(), outcome, StageId::LibraryUpgrade)
                        .await?;
                    state = ControlState::Planning;
                }
                ControlState::Planning => {
                    let mut extra = self.registry.catalogue();
                    if let Some(hint) = replan_hint.take() {
                        extra.push('\n');
                        extra.push_str(hint);
                    }
                    let text = match self.generate(StageId::Planning, Some(extra)).await {
                        Ok(text) => text,
                        Err(e) => return self.fail(HaltReason::GenerationFailed(e.to_string())).await,
                    };
                    self.commit(&SectionName::plan(), text, StageId::Planning)
                        .await?;
                    state = ControlState::Execution;
                }
                ControlState::Execution => {
                    let outcome = match self.executor.run(watcher).await {
                        Ok(outcome) => outcome,
                        Err(PipelineError::Generation(e)) => {
                            return self.fail(HaltReason::GenerationFailed(e.to_string())).await
                        }
                        Err(e) => return Err(e),
                    };
                    match outcome {
                        LoopOutcome::Completed { .. } => {
                            let document = self.store.snapshot().await;
                            tracing::info!("pipeline completed");
                            return Ok(RunReport {
                                state: ControlState::Done,
                                halt: HaltReason::Completed,
                                document,
                            });
                        }
                        LoopOutcome::Exhausted { reason } => {
                            return self
                                .fail(HaltReason::PlanExhaustedWithoutAnswer(reason))
                                .await;
                        }
                        LoopOutcome::Intervened { event } => {
                            self.record_audit(&event).await?;
                            replan_hint = Some(match event.action {
                                RecommendedAction::Rollback => ROLLBACK_HINT,
                                _ => REPLAN_HINT,
                            });
                            state = ControlState::Planning;
                        }
                        LoopOutcome::Escalated { event } => {
                            self.record_audit(&event).await?;
                            return self.fail(HaltReason::WatcherEscalation(event)).await;
                        }
                    }
                }
                ControlState::Done | ControlState::Failed => {
                    unreachable!("terminal states return directly")
                }
            }
        }
    }

    async fn generate(
        &self,
        stage: StageId,
        extra: Option<String>,
    ) -> Result<String, GenerationError> {
        let snapshot = self.store.snapshot().await;
        let mut request = GenerationRequest::new(stage, snapshot);
        if let Some(extra) = extra {
            request = request.with_extra_context(extra);
        }
        generate_with_retries(
            self.generator.as_ref(),
            request,
            self.generation_retries,
            self.stage_timeout,
        )
        .await
    }

    async fn commit(
        &self,
        section: &SectionName,
        content: String,
        stage: StageId,
    ) -> Result<u64, PipelineError> {
        commit_section(self.store.as_ref(), section, content, WriterId::from(stage)).await
    }

    /// Evaluate the upgrade candidate and apply the decision. Returns
    /// the text recorded in the library-upgrade section.
    async fn apply_gate(&mut self, text: &str) -> Result<String, PipelineError> {
        let Some(candidate) = parse_candidate(text) else {
            return Ok("DECISION: skip (no applicable upgrade proposed)".to_string());
        };
        let catalog = self.library.snapshot().await?;
        let decision = evaluate(&candidate, &catalog, &self.session_new_counts, &self.gate_policy);
        tracing::info!(decision = decision.as_str(), "strategy gate decision");
        match decision {
            GateDecision::Admit { draft } => {
                let category = draft.category;
                let entry = self.library.admit(draft).await?;
                *self.session_new_counts.entry(category).or_insert(0) += 1;
                Ok(format!("DECISION: admit {} '{}'", entry.id, entry.title))
            }
            GateDecision::Enhance { target, note } => {
                self.library.enhance(&target, note.clone()).await?;
                Ok(format!("DECISION: enhance {} ({})", target, note))
            }
            GateDecision::Skip { reason } => Ok(format!("DECISION: skip ({})", reason)),
        }
    }

    async fn record_audit(&self, event: &WatcherEvent) -> Result<(), PipelineError> {
        let line = event.audit_line();
        let content = match self.store.read(&SectionName::watcher_audit()).await {
            Ok(section) => format!("{}\n{}", section.content.trim_end(), line),
            Err(StoreError::NotFound(_)) => line,
            Err(e) => return Err(e.into()),
        };
        commit_section(
            self.store.as_ref(),
            &SectionName::watcher_audit(),
            content,
            WriterId::watcher(),
        )
        .await?;
        Ok(())
    }

    async fn fail(&self, halt: HaltReason) -> Result<RunReport, PipelineError> {
        let document = self.store.snapshot().await;
        tracing::warn!(reason = %halt.summary(), "pipeline failed");
        Ok(RunReport {
            state: ControlState::Failed,
            halt,
            document,
        })
    }
}

/// A selection that produced a novel or merged strategy opens the
/// library-upgrade stage.
fn selection_requests_upgrade(text: &str) -> bool {
    text.lines()
        .find_map(|line| line.trim().strip_prefix("SOURCE:"))
        .map(|value| matches!(value.trim().to_lowercase().as_str(), "novel" | "merged"))
        .unwrap_or(false)
}

/// Retry a stage generation up to `retries` attempts, treating empty
/// output like a failure. Each attempt is bounded by `timeout`.
pub(crate) async fn generate_with_retries(
    generator: &dyn StageGenerator,
    request: GenerationRequest,
    retries: u32,
    timeout: Duration,
) -> Result<String, GenerationError> {
    let mut last_error: Option<GenerationError> = None;
    for attempt in 1..=retries.max(1) {
        match tokio::time::timeout(timeout, generator.generate(request.clone())).await {
            Ok(Ok(text)) if !text.trim().is_empty() => return Ok(text),
            Ok(Ok(_)) => {
                tracing::warn!(stage = %request.stage, attempt, "empty stage output");
                last_error = Some(GenerationError::Response("empty stage output".to_string()));
            }
            Ok(Err(e)) => {
                tracing::warn!(stage = %request.stage, attempt, error = %e, "stage generation failed");
                last_error = Some(e);
            }
            Err(_) => {
                tracing::warn!(stage = %request.stage, attempt, "stage generation timed out");
                last_error = Some(GenerationError::Http(format!(
                    "stage generation timed out after {:?}",
                    timeout
                )));
            }
        }
    }
    Err(last_error
        .unwrap_or_else(|| GenerationError::Response("no generation attempts made".to_string())))
}

/// Revise a section with stale-write recovery: re-read the current
/// revision and retry until the write lands.
pub(crate) async fn commit_section(
    store: &dyn DocumentStore,
    section: &SectionName,
    content: String,
    writer: WriterId,
) -> Result<u64, PipelineError> {
    loop {
        let expected = match store.read(section).await {
            Ok(current) => Some(current.revision),
            Err(StoreError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };
        match store
            .revise(section, content.clone(), writer.clone(), expected)
            .await
        {
            Ok(revision) => return Ok(revision),
            Err(e) if e.is_stale_write() => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use formwork_stores::InMemoryDocumentStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyGenerator {
        fail_first: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl StageGenerator for FlakyGenerator {
        async fn generate(&self, _: GenerationRequest) -> Result<String, GenerationError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err(GenerationError::Http("connection reset".to_string()))
            } else {
                Ok("recovered output".to_string())
            }
        }
    }

    #[test]
    fn test_generate_with_retries_recovers() {
        tokio_test::block_on(async {
            let generator = FlakyGenerator {
                fail_first: 2,
                calls: AtomicU32::new(0),
            };
            let request = GenerationRequest::new(StageId::Analysis, Document::new());
            let text =
                generate_with_retries(&generator, request, 3, Duration::from_secs(5)).await;
            assert_eq!(text.unwrap(), "recovered output");
        });
    }

    #[test]
    fn test_generate_with_retries_gives_up() {
        tokio_test::block_on(async {
            let generator = FlakyGenerator {
                fail_first: 10,
                calls: AtomicU32::new(0),
            };
            let request = GenerationRequest::new(StageId::Analysis, Document::new());
            let result =
                generate_with_retries(&generator, request, 3, Duration::from_secs(5)).await;
            assert!(result.is_err());
            assert_eq!(generator.calls.load(Ordering::SeqCst), 3);
        });
    }

    #[test]
    fn test_selection_upgrade_marker() {
        assert!(selection_requests_upgrade("SOURCE: novel\nrest of it"));
        assert!(selection_requests_upgrade("preface\nSOURCE: merged"));
        assert!(!selection_requests_upgrade("SOURCE: library"));
        assert!(!selection_requests_upgrade("no marker at all"));
    }

    #[test]
    fn test_commit_section_creates_then_updates() {
        tokio_test::block_on(async {
            let store = InMemoryDocumentStore::default();
            let r1 = commit_section(
                &store,
                &SectionName::analysis(),
                "first".to_string(),
                WriterId::new("analysis"),
            )
            .await
            .unwrap();
            let r2 = commit_section(
                &store,
                &SectionName::analysis(),
                "second".to_string(),
                WriterId::new("analysis"),
            )
            .await
            .unwrap();
            assert!(r2 > r1);
            assert_eq!(
                store.read(&SectionName::analysis()).await.unwrap().content,
                "second"
            );
        });
    }
}
