//! Execution loop
//!
//! Runs the live plan: one tool call in flight at a time, the plan
//! re-read from the store on every iteration so replans take effect
//! immediately. Every dispatched result is appended to the execution
//! log in full, successes mark their step done, failures return it to
//! pending with a note. When no pending steps remain, one finalization
//! generation is asked for the final answer.

use std::sync::Arc;
use std::time::Duration;

use formwork_core::dispatch::Dispatcher;
use formwork_core::plan::{Plan, StepStatus};
use formwork_core::protocol::{
    final_answer, parse_stage_output, render_result, CodecError, Directive,
};
use formwork_core::registry::CapabilityRegistry;
use formwork_core::store::{DocumentStore, StoreError};
use formwork_core::types::{
    RecommendedAction, SectionName, StageId, ToolCallRequest, ToolCallResult, ToolCallStatus,
    WatcherEvent, WriterId,
};
use formwork_llm::{GenerationRequest, StageGenerator};

use crate::controller::{commit_section, generate_with_retries, PipelineError};
use crate::watcher::WatcherHandle;

const FINALIZE_NUDGE: &str =
    "All plan steps are complete. Reply with 'Final Answer:' followed by the answer.";

/// How one loop run ended.
#[derive(Debug)]
pub enum LoopOutcome {
    /// The final answer was produced and committed.
    Completed { answer: String },
    /// No pending steps and no final answer, or the iteration bound hit.
    Exhausted { reason: String },
    /// The watcher asked for a replan or rollback.
    Intervened { event: WatcherEvent },
    /// The watcher escalated; the run must fail.
    Escalated { event: WatcherEvent },
}

/// The plan executor.
pub struct ExecutionLoop {
    store: Arc<dyn DocumentStore>,
    registry: Arc<CapabilityRegistry>,
    generator: Arc<dyn StageGenerator>,
    dispatcher: Dispatcher,
    generation_retries: u32,
    stage_timeout: Duration,
    max_iterations: u32,
}

impl ExecutionLoop {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        registry: Arc<CapabilityRegistry>,
        generator: Arc<dyn StageGenerator>,
        generation_retries: u32,
        stage_timeout: Duration,
        max_iterations: u32,
    ) -> Self {
        Self {
            store,
            registry,
            generator,
            dispatcher: Dispatcher::new(),
            generation_retries,
            stage_timeout,
            max_iterations,
        }
    }

    fn writer(&self) -> WriterId {
        WriterId::from(StageId::Execution)
    }

    /// Run until the plan completes, exhausts, or the watcher intervenes.
    pub async fn run(&self, watcher: &mut WatcherHandle) -> Result<LoopOutcome, PipelineError> {
        let mut last_write = self.store.max_revision().await;

        for iteration in 1..=self.max_iterations {
            // Interventions are honored before anything else happens.
            watcher.sync(last_write).await;
            if let Some(event) = watcher.poll() {
                return Ok(intervention_outcome(event));
            }

            let plan_section = self.store.read(&SectionName::plan()).await?;
            let mut plan = Plan::parse(&plan_section.content);
            let Some(step) = plan.first_pending().cloned() else {
                return self.finalize(watcher).await;
            };

            tracing::info!(iteration, step = step.index, "executing plan step");
            plan.set_status(step.index, StepStatus::InProgress);
            last_write = self
                .write_plan(&plan, Some(plan_section.revision))
                .await?;

            let decoded = match step.invocation.as_deref() {
                Some(text) => parse_stage_output(text, &self.registry).and_then(|outcome| {
                    for warning in &outcome.warnings {
                        tracing::warn!(step = step.index, warning = %warning, "tool call warning");
                    }
                    match outcome.directive {
                        Some(Directive::ToolCall(request)) => Ok(request),
                        _ => Err(CodecError::MalformedToolCall(
                            "step invocation holds no tool call".to_string(),
                        )),
                    }
                }),
                None => Err(CodecError::MalformedToolCall(
                    "step has no bound tool call".to_string(),
                )),
            };

            match decoded {
                Ok(request) => {
                    let result = self.dispatcher.dispatch(&self.registry, &request).await;
                    last_write = self.append_log(step.index, &result).await?;
                    let succeeded = result.status == ToolCallStatus::Ok;
                    let note = (!succeeded).then(|| result.error_signature());
                    last_write = self.update_step(step.index, succeeded, note).await?;
                }
                Err(error) => {
                    tracing::warn!(step = step.index, error = %error, "rejecting step invocation");
                    let tool_id = match &error {
                        CodecError::ToolNotFound(id) => id.clone(),
                        CodecError::MalformedToolCall(_) => "unknown".to_string(),
                    };
                    let result = ToolCallResult::new(
                        ToolCallRequest::new(tool_id),
                        ToolCallStatus::Rejected,
                        error.to_string(),
                        0,
                    );
                    last_write = self.append_log(step.index, &result).await?;
                    last_write = self
                        .update_step(step.index, false, Some(error.to_string()))
                        .await?;
                }
            }
        }

        Ok(LoopOutcome::Exhausted {
            reason: format!("no completed plan after {} iterations", self.max_iterations),
        })
    }

    /// No pending steps: ask for the final answer once and check the
    /// marker. The watcher gets a last look before completion so a
    /// deviating conclusion still escalates.
    async fn finalize(&self, watcher: &mut WatcherHandle) -> Result<LoopOutcome, PipelineError> {
        let snapshot = self.store.snapshot().await;
        let request = GenerationRequest::new(StageId::Execution, snapshot)
            .with_extra_context(FINALIZE_NUDGE);
        let text = generate_with_retries(
            self.generator.as_ref(),
            request,
            self.generation_retries,
            self.stage_timeout,
        )
        .await?;

        let Some(answer) = final_answer(&text) else {
            return Ok(LoopOutcome::Exhausted {
                reason: "plan exhausted without a final answer".to_string(),
            });
        };

        let revision = commit_section(
            self.store.as_ref(),
            &SectionName::final_answer(),
            answer.clone(),
            self.writer(),
        )
        .await?;
        watcher.sync(revision).await;
        if let Some(event) = watcher.poll() {
            if event.action == RecommendedAction::Escalate {
                return Ok(LoopOutcome::Escalated { event });
            }
        }
        Ok(LoopOutcome::Completed { answer })
    }

    async fn write_plan(
        &self,
        plan: &Plan,
        mut expected: Option<u64>,
    ) -> Result<u64, PipelineError> {
        loop {
            match self
                .store
                .revise(
                    &SectionName::plan(),
                    plan.render(),
                    self.writer(),
                    expected,
                )
                .await
            {
                Ok(revision) => return Ok(revision),
                Err(e) if e.is_stale_write() => {
                    let fresh = self.store.read(&SectionName::plan()).await?;
                    expected = Some(fresh.revision);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Mark a step done, or return it to pending with an error note.
    async fn update_step(
        &self,
        index: usize,
        succeeded: bool,
        note: Option<String>,
    ) -> Result<u64, PipelineError> {
        loop {
            let section = self.store.read(&SectionName::plan()).await?;
            let mut plan = Plan::parse(&section.content);
            plan.set_status(
                index,
                if succeeded {
                    StepStatus::Done
                } else {
                    StepStatus::Pending
                },
            );
            if let Some(note) = &note {
                plan.set_note(index, note.clone());
            }
            match self
                .store
                .revise(
                    &SectionName::plan(),
                    plan.render(),
                    self.writer(),
                    Some(section.revision),
                )
                .await
            {
                Ok(revision) => return Ok(revision),
                Err(e) if e.is_stale_write() => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Append one result entry; the raw output goes in whole.
    async fn append_log(
        &self,
        step_index: usize,
        result: &ToolCallResult,
    ) -> Result<u64, PipelineError> {
        let entry = render_result(step_index, result);
        loop {
            let attempt = match self.store.read(&SectionName::execution_log()).await {
                Ok(section) => {
                    let content = format!("{}\n\n{}", section.content.trim_end(), entry);
                    self.store
                        .revise(
                            &SectionName::execution_log(),
                            content,
                            self.writer(),
                            Some(section.revision),
                        )
                        .await
                }
                Err(StoreError::NotFound(_)) => {
                    self.store
                        .revise(
                            &SectionName::execution_log(),
                            entry.clone(),
                            self.writer(),
                            None,
                        )
                        .await
                }
                Err(e) => return Err(e.into()),
            };
            match attempt {
                Ok(revision) => return Ok(revision),
                Err(e) if e.is_stale_write() => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn intervention_outcome(event: WatcherEvent) -> LoopOutcome {
    match event.action {
        RecommendedAction::Escalate => LoopOutcome::Escalated { event },
        _ => LoopOutcome::Intervened { event },
    }
}
