//! Pipeline wiring
//!
//! Builds one runnable pipeline out of its parts: document store and
//! revision bus, watcher monitor, strategy library, capability registry
//! and the stage controller. One [`Pipeline::run`] call takes an
//! objective from intake to a terminal report.

use std::sync::Arc;
use std::time::Duration;

use formwork_config::FormworkConfig;
use formwork_core::library::gate::GatePolicy;
use formwork_core::registry::CapabilityRegistry;
use formwork_core::store::{DocumentStore, StrategyLibrary};
use formwork_core::types::{SectionName, WriterId};
use formwork_llm::StageGenerator;
use formwork_stores::{InMemoryDocumentStore, InMemoryStrategyLibrary};

use crate::controller::{PipelineError, RunReport, StageController};
use crate::watcher::{
    GoalComparator, LexicalOverlapComparator, WatcherHandle, WatcherMonitor, WatcherRules,
};

/// Assembles a [`Pipeline`]. Only the generator is mandatory; every
/// other part has a working default.
pub struct PipelineBuilder {
    generator: Arc<dyn StageGenerator>,
    config: FormworkConfig,
    library: Option<Arc<dyn StrategyLibrary>>,
    registry: Option<CapabilityRegistry>,
    comparator: Option<Arc<dyn GoalComparator>>,
}

impl PipelineBuilder {
    pub fn new(generator: Arc<dyn StageGenerator>) -> Self {
        Self {
            generator,
            config: FormworkConfig::default(),
            library: None,
            registry: None,
            comparator: None,
        }
    }

    pub fn with_config(mut self, config: FormworkConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_library(mut self, library: Arc<dyn StrategyLibrary>) -> Self {
        self.library = Some(library);
        self
    }

    pub fn with_registry(mut self, registry: CapabilityRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_comparator(mut self, comparator: Arc<dyn GoalComparator>) -> Self {
        self.comparator = Some(comparator);
        self
    }

    pub fn build(self) -> Pipeline {
        Pipeline {
            generator: self.generator,
            config: self.config,
            library: self
                .library
                .unwrap_or_else(|| Arc::new(InMemoryStrategyLibrary::default())),
            registry: Arc::new(self.registry.unwrap_or_default()),
            comparator: self
                .comparator
                .unwrap_or_else(|| Arc::new(LexicalOverlapComparator::default())),
        }
    }
}

/// A configured engine. Each `run` gets a fresh document store and
/// watcher; the strategy library and registry are shared across runs.
pub struct Pipeline {
    generator: Arc<dyn StageGenerator>,
    config: FormworkConfig,
    library: Arc<dyn StrategyLibrary>,
    registry: Arc<CapabilityRegistry>,
    comparator: Arc<dyn GoalComparator>,
}

impl Pipeline {
    pub fn builder(generator: Arc<dyn StageGenerator>) -> PipelineBuilder {
        PipelineBuilder::new(generator)
    }

    /// Run one objective to a terminal state.
    pub async fn run(
        &self,
        objective: &str,
        context: Option<&str>,
    ) -> Result<RunReport, PipelineError> {
        let run_id = uuid::Uuid::new_v4();
        tracing::info!(run_id = %run_id, objective, "starting pipeline run");

        let store = Arc::new(InMemoryDocumentStore::default());
        let receiver = store.bus().subscribe();
        let store: Arc<dyn DocumentStore> = store;

        let mut watcher = if self.config.watcher.enabled {
            WatcherMonitor::spawn(
                store.clone(),
                receiver,
                WatcherRules {
                    repeated_failure_threshold: self.config.watcher.repeated_failure_threshold,
                    empty_streak_threshold: self.config.watcher.empty_streak_threshold,
                },
                self.comparator.clone(),
            )
        } else {
            WatcherHandle::disabled()
        };

        let content = match context {
            Some(context) if !context.trim().is_empty() => {
                format!("{}\n\nContext:\n{}", objective, context)
            }
            _ => objective.to_string(),
        };
        store
            .revise(&SectionName::objective(), content, WriterId::intake(), None)
            .await?;

        let mut controller = StageController::new(
            store,
            self.generator.clone(),
            self.library.clone(),
            self.registry.clone(),
            GatePolicy {
                max_new_per_category: self.config.gate.max_new_per_category,
                min_reference_ids: self.config.gate.min_reference_ids,
            },
            self.config.pipeline.generation_retries,
            Duration::from_secs(self.config.pipeline.stage_timeout_secs),
            self.config.pipeline.max_iterations,
        );
        let report = controller.run(&mut watcher).await?;
        tracing::info!(
            run_id = %run_id,
            state = report.state.as_str(),
            halt = %report.halt.summary(),
            "pipeline run finished"
        );
        Ok(report)
    }
}
