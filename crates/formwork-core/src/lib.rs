//! # formwork-core
//!
//! Core of the Formwork engine: the shared-document data model, the
//! tool-call wire protocol, the capability registry and dispatcher,
//! live-plan handling and the strategy-library admission gate.
//!
//! ## Modules
//!
//! - [`types`] - Document/Section, stages, tool-call and watcher types
//! - [`protocol`] - tool-call block codec and execution-log entries
//! - [`registry`] - Tool trait, ToolSpec, CapabilityRegistry
//! - [`dispatch`] - schema validation, timeout and classification
//! - [`plan`] - live plan parse/render
//! - [`library`] - strategy catalogue and admission gate
//! - [`store`] - DocumentStore / StrategyLibrary traits (impls live in
//!   formwork-stores)

pub mod dispatch;
pub mod library;
pub mod plan;
pub mod protocol;
pub mod registry;
pub mod store;
pub mod types;

/// Convenience re-exports.
pub mod prelude {
    pub use crate::dispatch::{validate_parameters, Dispatcher};
    pub use crate::library::gate::{
        evaluate, parse_candidate, GateAction, GateDecision, GatePolicy, Justification,
        UpgradeCandidate,
    };
    pub use crate::library::{StrategyCatalog, StrategyDraft, StrategyEntry, StrategyId};
    pub use crate::plan::{Plan, PlanStep, StepStatus};
    pub use crate::protocol::{
        final_answer, parse_result_blocks, parse_stage_output, render_request, render_result,
        CodecError, Directive, LoggedResult, ParseOutcome,
    };
    pub use crate::registry::{
        CapabilityRegistry, ParamKind, ParamSpec, Tool, ToolError, ToolSpec,
    };
    pub use crate::store::{DocumentStore, RevisionEvent, StoreError, StrategyLibrary};
    pub use crate::types::{
        content_hash, Document, Evidence, RecommendedAction, Section, SectionName, StageId,
        ToolCallRequest, ToolCallResult, ToolCallStatus, TriggerKind, WatcherEvent, WriterId,
    };
}
