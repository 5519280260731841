//! # formwork-runtime
//!
//! Runtime for the Formwork task engine:
//!
//! - [`StageController`] - the stage state machine, analysis through
//!   execution to a terminal report
//! - [`ExecutionLoop`] - runs the live plan one tool call at a time
//! - [`WatcherMonitor`] - detection rules over the shared document,
//!   recommending replan, rollback or escalation
//! - [`Pipeline`] / [`PipelineBuilder`] - wiring it all together
//!
//! The shared document, codec and stores live in `formwork-core` and
//! `formwork-stores`; this crate owns the control flow.

pub mod controller;
pub mod execution;
pub mod pipeline;
pub mod watcher;

pub use controller::{ControlState, HaltReason, PipelineError, RunReport, StageController};
pub use execution::{ExecutionLoop, LoopOutcome};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use watcher::{
    GoalComparator, LexicalOverlapComparator, WatcherHandle, WatcherMonitor, WatcherRules,
};
