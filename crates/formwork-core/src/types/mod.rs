//! Core type definitions
//!
//! - Section/Document: the shared document the pipeline revises
//! - StageId: pipeline stage identifiers
//! - ToolCallRequest/Result: the tool-call wire types
//! - WatcherEvent: intervention events from the watcher monitor

mod call;
mod section;
mod stage;
mod watcher;

pub use call::{ToolCallRequest, ToolCallResult, ToolCallStatus};
pub use section::{content_hash, Document, Section, SectionName, WriterId};
pub use stage::StageId;
pub use watcher::{Evidence, RecommendedAction, TriggerKind, WatcherEvent};
