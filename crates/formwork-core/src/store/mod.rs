//! Store abstractions
//!
//! - DocumentStore: the shared document, revised under optimistic
//!   concurrency
//! - StrategyLibrary: the cross-task strategy catalogue with
//!   serialized mutation
//!
//! Note: Implementations are in formwork-stores crate

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::library::{StrategyCatalog, StrategyDraft, StrategyEntry, StrategyId};
use crate::types::{Document, Section, SectionName, WriterId};

/// Store error types
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("stale write rejected on '{section}': expected revision {expected:?}, current {current}")]
    StaleWriteRejected {
        section: SectionName,
        expected: Option<u64>,
        current: u64,
    },

    #[error("Item not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn is_stale_write(&self) -> bool {
        matches!(self, StoreError::StaleWriteRejected { .. })
    }
}

/// Published after every committed revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionEvent {
    pub section: SectionName,
    pub revision: u64,
    pub writer: WriterId,
}

/// The shared document all stages read from and write to.
///
/// `revise` succeeds only when `expected` matches the section's current
/// revision (`None` for a section that does not exist yet); otherwise
/// it fails with `StaleWriteRejected` and the caller re-reads. Each
/// successful revise takes the next value of a document-wide monotonic
/// counter, so revisions across sections form one total order.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn read(&self, section: &SectionName) -> Result<Section, StoreError>;

    async fn revise(
        &self,
        section: &SectionName,
        content: String,
        writer: WriterId,
        expected: Option<u64>,
    ) -> Result<u64, StoreError>;

    /// Consistent deep copy of the whole document.
    async fn snapshot(&self) -> Document;

    /// Current value of the document-wide revision counter.
    async fn max_revision(&self) -> u64;
}

/// The cross-task strategy catalogue.
///
/// Mutations are serialized by the implementation, so identifier
/// allocation is single-writer even when gate evaluations overlap.
#[async_trait]
pub trait StrategyLibrary: Send + Sync {
    async fn snapshot(&self) -> Result<StrategyCatalog, StoreError>;

    /// Append a new entry, allocating the next id in its category.
    async fn admit(&self, draft: StrategyDraft) -> Result<StrategyEntry, StoreError>;

    /// Record an enhancement note on an existing entry.
    async fn enhance(&self, id: &StrategyId, note: String) -> Result<(), StoreError>;
}
