//! In-memory document store
//!
//! One shared document behind an RwLock. `revise` enforces optimistic
//! concurrency per section and allocates revisions from a single
//! document-wide counter, so every commit gets a strictly increasing
//! revision number regardless of which section it touches.

use async_trait::async_trait;
use tokio::sync::RwLock;

use formwork_core::store::{DocumentStore, RevisionEvent, StoreError};
use formwork_core::types::{Document, Section, SectionName, WriterId};

use crate::revision_bus::RevisionBus;

/// RwLock-backed document store publishing on a revision bus.
pub struct InMemoryDocumentStore {
    inner: RwLock<Document>,
    bus: RevisionBus,
}

impl InMemoryDocumentStore {
    pub fn new(bus: RevisionBus) -> Self {
        Self {
            inner: RwLock::new(Document::new()),
            bus,
        }
    }

    pub fn bus(&self) -> &RevisionBus {
        &self.bus
    }
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new(RevisionBus::default())
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn read(&self, section: &SectionName) -> Result<Section, StoreError> {
        let doc = self.inner.read().await;
        doc.section(section)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(section.to_string()))
    }

    async fn revise(
        &self,
        section: &SectionName,
        content: String,
        writer: WriterId,
        expected: Option<u64>,
    ) -> Result<u64, StoreError> {
        let mut doc = self.inner.write().await;
        let current = doc.section(section).map(|s| s.revision);
        if current != expected {
            tracing::debug!(
                section = %section,
                expected = ?expected,
                current = ?current,
                "rejecting stale write"
            );
            return Err(StoreError::StaleWriteRejected {
                section: section.clone(),
                expected,
                current: current.unwrap_or(0),
            });
        }

        let revision = doc.max_revision() + 1;
        doc.apply_revision(section.clone(), content, writer.clone(), revision);
        drop(doc);

        tracing::debug!(section = %section, revision, writer = %writer, "committed revision");
        self.bus.publish(RevisionEvent {
            section: section.clone(),
            revision,
            writer,
        });
        Ok(revision)
    }

    async fn snapshot(&self) -> Document {
        self.inner.read().await.clone()
    }

    async fn max_revision(&self) -> u64 {
        self.inner.read().await.max_revision()
    }
}
