//! Shared-document section types
//!
//! The whole pipeline communicates through one document made of named
//! sections. Every section carries the revision that produced it, the
//! writer that produced it and a content hash for change detection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

use crate::types::stage::StageId;

/// Strongly-typed section name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct SectionName(pub String);

impl SectionName {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The task objective, seeded before the first stage runs.
    pub fn objective() -> Self {
        Self::new("objective")
    }

    /// Output of the analysis stage.
    pub fn analysis() -> Self {
        Self::new("analysis")
    }

    /// Candidate strategies drafted against the library catalogue.
    pub fn candidate_strategies() -> Self {
        Self::new("candidate_strategies")
    }

    /// The strategy chosen (or merged) for this task.
    pub fn selected_strategy() -> Self {
        Self::new("selected_strategy")
    }

    /// Outcome of the library admission gate.
    pub fn library_upgrade() -> Self {
        Self::new("library_upgrade")
    }

    /// The live plan the execution loop reads on every iteration.
    pub fn plan() -> Self {
        Self::new("plan")
    }

    /// Append-only record of tool invocations and their raw outputs.
    pub fn execution_log() -> Self {
        Self::new("execution_log")
    }

    /// The final answer, written only when a final-answer marker is found.
    pub fn final_answer() -> Self {
        Self::new("final_answer")
    }

    /// Audit trail of watcher interventions.
    pub fn watcher_audit() -> Self {
        Self::new("watcher_audit")
    }
}

impl From<String> for SectionName {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SectionName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<SectionName> for String {
    fn from(value: SectionName) -> Self {
        value.0
    }
}

impl fmt::Display for SectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<str> for SectionName {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl PartialEq<&str> for SectionName {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

/// Identifier of whoever revised a section.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct WriterId(pub String);

impl WriterId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Writer used when the pipeline seeds the document before stage one.
    pub fn intake() -> Self {
        Self::new("intake")
    }

    /// Writer used by the watcher monitor for audit records.
    pub fn watcher() -> Self {
        Self::new("watcher")
    }
}

impl From<StageId> for WriterId {
    fn from(stage: StageId) -> Self {
        Self::new(stage.as_str())
    }
}

impl From<&str> for WriterId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for WriterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lowercase hex SHA-256 of section content.
pub fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// One named slice of the shared document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub name: SectionName,
    pub content: String,
    /// Revision that produced this content (from the document-wide counter).
    pub revision: u64,
    pub writer: WriterId,
    pub content_hash: String,
    pub updated_at: DateTime<Utc>,
}

impl Section {
    pub fn new(
        name: SectionName,
        content: impl Into<String>,
        revision: u64,
        writer: WriterId,
    ) -> Self {
        let content = content.into();
        let content_hash = content_hash(&content);
        Self {
            name,
            content,
            revision,
            writer,
            content_hash,
            updated_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty()
    }
}

/// Immutable snapshot of the whole shared document.
///
/// Sections keep their insertion order so rendered snapshots read in
/// pipeline order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Document {
    sections: HashMap<SectionName, Section>,
    order: Vec<SectionName>,
    max_revision: u64,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn section(&self, name: &SectionName) -> Option<&Section> {
        self.sections.get(name)
    }

    pub fn content(&self, name: &SectionName) -> Option<&str> {
        self.sections.get(name).map(|s| s.content.as_str())
    }

    /// Sections in insertion order.
    pub fn sections(&self) -> impl Iterator<Item = &Section> {
        self.order.iter().filter_map(|name| self.sections.get(name))
    }

    /// Highest revision any section has reached.
    pub fn max_revision(&self) -> u64 {
        self.max_revision
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Record a committed revision of a section.
    pub fn apply_revision(
        &mut self,
        name: SectionName,
        content: impl Into<String>,
        writer: WriterId,
        revision: u64,
    ) {
        if !self.sections.contains_key(&name) {
            self.order.push(name.clone());
        }
        let section = Section::new(name.clone(), content, revision, writer);
        self.max_revision = self.max_revision.max(revision);
        self.sections.insert(name, section);
    }

    /// Render the snapshot as markdown, one `##` heading per section.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for section in self.sections() {
            out.push_str(&format!("## {}\n\n", section.name));
            out.push_str(section.content.trim_end());
            out.push_str("\n\n");
        }
        out
    }
}
