//! # formwork-llm
//!
//! Text-generation capability for the pipeline stages: the
//! [`StageGenerator`] trait plus an OpenAI-compatible HTTP client.
//! Each stage asks for one completion over the current document
//! snapshot; retry policy lives with the stage controller, not here.

pub mod openai;

use async_trait::async_trait;
use thiserror::Error;

use formwork_core::types::{Document, StageId};

/// Generation errors.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Response error: {0}")]
    Response(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// One stage-scoped generation request.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub stage: StageId,
    /// Snapshot of the shared document at request time.
    pub document: Document,
    /// Stage-specific extras, e.g. the strategy catalogue or the tool
    /// catalogue.
    pub extra_context: Option<String>,
}

impl GenerationRequest {
    pub fn new(stage: StageId, document: Document) -> Self {
        Self {
            stage,
            document,
            extra_context: None,
        }
    }

    pub fn with_extra_context(mut self, context: impl Into<String>) -> Self {
        self.extra_context = Some(context.into());
        self
    }
}

/// A text-generation capability scoped to pipeline stages.
#[async_trait]
pub trait StageGenerator: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<String, GenerationError>;
}
