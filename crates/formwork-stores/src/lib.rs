//! # formwork-stores
//!
//! Store implementations for the Formwork engine:
//!
//! - [`InMemoryDocumentStore`] - the shared document under optimistic
//!   concurrency, publishing every commit on a [`RevisionBus`]
//! - [`InMemoryStrategyLibrary`] / [`FileStrategyLibrary`] - strategy
//!   catalogue backends with serialized mutation
//!
//! The traits these implement live in `formwork_core::store`.

mod document_store;
mod revision_bus;
mod strategy_library;

pub use document_store::InMemoryDocumentStore;
pub use revision_bus::RevisionBus;
pub use strategy_library::{FileStrategyLibrary, InMemoryStrategyLibrary};
