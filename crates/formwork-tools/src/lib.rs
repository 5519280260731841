//! # formwork-tools
//!
//! Builtin tools for the Formwork capability registry. Search, scrape
//! and sandboxed interpreters are expected to be provided by the
//! deployment; these builtins cover plumbing checks, arithmetic and
//! simple page retrieval.

mod builtin;

pub use builtin::{register_builtin_tools, CalculateTool, EchoTool, HttpFetchTool};
