//! Capability registry
//!
//! Tools are registered once at startup and looked up by id when a
//! stage output decodes to a tool call. Each tool declares its
//! parameter schema, a per-call timeout and whether a retry of the
//! same call is safe.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Accepted parameter value shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    /// Any JSON value (arrays, objects).
    Json,
    /// Multi-line literal text, e.g. a script body.
    Code,
}

impl ParamKind {
    pub fn as_str(&self) -> &str {
        match self {
            ParamKind::String => "string",
            ParamKind::Integer => "integer",
            ParamKind::Number => "number",
            ParamKind::Boolean => "boolean",
            ParamKind::Json => "json",
            ParamKind::Code => "code",
        }
    }

    /// Whether a decoded value agrees with this kind.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamKind::String | ParamKind::Code => value.is_string(),
            ParamKind::Integer => value.is_i64() || value.is_u64(),
            ParamKind::Number => value.is_number(),
            ParamKind::Boolean => value.is_boolean(),
            ParamKind::Json => true,
        }
    }
}

/// One declared parameter of a tool.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
}

/// Declared interface of a registered tool.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub id: String,
    pub description: String,
    pub params: Vec<ParamSpec>,
    pub timeout: Duration,
    /// Safe to re-run with identical parameters.
    pub idempotent: bool,
}

impl ToolSpec {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            params: Vec::new(),
            timeout: Duration::from_secs(30),
            idempotent: false,
        }
    }

    pub fn with_required(mut self, name: impl Into<String>, kind: ParamKind) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    pub fn with_optional(mut self, name: impl Into<String>, kind: ParamKind) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }
}

/// Error reported by a tool run.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ToolError(pub String);

impl ToolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// An invocable capability.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Declared interface; called once at registration and when a
    /// block referencing this tool is decoded.
    fn spec(&self) -> ToolSpec;

    /// Run with validated parameters. The returned string is the raw
    /// output recorded verbatim in the execution log.
    async fn invoke(&self, params: &BTreeMap<String, Value>) -> Result<String, ToolError>;
}

/// Registry of available tools.
#[derive(Default)]
pub struct CapabilityRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool; replacing an existing id is logged.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let id = tool.spec().id;
        if self.tools.insert(id.clone(), tool).is_some() {
            tracing::warn!(tool_id = %id, "replacing previously registered tool");
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(id).cloned()
    }

    pub fn spec(&self, id: &str) -> Option<ToolSpec> {
        self.tools.get(id).map(|t| t.spec())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tools.contains_key(id)
    }

    /// Registered ids, sorted for stable rendering.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tools.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Markdown catalogue handed to the planning stage.
    pub fn catalogue(&self) -> String {
        let mut out = String::from("## Available tools\n\n");
        for id in self.ids() {
            if let Some(spec) = self.spec(&id) {
                let params: Vec<String> = spec
                    .params
                    .iter()
                    .map(|p| {
                        if p.required {
                            format!("{}: {}", p.name, p.kind.as_str())
                        } else {
                            format!("{}?: {}", p.name, p.kind.as_str())
                        }
                    })
                    .collect();
                out.push_str(&format!(
                    "- {} ({}): {}\n",
                    spec.id,
                    params.join(", "),
                    spec.description
                ));
            }
        }
        out
    }
}

impl fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("tools", &self.ids())
            .finish()
    }
}
