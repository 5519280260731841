//! Tool call request/result types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A structured request decoded from one `[TOOL_CALL]` block.
///
/// Parameters use a `BTreeMap` so a decoded request renders back to a
/// canonical block with a stable key order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub tool_id: String,
    pub parameters: BTreeMap<String, Value>,
    /// Advisory success criteria (`expect:` line); never enforced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_criteria: Option<String>,
}

impl ToolCallRequest {
    pub fn new(tool_id: impl Into<String>) -> Self {
        Self {
            tool_id: tool_id.into(),
            parameters: BTreeMap::new(),
            success_criteria: None,
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn with_success_criteria(mut self, criteria: impl Into<String>) -> Self {
        self.success_criteria = Some(criteria.into());
        self
    }

    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).and_then(|v| v.as_str())
    }

    pub fn param_i64(&self, name: &str) -> Option<i64> {
        self.parameters.get(name).and_then(|v| v.as_i64())
    }
}

/// How a dispatched call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    /// Tool ran and returned output.
    Ok,
    /// Tool ran and reported a failure.
    ToolError,
    /// Tool did not finish within its declared timeout.
    Timeout,
    /// Schema validation failed; the tool was never invoked.
    Rejected,
}

impl ToolCallStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ToolCallStatus::Ok => "ok",
            ToolCallStatus::ToolError => "tool_error",
            ToolCallStatus::Timeout => "timeout",
            ToolCallStatus::Rejected => "rejected",
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, ToolCallStatus::Ok)
    }
}

impl std::fmt::Display for ToolCallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ToolCallStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(ToolCallStatus::Ok),
            "tool_error" => Ok(ToolCallStatus::ToolError),
            "timeout" => Ok(ToolCallStatus::Timeout),
            "rejected" => Ok(ToolCallStatus::Rejected),
            other => Err(format!("unknown tool call status: {}", other)),
        }
    }
}

/// Outcome of dispatching one tool call.
///
/// `raw_output` always holds the complete tool output or error text;
/// it is never truncated here or when rendered into the execution log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub request: ToolCallRequest,
    pub status: ToolCallStatus,
    pub raw_output: String,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

impl ToolCallResult {
    pub fn new(
        request: ToolCallRequest,
        status: ToolCallStatus,
        raw_output: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            request,
            status,
            raw_output: raw_output.into(),
            duration_ms,
            finished_at: Utc::now(),
        }
    }

    /// Short signature used to recognize the same failure recurring.
    ///
    /// First line of the output, capped, lowercased. Empty outputs map
    /// to a fixed marker so consecutive empty failures still match.
    pub fn error_signature(&self) -> String {
        let first_line = self.raw_output.lines().next().unwrap_or("").trim();
        if first_line.is_empty() {
            return "<empty>".to_string();
        }
        let mut sig: String = first_line.chars().take(120).collect();
        sig.make_ascii_lowercase();
        sig
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder_orders_params() {
        let request = ToolCallRequest::new("web_search")
            .with_param("query", "rust 1.0 release date")
            .with_param("max_results", 5);
        let keys: Vec<&str> = request.parameters.keys().map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["max_results", "query"]);
        assert_eq!(request.param_i64("max_results"), Some(5));
    }

    #[test]
    fn test_error_signature_matches_across_attempts() {
        let request = ToolCallRequest::new("web_search");
        let a = ToolCallResult::new(request.clone(), ToolCallStatus::ToolError, "HTTP 503\nbody", 10);
        let b = ToolCallResult::new(request.clone(), ToolCallStatus::ToolError, "http 503\nother", 12);
        assert_eq!(a.error_signature(), b.error_signature());

        let empty = ToolCallResult::new(request, ToolCallStatus::Ok, "  ", 1);
        assert_eq!(empty.error_signature(), "<empty>");
    }

    #[test]
    fn test_status_round_trips_via_str() {
        for status in [
            ToolCallStatus::Ok,
            ToolCallStatus::ToolError,
            ToolCallStatus::Timeout,
            ToolCallStatus::Rejected,
        ] {
            let parsed: ToolCallStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }
}
