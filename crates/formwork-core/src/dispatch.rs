//! Tool dispatcher
//!
//! Validates a decoded request against the tool's declared schema,
//! runs it under the tool's timeout and classifies the outcome. A
//! rejected request never reaches the tool. The dispatcher itself
//! never retries; whether a failed call is attempted again is decided
//! by the plan and the watcher.

use std::time::Instant;

use crate::registry::CapabilityRegistry;
use crate::types::{ToolCallRequest, ToolCallResult, ToolCallStatus};

/// Stateless dispatcher over a capability registry.
#[derive(Debug, Default)]
pub struct Dispatcher;

impl Dispatcher {
    pub fn new() -> Self {
        Self
    }

    /// Run one call to completion and classify it.
    pub async fn dispatch(
        &self,
        registry: &CapabilityRegistry,
        request: &ToolCallRequest,
    ) -> ToolCallResult {
        let Some(tool) = registry.get(&request.tool_id) else {
            return ToolCallResult::new(
                request.clone(),
                ToolCallStatus::Rejected,
                format!("tool '{}' is not registered", request.tool_id),
                0,
            );
        };
        let spec = tool.spec();

        let violations = validate_parameters(request, registry);
        if !violations.is_empty() {
            tracing::warn!(
                tool_id = %request.tool_id,
                violations = violations.len(),
                "rejecting tool call before invocation"
            );
            return ToolCallResult::new(
                request.clone(),
                ToolCallStatus::Rejected,
                format!("schema validation failed: {}", violations.join("; ")),
                0,
            );
        }

        tracing::debug!(tool_id = %request.tool_id, timeout_ms = spec.timeout.as_millis() as u64, "dispatching tool call");
        let started = Instant::now();
        let outcome = tokio::time::timeout(spec.timeout, tool.invoke(&request.parameters)).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(output)) => {
                tracing::info!(tool_id = %request.tool_id, duration_ms, "tool call succeeded");
                ToolCallResult::new(request.clone(), ToolCallStatus::Ok, output, duration_ms)
            }
            Ok(Err(error)) => {
                tracing::warn!(tool_id = %request.tool_id, duration_ms, error = %error, "tool call failed");
                ToolCallResult::new(
                    request.clone(),
                    ToolCallStatus::ToolError,
                    error.to_string(),
                    duration_ms,
                )
            }
            Err(_) => {
                tracing::warn!(tool_id = %request.tool_id, duration_ms, "tool call timed out");
                ToolCallResult::new(
                    request.clone(),
                    ToolCallStatus::Timeout,
                    format!(
                        "tool '{}' timed out after {}ms",
                        request.tool_id,
                        spec.timeout.as_millis()
                    ),
                    duration_ms,
                )
            }
        }
    }
}

/// Check a request against its tool's declared parameters.
///
/// Returns human-readable violations; empty means valid.
pub fn validate_parameters(request: &ToolCallRequest, registry: &CapabilityRegistry) -> Vec<String> {
    let Some(spec) = registry.spec(&request.tool_id) else {
        return vec![format!("tool '{}' is not registered", request.tool_id)];
    };
    let mut violations = Vec::new();

    for param in &spec.params {
        match request.parameters.get(&param.name) {
            None if param.required => {
                violations.push(format!("missing required parameter '{}'", param.name));
            }
            Some(value) if !param.kind.accepts(value) => {
                violations.push(format!(
                    "parameter '{}' must be {}",
                    param.name,
                    param.kind.as_str()
                ));
            }
            _ => {}
        }
    }
    for name in request.parameters.keys() {
        if spec.param(name).is_none() {
            violations.push(format!("unknown parameter '{}'", name));
        }
    }
    violations
}
