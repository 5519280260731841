//! Tool-call protocol codec
//!
//! Stage outputs are free text. This module decodes them into at most
//! one directive (a tool call or a final answer), renders requests back
//! to their canonical block form, and renders/reads execution-log
//! result entries.
//!
//! Wire format:
//!
//! ```text
//! [TOOL_CALL]
//! tool: web_search
//! query: rust 1.0 release date
//! max_results: 5
//! expect: at least one dated source
//! [/TOOL_CALL]
//! ```
//!
//! The first well-formed block wins; any further blocks are reported as
//! warnings. Values are decoded as JSON when they parse as JSON,
//! otherwise kept as raw strings. Parameters declared as `code` capture
//! every following line until the next recognized key of the block.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::registry::{CapabilityRegistry, ParamKind, ToolSpec};
use crate::types::{ToolCallRequest, ToolCallResult, ToolCallStatus};

pub const TOOL_CALL_OPEN: &str = "[TOOL_CALL]";
pub const TOOL_CALL_CLOSE: &str = "[/TOOL_CALL]";
pub const TOOL_RESULT_OPEN: &str = "[TOOL_RESULT]";
pub const TOOL_RESULT_CLOSE: &str = "[/TOOL_RESULT]";

static FINAL_ANSWER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)final answer\s*[:：]").expect("final answer regex"));
static KEY_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)\s*:\s?(.*)$").expect("key line regex"));

/// Decoding failures for a block that was clearly attempted.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed tool call: {0}")]
    MalformedToolCall(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),
}

/// What a stage output asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    ToolCall(ToolCallRequest),
    /// The text after the final-answer label.
    FinalAnswer(String),
}

/// Result of decoding one stage output.
#[derive(Debug, Clone, Default)]
pub struct ParseOutcome {
    pub directive: Option<Directive>,
    pub warnings: Vec<String>,
}

/// Decode a stage output into zero or one directive.
///
/// A present tool-call block takes precedence over a final-answer
/// label. A block with a structural fault is an error, not a silent
/// no-op, so the caller can log it and leave the step pending.
pub fn parse_stage_output(
    text: &str,
    registry: &CapabilityRegistry,
) -> Result<ParseOutcome, CodecError> {
    let lines: Vec<&str> = text.lines().collect();
    let mut open_indices: Vec<usize> = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        if line.trim() == TOOL_CALL_OPEN {
            open_indices.push(i);
        }
    }

    if open_indices.is_empty() {
        let directive = final_answer(text).map(Directive::FinalAnswer);
        return Ok(ParseOutcome {
            directive,
            warnings: Vec::new(),
        });
    }

    // Each candidate block runs from its open marker to the first
    // terminator before the next open marker; a candidate without its
    // own terminator is skipped, not merged into its successor.
    let mut warnings = Vec::new();
    let mut first_error: Option<CodecError> = None;
    let mut chosen: Option<ToolCallRequest> = None;
    let mut extra = 0usize;

    for (slot, &start) in open_indices.iter().enumerate() {
        if chosen.is_some() {
            extra += 1;
            continue;
        }
        let next_open = open_indices.get(slot + 1).copied().unwrap_or(lines.len());
        let end = lines[start + 1..next_open]
            .iter()
            .position(|l| l.trim() == TOOL_CALL_CLOSE)
            .map(|offset| start + 1 + offset);
        let Some(end) = end else {
            warnings.push(format!(
                "skipping tool-call block without a {} terminator",
                TOOL_CALL_CLOSE
            ));
            continue;
        };
        match parse_block(&lines[start + 1..end], registry, &mut warnings) {
            Ok(request) => chosen = Some(request),
            Err(error) => {
                warnings.push(format!("skipping undecodable tool-call block: {}", error));
                if first_error.is_none() {
                    first_error = Some(error);
                }
            }
        }
    }

    match chosen {
        Some(request) => {
            if extra > 0 {
                warnings.push(format!(
                    "ignoring {} extra tool-call block(s); first well-formed block wins",
                    extra
                ));
            }
            Ok(ParseOutcome {
                directive: Some(Directive::ToolCall(request)),
                warnings,
            })
        }
        None => Err(first_error.unwrap_or_else(|| {
            CodecError::MalformedToolCall("missing [/TOOL_CALL] terminator".to_string())
        })),
    }
}

fn parse_block(
    block: &[&str],
    registry: &CapabilityRegistry,
    warnings: &mut Vec<String>,
) -> Result<ToolCallRequest, CodecError> {
    let tool_id = block
        .iter()
        .find_map(|line| {
            let caps = KEY_LINE_RE.captures(line)?;
            if &caps[1] == "tool" {
                Some(caps[2].trim().to_string())
            } else {
                None
            }
        })
        .ok_or_else(|| CodecError::MalformedToolCall("missing 'tool:' line".to_string()))?;

    if tool_id.is_empty() {
        return Err(CodecError::MalformedToolCall("empty tool id".to_string()));
    }
    let spec = registry
        .spec(&tool_id)
        .ok_or_else(|| CodecError::ToolNotFound(tool_id.clone()))?;

    let mut request = ToolCallRequest::new(tool_id);
    let mut saw_tool_line = false;
    let mut i = 0;
    while i < block.len() {
        let line = block[i];
        let Some(caps) = KEY_LINE_RE.captures(line) else {
            if !line.trim().is_empty() {
                warnings.push(format!("ignoring unrecognized line: {}", line.trim()));
            }
            i += 1;
            continue;
        };
        let key = caps[1].to_string();
        let rest = caps[2].to_string();

        match key.as_str() {
            "tool" => {
                if saw_tool_line {
                    warnings.push("duplicate 'tool:' line ignored".to_string());
                }
                saw_tool_line = true;
                i += 1;
            }
            "expect" => {
                request.success_criteria = Some(rest.trim().to_string());
                i += 1;
            }
            _ => {
                let is_code = spec
                    .param(&key)
                    .map(|p| p.kind == ParamKind::Code)
                    .unwrap_or(false);
                if is_code {
                    let (value, consumed) = capture_code(&rest, &block[i + 1..], &spec);
                    request.parameters.insert(key, Value::String(value));
                    i += 1 + consumed;
                } else {
                    request.parameters.insert(key, decode_scalar(rest.trim()));
                    i += 1;
                }
            }
        }
    }

    Ok(request)
}

/// Capture a multi-line literal until the next recognized key of this
/// block, preserving the body verbatim.
fn capture_code(first: &str, rest: &[&str], spec: &ToolSpec) -> (String, usize) {
    let mut captured: Vec<String> = vec![first.to_string()];
    let mut consumed = 0;
    for line in rest {
        if let Some(caps) = KEY_LINE_RE.captures(line) {
            let key = &caps[1];
            if key == "tool" || key == "expect" || spec.param(key).is_some() {
                break;
            }
        }
        captured.push((*line).to_string());
        consumed += 1;
    }
    while captured.last().map(|l| l.trim().is_empty()).unwrap_or(false) {
        captured.pop();
    }
    let body = captured.join("\n");
    // A single quoted line is the canonical rendering of literal text.
    if consumed == 0 {
        if let Ok(Value::String(s)) = serde_json::from_str::<Value>(body.trim()) {
            return (s, 0);
        }
    }
    (body, consumed)
}

fn decode_scalar(raw: &str) -> Value {
    serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Extract the text after a `Final Answer:` label, if present.
pub fn final_answer(text: &str) -> Option<String> {
    FINAL_ANSWER_RE
        .find(text)
        .map(|m| text[m.end()..].trim().to_string())
}

/// Render a request as its canonical block. `parse_stage_output` on the
/// result decodes back to the same tool id and parameters.
pub fn render_request(request: &ToolCallRequest) -> String {
    let mut out = String::from(TOOL_CALL_OPEN);
    out.push('\n');
    out.push_str(&format!("tool: {}\n", request.tool_id));
    for (key, value) in &request.parameters {
        match value {
            Value::String(s) if renders_as_plain_text(s) => {
                out.push_str(&format!("{}: {}\n", key, s));
            }
            other => {
                out.push_str(&format!("{}: {}\n", key, other));
            }
        }
    }
    if let Some(criteria) = &request.success_criteria {
        out.push_str(&format!("expect: {}\n", criteria));
    }
    out.push_str(TOOL_CALL_CLOSE);
    out
}

/// True when a raw rendering decodes back to the same string.
fn renders_as_plain_text(s: &str) -> bool {
    !s.is_empty()
        && !s.contains('\n')
        && s == s.trim()
        && serde_json::from_str::<Value>(s).is_err()
}

/// Render a dispatched result as an execution-log entry.
///
/// The `output:` body is the raw tool output, verbatim and complete.
/// `output_lines:` declares the body length so read-back does not
/// depend on the body itself staying clear of the block terminator.
pub fn render_result(step_index: usize, result: &ToolCallResult) -> String {
    format!(
        "{}\nstep: {}\ntool: {}\nstatus: {}\nduration_ms: {}\noutput_lines: {}\noutput:\n{}\n{}",
        TOOL_RESULT_OPEN,
        step_index,
        result.request.tool_id,
        result.status,
        result.duration_ms,
        result.raw_output.lines().count(),
        result.raw_output,
        TOOL_RESULT_CLOSE
    )
}

/// One entry read back from the execution log.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedResult {
    pub step: usize,
    pub tool_id: String,
    pub status: ToolCallStatus,
    pub output: String,
}

impl LoggedResult {
    /// Same signature scheme as a live result, for failure matching.
    pub fn error_signature(&self) -> String {
        let first_line = self.output.lines().next().unwrap_or("").trim();
        if first_line.is_empty() {
            return "<empty>".to_string();
        }
        let mut sig: String = first_line.chars().take(120).collect();
        sig.make_ascii_lowercase();
        sig
    }
}

/// Read all result entries from an execution-log section, oldest first.
/// Entries that do not parse are skipped.
pub fn parse_result_blocks(log: &str) -> Vec<LoggedResult> {
    let lines: Vec<&str> = log.lines().collect();
    let mut entries = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        if lines[i].trim() != TOOL_RESULT_OPEN {
            i += 1;
            continue;
        }
        let mut step: Option<usize> = None;
        let mut tool_id: Option<String> = None;
        let mut status: Option<ToolCallStatus> = None;
        let mut declared_lines: Option<usize> = None;
        let mut output: Option<String> = None;
        let mut j = i + 1;
        while j < lines.len() && lines[j].trim() != TOOL_RESULT_CLOSE {
            if lines[j].trim() == "output:" {
                // The declared length frames the body; a terminator-shaped
                // line inside the output stays part of the output.
                let start = j + 1;
                let end = match declared_lines {
                    Some(count) => (start + count).min(lines.len()),
                    None => {
                        let mut k = start;
                        while k < lines.len() && lines[k].trim() != TOOL_RESULT_CLOSE {
                            k += 1;
                        }
                        k
                    }
                };
                output = Some(lines[start..end].join("\n"));
                j = end;
                while j < lines.len() && lines[j].trim() != TOOL_RESULT_CLOSE {
                    j += 1;
                }
                break;
            }
            if let Some(caps) = KEY_LINE_RE.captures(lines[j]) {
                match &caps[1] {
                    "step" => step = caps[2].trim().parse().ok(),
                    "tool" => tool_id = Some(caps[2].trim().to_string()),
                    "status" => status = caps[2].trim().parse().ok(),
                    "output_lines" => declared_lines = caps[2].trim().parse().ok(),
                    _ => {}
                }
            }
            j += 1;
        }
        if j < lines.len() {
            if let (Some(step), Some(tool_id), Some(status), Some(output)) =
                (step, tool_id, status, output)
            {
                entries.push(LoggedResult {
                    step,
                    tool_id,
                    status,
                    output,
                });
            }
            i = j + 1;
        } else {
            break;
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Tool, ToolError};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    struct FakeSearch;

    #[async_trait]
    impl Tool for FakeSearch {
        fn spec(&self) -> ToolSpec {
            ToolSpec::new("web_search", "Search the web")
                .with_required("query", ParamKind::String)
                .with_optional("max_results", ParamKind::Integer)
                .idempotent(true)
        }

        async fn invoke(&self, _: &BTreeMap<String, Value>) -> Result<String, ToolError> {
            Ok(String::new())
        }
    }

    struct FakeInterpreter;

    #[async_trait]
    impl Tool for FakeInterpreter {
        fn spec(&self) -> ToolSpec {
            ToolSpec::new("code_interpreter", "Run a script")
                .with_required("code", ParamKind::Code)
                .with_optional("format", ParamKind::String)
        }

        async fn invoke(&self, _: &BTreeMap<String, Value>) -> Result<String, ToolError> {
            Ok(String::new())
        }
    }

    fn registry() -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new();
        registry.register(Arc::new(FakeSearch));
        registry.register(Arc::new(FakeInterpreter));
        registry
    }

    #[test]
    fn test_parse_simple_block() {
        let text = "thinking...\n[TOOL_CALL]\ntool: web_search\nquery: rust 1.0 release date\nmax_results: 5\nexpect: a dated source\n[/TOOL_CALL]\ndone";
        let outcome = parse_stage_output(text, &registry()).unwrap();
        let Some(Directive::ToolCall(request)) = outcome.directive else {
            panic!("expected tool call");
        };
        assert_eq!(request.tool_id, "web_search");
        assert_eq!(request.param_str("query"), Some("rust 1.0 release date"));
        assert_eq!(request.param_i64("max_results"), Some(5));
        assert_eq!(request.success_criteria.as_deref(), Some("a dated source"));
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn test_first_block_wins_with_warning() {
        let text = "[TOOL_CALL]\ntool: web_search\nquery: first\n[/TOOL_CALL]\n[TOOL_CALL]\ntool: web_search\nquery: second\n[/TOOL_CALL]";
        let outcome = parse_stage_output(text, &registry()).unwrap();
        let Some(Directive::ToolCall(request)) = outcome.directive else {
            panic!("expected tool call");
        };
        assert_eq!(request.param_str("query"), Some("first"));
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[test]
    fn test_unterminated_block_does_not_swallow_the_next() {
        // The first block never closes; the well-formed second block
        // must win on its own, with none of the first block's lines.
        let text = "[TOOL_CALL]\ntool: code_interpreter\ncode: x = 1\n[TOOL_CALL]\ntool: web_search\nquery: rescue\n[/TOOL_CALL]";
        let outcome = parse_stage_output(text, &registry()).unwrap();
        let Some(Directive::ToolCall(request)) = outcome.directive else {
            panic!("expected tool call");
        };
        assert_eq!(request.tool_id, "web_search");
        assert_eq!(request.param_str("query"), Some("rescue"));
        assert_eq!(request.parameters.len(), 1);
        assert!(outcome
            .warnings
            .iter()
            .any(|w| w.contains("terminator")));
    }

    #[test]
    fn test_undecodable_block_is_skipped_for_the_next() {
        let text = "[TOOL_CALL]\ntool: teleport\n[/TOOL_CALL]\n[TOOL_CALL]\ntool: web_search\nquery: x\n[/TOOL_CALL]";
        let outcome = parse_stage_output(text, &registry()).unwrap();
        let Some(Directive::ToolCall(request)) = outcome.directive else {
            panic!("expected tool call");
        };
        assert_eq!(request.tool_id, "web_search");
        assert!(!outcome.warnings.is_empty());
    }

    #[test]
    fn test_missing_terminator_is_malformed() {
        let text = "[TOOL_CALL]\ntool: web_search\nquery: x";
        let err = parse_stage_output(text, &registry()).unwrap_err();
        assert!(matches!(err, CodecError::MalformedToolCall(_)));
    }

    #[test]
    fn test_missing_tool_line_is_malformed() {
        let text = "[TOOL_CALL]\nquery: x\n[/TOOL_CALL]";
        let err = parse_stage_output(text, &registry()).unwrap_err();
        assert!(matches!(err, CodecError::MalformedToolCall(_)));
    }

    #[test]
    fn test_unknown_tool_rejected() {
        let text = "[TOOL_CALL]\ntool: teleport\n[/TOOL_CALL]";
        let err = parse_stage_output(text, &registry()).unwrap_err();
        assert!(matches!(err, CodecError::ToolNotFound(id) if id == "teleport"));
    }

    #[test]
    fn test_code_param_captures_multiline_body() {
        let text = "[TOOL_CALL]\ntool: code_interpreter\ncode: total = 0\nfor n in range(10):\n    total += n\nresult = total\nformat: text\n[/TOOL_CALL]";
        let outcome = parse_stage_output(text, &registry()).unwrap();
        let Some(Directive::ToolCall(request)) = outcome.directive else {
            panic!("expected tool call");
        };
        let code = request.param_str("code").unwrap();
        assert!(code.starts_with("total = 0"));
        assert!(code.contains("    total += n"));
        assert!(code.ends_with("result = total"));
        assert_eq!(request.param_str("format"), Some("text"));
    }

    #[test]
    fn test_final_answer_label_variants() {
        assert_eq!(
            final_answer("Final Answer: 42 is the result"),
            Some("42 is the result".to_string())
        );
        assert_eq!(final_answer("final answer： yes"), Some("yes".to_string()));
        assert_eq!(final_answer("no label here"), None);
    }

    #[test]
    fn test_neither_directive() {
        let outcome = parse_stage_output("just reasoning, no action", &registry()).unwrap();
        assert!(outcome.directive.is_none());
    }

    #[test]
    fn test_round_trip_request() {
        let text = "[TOOL_CALL]\ntool: web_search\nquery: \"population of lisbon\"\nmax_results: 3\n[/TOOL_CALL]";
        let registry = registry();
        let outcome = parse_stage_output(text, &registry).unwrap();
        let Some(Directive::ToolCall(original)) = outcome.directive else {
            panic!("expected tool call");
        };
        let rendered = render_request(&original);
        let reparsed = parse_stage_output(&rendered, &registry).unwrap();
        let Some(Directive::ToolCall(back)) = reparsed.directive else {
            panic!("expected tool call after render");
        };
        assert_eq!(back.tool_id, original.tool_id);
        assert_eq!(back.parameters, original.parameters);
    }

    #[test]
    fn test_round_trip_code_request() {
        let text = "[TOOL_CALL]\ntool: code_interpreter\ncode: x = 1\ny = x * 2\n[/TOOL_CALL]";
        let registry = registry();
        let outcome = parse_stage_output(text, &registry).unwrap();
        let Some(Directive::ToolCall(original)) = outcome.directive else {
            panic!("expected tool call");
        };
        let rendered = render_request(&original);
        let reparsed = parse_stage_output(&rendered, &registry).unwrap();
        let Some(Directive::ToolCall(back)) = reparsed.directive else {
            panic!("expected tool call after render");
        };
        assert_eq!(back.parameters, original.parameters);
    }

    #[test]
    fn test_result_entry_keeps_full_output() {
        let long_output = "line\n".repeat(4000);
        let request = ToolCallRequest::new("web_search").with_param("query", "x");
        let result = ToolCallResult::new(request, ToolCallStatus::Ok, long_output.clone(), 7);
        let entry = render_result(2, &result);
        assert!(entry.contains(long_output.trim_end()));

        let parsed = parse_result_blocks(&entry);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].step, 2);
        assert_eq!(parsed[0].status, ToolCallStatus::Ok);
        assert_eq!(parsed[0].output, long_output.trim_end());
    }

    #[test]
    fn test_result_output_containing_terminator_line_round_trips() {
        let tricky = "scraped page\n[/TOOL_RESULT]\ntrailing text";
        let request = ToolCallRequest::new("web_search").with_param("query", "x");
        let first = ToolCallResult::new(request.clone(), ToolCallStatus::Ok, tricky, 7);
        let second = ToolCallResult::new(request, ToolCallStatus::Ok, "clean", 3);
        let log = format!("{}\n\n{}", render_result(1, &first), render_result(2, &second));
        let parsed = parse_result_blocks(&log);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].output, tricky);
        assert_eq!(parsed[1].step, 2);
        assert_eq!(parsed[1].output, "clean");
    }

    #[test]
    fn test_parse_result_blocks_in_order() {
        let request = ToolCallRequest::new("web_search");
        let first = ToolCallResult::new(request.clone(), ToolCallStatus::ToolError, "HTTP 503", 3);
        let second = ToolCallResult::new(request, ToolCallStatus::Ok, "found it", 4);
        let log = format!("{}\n\n{}", render_result(1, &first), render_result(1, &second));
        let parsed = parse_result_blocks(&log);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].status, ToolCallStatus::ToolError);
        assert_eq!(parsed[1].status, ToolCallStatus::Ok);
        assert_eq!(parsed[0].error_signature(), "http 503");
    }
}
