//! Builtin tools
//!
//! Small capabilities that exercise the registry contract end to end:
//! echo (plumbing checks), calculate (pure arithmetic) and http_fetch
//! (page retrieval with a bounded body).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use formwork_core::registry::{CapabilityRegistry, ParamKind, Tool, ToolError, ToolSpec};

const FETCH_BODY_CAP: usize = 5_000;

fn param_str<'a>(params: &'a BTreeMap<String, Value>, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

fn param_u64(params: &BTreeMap<String, Value>, key: &str) -> Option<u64> {
    params.get(key).and_then(|v| v.as_u64())
}

/// Echoes its input back.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("echo", "Echoes the message back as output")
            .with_required("message", ParamKind::String)
            .with_timeout(Duration::from_secs(5))
            .idempotent(true)
    }

    async fn invoke(&self, params: &BTreeMap<String, Value>) -> Result<String, ToolError> {
        let message = param_str(params, "message").unwrap_or("No message provided");
        Ok(message.to_string())
    }
}

/// Evaluates an arithmetic expression.
///
/// Supports `+ - * / %` and parentheses over 64-bit floats, with a
/// unary minus. No names, no calls; anything else is an error.
pub struct CalculateTool;

#[async_trait]
impl Tool for CalculateTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("calculate", "Evaluates an arithmetic expression")
            .with_required("expression", ParamKind::String)
            .with_timeout(Duration::from_secs(5))
            .idempotent(true)
    }

    async fn invoke(&self, params: &BTreeMap<String, Value>) -> Result<String, ToolError> {
        let expression = param_str(params, "expression")
            .ok_or_else(|| ToolError::new("missing expression"))?;
        let value = eval_expression(expression)?;
        if value.fract() == 0.0 && value.abs() < 1e15 {
            Ok(format!("{}", value as i64))
        } else {
            Ok(format!("{}", value))
        }
    }
}

/// Fetches a URL and returns the leading part of its body.
pub struct HttpFetchTool {
    client: reqwest::Client,
}

impl HttpFetchTool {
    pub fn new() -> Result<Self, ToolError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .map_err(|e| ToolError::new(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Tool for HttpFetchTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("http_fetch", "Fetches a URL and returns up to 5000 characters of its body")
            .with_required("url", ParamKind::String)
            .with_optional("max_chars", ParamKind::Integer)
            .with_timeout(Duration::from_secs(30))
            .idempotent(true)
    }

    async fn invoke(&self, params: &BTreeMap<String, Value>) -> Result<String, ToolError> {
        let url = param_str(params, "url").ok_or_else(|| ToolError::new("missing url"))?;
        let cap = param_u64(params, "max_chars").unwrap_or(FETCH_BODY_CAP as u64) as usize;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ToolError::new(format!("request failed: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ToolError::new(format!("HTTP {} from {}", status, url)));
        }
        let body = response
            .text()
            .await
            .map_err(|e| ToolError::new(format!("body read failed: {}", e)))?;
        let trimmed = body.trim();
        if trimmed.is_empty() {
            return Ok("[Empty Content]".to_string());
        }
        Ok(trimmed.chars().take(cap).collect())
    }
}

/// Register the builtin tools on a registry.
pub fn register_builtin_tools(registry: &mut CapabilityRegistry) -> Result<(), ToolError> {
    registry.register(Arc::new(EchoTool));
    registry.register(Arc::new(CalculateTool));
    registry.register(Arc::new(HttpFetchTool::new()?));
    Ok(())
}

// Recursive-descent evaluator: expr -> term (('+'|'-') term)*,
// term -> factor (('*'|'/'|'%') factor)*, factor -> '-' factor |
// '(' expr ')' | number.

fn eval_expression(input: &str) -> Result<f64, ToolError> {
    let tokens = tokenize(input)?;
    let mut pos = 0;
    let value = parse_expr(&tokens, &mut pos)?;
    if pos != tokens.len() {
        return Err(ToolError::new(format!(
            "unexpected token at position {}",
            pos
        )));
    }
    Ok(value)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Number(f64),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Open,
    Close,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ToolError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let number: f64 = literal
                    .parse()
                    .map_err(|_| ToolError::new(format!("invalid number: {}", literal)))?;
                tokens.push(Token::Number(number));
            }
            other => {
                return Err(ToolError::new(format!(
                    "unsupported character in expression: '{}'",
                    other
                )))
            }
        }
    }
    Ok(tokens)
}

fn parse_expr(tokens: &[Token], pos: &mut usize) -> Result<f64, ToolError> {
    let mut value = parse_term(tokens, pos)?;
    while let Some(token) = tokens.get(*pos) {
        match token {
            Token::Plus => {
                *pos += 1;
                value += parse_term(tokens, pos)?;
            }
            Token::Minus => {
                *pos += 1;
                value -= parse_term(tokens, pos)?;
            }
            _ => break,
        }
    }
    Ok(value)
}

fn parse_term(tokens: &[Token], pos: &mut usize) -> Result<f64, ToolError> {
    let mut value = parse_factor(tokens, pos)?;
    while let Some(token) = tokens.get(*pos) {
        match token {
            Token::Star => {
                *pos += 1;
                value *= parse_factor(tokens, pos)?;
            }
            Token::Slash => {
                *pos += 1;
                let divisor = parse_factor(tokens, pos)?;
                if divisor == 0.0 {
                    return Err(ToolError::new("division by zero"));
                }
                value /= divisor;
            }
            Token::Percent => {
                *pos += 1;
                let divisor = parse_factor(tokens, pos)?;
                if divisor == 0.0 {
                    return Err(ToolError::new("modulo by zero"));
                }
                value %= divisor;
            }
            _ => break,
        }
    }
    Ok(value)
}

fn parse_factor(tokens: &[Token], pos: &mut usize) -> Result<f64, ToolError> {
    match tokens.get(*pos) {
        Some(Token::Minus) => {
            *pos += 1;
            Ok(-parse_factor(tokens, pos)?)
        }
        Some(Token::Open) => {
            *pos += 1;
            let value = parse_expr(tokens, pos)?;
            match tokens.get(*pos) {
                Some(Token::Close) => {
                    *pos += 1;
                    Ok(value)
                }
                _ => Err(ToolError::new("missing closing parenthesis")),
            }
        }
        Some(Token::Number(n)) => {
            *pos += 1;
            Ok(*n)
        }
        _ => Err(ToolError::new("expected a number or parenthesis")),
    }
}
