//! OpenAI-compatible chat-completions client.
//!
//! Works against any endpoint implementing the `/chat/completions`
//! surface; the base URL is configurable for self-hosted backends.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use formwork_core::types::StageId;

use crate::{GenerationError, GenerationRequest, StageGenerator};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct OpenAiGeneratorConfig {
    /// API key for authentication.
    pub api_key: String,
    /// Model name (e.g. "gpt-4o-mini").
    pub model: String,
    /// Base endpoint URL.
    pub base_url: String,
    /// Temperature for generation (0.0 - 2.0).
    pub temperature: f32,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for OpenAiGeneratorConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            temperature: 0.2,
            timeout_secs: 60,
        }
    }
}

/// OpenAI-compatible stage generator.
pub struct OpenAiGenerator {
    client: reqwest::Client,
    config: OpenAiGeneratorConfig,
}

impl OpenAiGenerator {
    pub fn new(config: OpenAiGeneratorConfig) -> Result<Self, GenerationError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GenerationError::Http(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn build_url(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

/// Terse per-stage system instruction. Deployments replace these with
/// their own prompt sets; the engine only depends on the markers.
fn stage_instruction(stage: StageId) -> &'static str {
    match stage {
        StageId::Analysis => "Decompose the objective in the document into its key questions and constraints.",
        StageId::Candidates => "Draft candidate strategies for this objective, reusing the catalogue entries where they fit.",
        StageId::Selection => "Select or merge one strategy. Start your output with a 'SOURCE: library|novel|merged' line.",
        StageId::LibraryUpgrade => "Evaluate whether the selected strategy belongs in the library. Answer with DECISION/ACTION/CATEGORY/REFERENCE_IDS metadata and a '####' entry draft.",
        StageId::Planning => "Write a numbered plan. Mark each step '[pending]' and bind tool steps to an indented [TOOL_CALL] block.",
        StageId::Execution => "Continue executing the plan. Emit exactly one [TOOL_CALL] block, or 'Final Answer:' followed by the answer when the plan is complete.",
    }
}

// Chat-completions request/response structures

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Option<Vec<ChatChoice>>,
    error: Option<ChatErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatErrorDetail {
    message: String,
    #[allow(dead_code)]
    code: Option<serde_json::Value>,
}

#[async_trait]
impl StageGenerator for OpenAiGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<String, GenerationError> {
        let mut user = request.document.render();
        if let Some(extra) = &request.extra_context {
            user.push_str("\n");
            user.push_str(extra);
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if !self.config.api_key.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {}", self.config.api_key))
                .map_err(|e| GenerationError::Http(e.to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }

        let body = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: stage_instruction(request.stage).to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user,
                },
            ],
            temperature: self.config.temperature,
        };

        tracing::debug!(stage = %request.stage, model = %self.config.model, "requesting completion");
        let response = self
            .client
            .post(self.build_url())
            .headers(headers)
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::Http(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(GenerationError::Response(format!("HTTP {}: {}", status, text)));
        }

        let text = response
            .text()
            .await
            .map_err(|e| GenerationError::Http(e.to_string()))?;
        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| GenerationError::Serialization(e.to_string()))?;

        if let Some(error) = parsed.error {
            return Err(GenerationError::Response(format!(
                "API error: {}",
                error.message
            )));
        }

        parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| GenerationError::Response("No content in response".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use formwork_core::types::Document;

    #[test]
    fn test_default_config() {
        let config = OpenAiGeneratorConfig::default();
        assert_eq!(config.model, "gpt-4o-mini");
        assert!(config.base_url.contains("api.openai.com"));
    }

    #[test]
    fn test_build_url_trims_trailing_slash() {
        let config = OpenAiGeneratorConfig {
            base_url: "http://localhost:8080/v1/".to_string(),
            ..Default::default()
        };
        let generator = OpenAiGenerator::new(config).unwrap();
        assert_eq!(generator.build_url(), "http://localhost:8080/v1/chat/completions");
    }

    #[test]
    fn test_every_stage_has_an_instruction() {
        for stage in [
            StageId::Analysis,
            StageId::Candidates,
            StageId::Selection,
            StageId::LibraryUpgrade,
            StageId::Planning,
            StageId::Execution,
        ] {
            assert!(!stage_instruction(stage).is_empty());
        }
    }

    #[tokio::test]
    #[ignore = "requires live OPENAI_API_KEY and network"]
    async fn test_live_completion_when_env_set() {
        let api_key = match std::env::var("OPENAI_API_KEY") {
            Ok(v) if !v.trim().is_empty() => v,
            _ => {
                eprintln!("skipped: OPENAI_API_KEY is not set");
                return;
            }
        };

        let config = OpenAiGeneratorConfig {
            api_key,
            ..Default::default()
        };
        let generator = OpenAiGenerator::new(config).expect("client should initialize");
        let mut document = Document::new();
        document.apply_revision(
            formwork_core::types::SectionName::objective(),
            "Reply with exactly: OK",
            formwork_core::types::WriterId::intake(),
            1,
        );
        let response = generator
            .generate(GenerationRequest::new(StageId::Analysis, document))
            .await
            .expect("live completion should succeed");
        assert!(!response.trim().is_empty());
    }
}
