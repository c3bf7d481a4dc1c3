//! Completion backend seam and the OpenRouter-compatible production bridge.
//!
//! The pipeline consumes the generation service as a black box: a system
//! instruction plus context in, a single JSON object out. The bridge
//! carries a bounded timeout; callers catch failures and degrade.

use crate::config::CoachConfig;
use crate::error::{CoachError, CoachResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Generation backend contract. Production: OpenAI-compatible chat
/// completions. Tests: scripted fakes.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Force-JSON completion: the backend must return a single JSON object.
    async fn complete_json(&self, system: &str, user: &str) -> CoachResult<serde_json::Value>;

    /// Model label for retrieval/telemetry metadata.
    fn model(&self) -> &str;
}

// OpenAI-compatible request/response shapes.
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    content: String,
}

/// Reqwest-based completion bridge (OpenRouter or any OpenAI-compatible API).
pub struct CompletionBridge {
    api_key: String,
    model: String,
    api_url: String,
    client: reqwest::Client,
}

impl CompletionBridge {
    /// Build from config. Returns `None` when no API key is configured;
    /// the pipeline then runs fully deterministic.
    pub fn from_config(cfg: &CoachConfig) -> Option<Self> {
        let key = cfg.llm_api_key.as_deref()?.trim().to_string();
        if key.is_empty() {
            return None;
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Some(Self {
            api_key: key,
            model: cfg.llm_model.clone(),
            api_url: cfg.llm_api_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn chat(&self, system: &str, user: &str) -> CoachResult<String> {
        let url = format!("{}/chat/completions", self.api_url);
        let body = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            temperature: Some(0.3),
            max_tokens: Some(1024),
            response_format: Some(ResponseFormat {
                kind: "json_object".to_string(),
            }),
        };

        let res = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| CoachError::Backend(format!("completion request failed: {e}")))?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(CoachError::Backend(format!(
                "completion API error {status}: {body}"
            )));
        }

        let parsed: ChatResponse = res
            .json()
            .await
            .map_err(|e| CoachError::Parse(format!("completion response parse failed: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| CoachError::Parse("completion returned no choices".to_string()))
    }
}

#[async_trait]
impl CompletionBackend for CompletionBridge {
    async fn complete_json(&self, system: &str, user: &str) -> CoachResult<serde_json::Value> {
        let raw = self.chat(system, user).await?;
        parse_json_object(&raw)
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Parse a JSON object out of model output, tolerating surrounding prose or
/// a code fence around the object.
pub fn parse_json_object(raw: &str) -> CoachResult<serde_json::Value> {
    let trimmed = raw.trim();
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if v.is_object() {
            return Ok(v);
        }
    }
    // Fall back to the outermost brace pair.
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            if let Ok(v) = serde_json::from_str::<serde_json::Value>(&trimmed[start..=end]) {
                if v.is_object() {
                    return Ok(v);
                }
            }
        }
    }
    Err(CoachError::Parse("no JSON object in model output".to_string()))
}
