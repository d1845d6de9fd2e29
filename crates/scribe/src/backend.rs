//! LLM backend for the Scribe call
//!
//! OpenAI-compatible chat completion with retry and per-call timeout. The
//! Scribe is the only LLM the core invokes directly; response synthesis and
//! judging live outside the engine.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::ScribeError;

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// Chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Minimal generation backend seam; mocked in tests
#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn generate(&self, messages: &[ChatMessage]) -> Result<String, ScribeError>;

    fn model_name(&self) -> &str;
}

/// Configuration for the OpenAI-compatible backend
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub max_tokens: usize,
    pub temperature: f32,
    pub timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434/v1".to_string(),
            model: "gemini-2.0-flash".to_string(),
            api_key: None,
            max_tokens: 768,
            temperature: 0.0,
            timeout: Duration::from_secs(20),
            max_retries: 2,
            initial_backoff: Duration::from_millis(100),
        }
    }
}

/// OpenAI-compatible chat backend (OpenAI, Azure, vLLM, Ollama, gateways)
pub struct OpenAiChatBackend {
    client: Client,
    config: ChatConfig,
}

impl OpenAiChatBackend {
    pub fn new(config: ChatConfig) -> Result<Self, ScribeError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ScribeError::Configuration(format!("HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    fn chat_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.endpoint.trim_end_matches('/')
        )
    }

    fn is_retryable(err: &ScribeError) -> bool {
        matches!(err, ScribeError::Network(_) | ScribeError::Timeout)
    }

    async fn execute(&self, messages: &[ChatMessage]) -> Result<String, ScribeError> {
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: messages.to_vec(),
            max_tokens: Some(self.config.max_tokens),
            temperature: Some(self.config.temperature),
            stream: Some(false),
        };

        let mut builder = self.client.post(self.chat_url()).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.is_server_error() {
                return Err(ScribeError::Network(format!("HTTP {status}: {body}")));
            }
            return Err(ScribeError::Api(format!("HTTP {status}: {body}")));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ScribeError::InvalidResponse(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ScribeError::InvalidResponse("no choices in response".into()))
    }
}

#[async_trait]
impl LlmBackend for OpenAiChatBackend {
    async fn generate(&self, messages: &[ChatMessage]) -> Result<String, ScribeError> {
        let mut backoff = self.config.initial_backoff;
        let mut last_err = None;
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tracing::warn!(
                    attempt,
                    max = self.config.max_retries,
                    "scribe request failed, retrying in {:?}",
                    backoff
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            match self.execute(messages).await {
                Ok(text) => return Ok(text),
                Err(e) if Self::is_retryable(&e) => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or(ScribeError::Timeout))
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_url() {
        let backend = OpenAiChatBackend::new(ChatConfig {
            endpoint: "https://llm.internal/v1/".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(backend.chat_url(), "https://llm.internal/v1/chat/completions");
    }

    #[test]
    fn test_request_serialization() {
        let request = ChatRequest {
            model: "m".into(),
            messages: vec![ChatMessage::user("hello")],
            max_tokens: Some(768),
            temperature: Some(0.0),
            stream: Some(false),
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"role\":\"user\""));
        assert!(json.contains("max_tokens"));
    }

    #[test]
    fn test_default_config_matches_contract() {
        let cfg = ChatConfig::default();
        assert_eq!(cfg.max_tokens, 768);
        assert_eq!(cfg.temperature, 0.0);
    }
}
