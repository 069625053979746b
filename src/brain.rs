//! The language-model collaborator: one request in, raw text out.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::ModelConfig;
use crate::error::ProviderError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Prompt {
    pub messages: Vec<ChatMessage>,
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
        }
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    /// Content of the latest user turn.
    pub fn last_user(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == "user")
            .map(|message| message.content.as_str())
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Sends `prompt` constrained by the JSON `schema`; returns the raw
    /// response text.
    async fn complete(&self, prompt: &Prompt, schema: &Value) -> Result<String, ProviderError>;
}

/// Chat-completions client for OpenAI-compatible endpoints.
pub struct OpenAiBrain {
    client: Client,
    api_key: String,
    api_base: String,
    model: String,
    temperature: f32,
}

impl OpenAiBrain {
    /// Reads the key from the environment variable named in `config`.
    pub fn from_config(config: &ModelConfig) -> Result<Self, ProviderError> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ProviderError::MissingApiKey(config.api_key_env.clone()))?;
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(
        config: &ModelConfig,
        api_key: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request_body(&self, prompt: &Prompt, schema: &Value) -> Value {
        json!({
            "model": self.model,
            "messages": prompt.messages,
            "temperature": self.temperature,
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": "test_plan",
                    "strict": true,
                    "schema": schema,
                }
            }
        })
    }
}

fn response_content(body: &Value) -> Result<String, ProviderError> {
    body["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ProviderError::InvalidResponse(format!("no content in response: {body}")))
}

#[async_trait]
impl LanguageModel for OpenAiBrain {
    async fn complete(&self, prompt: &Prompt, schema: &Value) -> Result<String, ProviderError> {
        debug!(
            model = %self.model,
            messages = prompt.messages.len(),
            "sending planning request"
        );
        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&self.request_body(prompt, schema))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|value| value["error"]["message"].as_str().map(str::to_string))
                .unwrap_or(body);
            warn!(status = status.as_u16(), %message, "model API error");
            return Err(ProviderError::HttpStatus {
                status: status.as_u16(),
                body: message,
            });
        }

        let body: Value = response.json().await?;
        let content = response_content(&body)?;
        debug!(chars = content.len(), "model replied");
        Ok(content)
    }
}
