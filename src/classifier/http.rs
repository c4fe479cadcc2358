//! OpenAI-compatible chat-completions classification provider.
//!
//! Speaks the standard `/v1/chat/completions` wire shape with bearer-token
//! auth, so any compatible endpoint can serve as the classification
//! capability.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::classifier::provider::ClassifierProvider;
use crate::error::{ClassifierError, Result};

/// Connection settings for the HTTP classification provider.
#[derive(Debug, Clone)]
pub struct HttpClassifierConfig {
    /// Base URL of the endpoint, e.g. `https://api.example.com`.
    pub base_url: String,
    /// Bearer token for the Authorization header.
    pub api_key: Option<SecretString>,
    /// Model identifier to request.
    pub model: String,
}

/// HTTP classification provider.
pub struct HttpClassifierProvider {
    client: Client,
    config: HttpClassifierConfig,
}

impl HttpClassifierProvider {
    /// Create a provider with API key auth.
    pub fn new(config: HttpClassifierConfig) -> Result<Self> {
        if config.api_key.is_none() {
            return Err(ClassifierError::AuthFailed {
                provider: "http_chat".to_string(),
            });
        }

        // The classifier wraps calls in its own sub-second timeout; this one
        // is a backstop against a wedged connection pool.
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());

        Ok(Self { client, config })
    }

    fn api_url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    fn api_key(&self) -> String {
        self.config
            .api_key
            .as_ref()
            .map(|k| k.expose_secret().to_string())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ClassifierProvider for HttpClassifierProvider {
    async fn complete(
        &self,
        system_instruction: &str,
        content: &str,
        max_tokens: u32,
    ) -> Result<String> {
        let url = self.api_url();
        let request = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatCompletionMessage {
                    role: "system".to_string(),
                    content: system_instruction.to_string(),
                },
                ChatCompletionMessage {
                    role: "user".to_string(),
                    content: content.to_string(),
                },
            ],
            temperature: 0.0,
            max_tokens,
        };

        tracing::debug!(url = %url, model = %self.config.model, "sending classification request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key()))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| ClassifierError::RequestFailed {
                provider: "http_chat".to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        let response_text = response.text().await.unwrap_or_default();

        tracing::debug!(status = %status, "classification response received");

        if !status.is_success() {
            if status.as_u16() == 401 {
                return Err(ClassifierError::AuthFailed {
                    provider: "http_chat".to_string(),
                });
            }
            if status.as_u16() == 429 {
                return Err(ClassifierError::RateLimited {
                    provider: "http_chat".to_string(),
                });
            }
            return Err(ClassifierError::RequestFailed {
                provider: "http_chat".to_string(),
                reason: format!("HTTP {}: {}", status, response_text),
            });
        }

        let parsed: ChatCompletionResponse =
            serde_json::from_str(&response_text).map_err(|e| ClassifierError::InvalidResponse {
                provider: "http_chat".to_string(),
                reason: format!("JSON parse error: {}", e),
            })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ClassifierError::InvalidResponse {
                provider: "http_chat".to_string(),
                reason: "no choices in response".to_string(),
            })?;

        choice
            .message
            .and_then(|m| m.content)
            .ok_or_else(|| ClassifierError::InvalidResponse {
                provider: "http_chat".to_string(),
                reason: "empty message content".to_string(),
            })
    }

    fn name(&self) -> &str {
        "http_chat"
    }
}

// OpenAI-compatible chat-completions wire types, trimmed to what the
// classifier needs.

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatCompletionMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatCompletionMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    message: Option<ChatCompletionResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponseMessage {
    content: Option<String>,
}
