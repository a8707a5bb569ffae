use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::ai::{AiClient, AiError, ChatTurn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_ERROR_BODY: usize = 300;

/// Cliente de chat completions compatible con OpenAI
pub struct OpenAiClient {
    http: Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatTurn],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl OpenAiClient {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        temperature: f32,
        max_tokens: u32,
    ) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            temperature,
            max_tokens,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl AiClient for OpenAiClient {
    async fn complete(&self, messages: Vec<ChatTurn>) -> Result<String, AiError> {
        let body = CompletionRequest {
            model: &self.model,
            messages: &messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        debug!("🤖 Solicitando completion ({} mensajes)", messages.len());
        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AiError::Other(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let error = classify_error(status, &text);
            warn!("🤖 Error de la API de AI ({}): {}", status, error);
            return Err(error);
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| AiError::Other(format!("malformed response: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| AiError::Other("response had no content".to_string()))
    }
}

/// Maps an error response to quota / rate-limit / other.
pub fn classify_error(status: StatusCode, body: &str) -> AiError {
    let lower = body.to_lowercase();
    if lower.contains("insufficient_quota") || lower.contains("quota") {
        return AiError::Quota;
    }
    if status == StatusCode::TOO_MANY_REQUESTS || lower.contains("rate limit") || lower.contains("rate_limit") {
        return AiError::RateLimited;
    }

    let snippet: String = body.chars().take(MAX_ERROR_BODY).collect();
    AiError::Other(format!("HTTP {}: {}", status.as_u16(), snippet))
}
