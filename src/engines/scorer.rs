//! Scoring engine client (OpenAI-compatible chat completions).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::EngineError;

/// One scoring completion: system prompt + conversation text in, raw model
/// text out. Retry and parsing live in the pipeline, which also decides
/// when a failure degrades to "no analysis".
#[async_trait]
pub trait CallScorer: Send + Sync {
    /// False when no API key is configured.
    fn is_available(&self) -> bool;

    /// Label stored with each persisted analysis.
    fn model_label(&self) -> &str;

    async fn score(&self, system_prompt: &str, user_message: &str)
        -> Result<String, EngineError>;
}

/// Client for any service implementing the OpenAI chat completions API.
pub struct ChatScorer {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl ChatScorer {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout_sec: u64,
    ) -> Self {
        let api_key = api_key.filter(|k| !k.trim().is_empty());
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            api_key,
            timeout: Duration::from_secs(timeout_sec),
        }
    }
}

#[async_trait]
impl CallScorer for ChatScorer {
    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    fn model_label(&self) -> &str {
        &self.model
    }

    async fn score(
        &self,
        system_prompt: &str,
        user_message: &str,
    ) -> Result<String, EngineError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| EngineError::Connection("API key not configured".to_string()))?;

        let url = format!("{}/chat/completions", self.base_url);
        let request = ChatRequest {
            model: &self.model,
            temperature: 0.0,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: user_message,
                },
            ],
        };

        debug!(model = %self.model, "requesting call scoring completion");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&request)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(EngineError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| EngineError::InvalidResponse(format!("chat response: {e}")))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::InvalidResponse("no choices in response".to_string()))?;

        Ok(choice.message.content.unwrap_or_default())
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_means_unavailable() {
        let scorer = ChatScorer::new("http://x/v1", "gpt-4", None, 60);
        assert!(!scorer.is_available());

        let scorer = ChatScorer::new("http://x/v1", "gpt-4", Some("".to_string()), 60);
        assert!(!scorer.is_available());

        let scorer = ChatScorer::new("http://x/v1", "gpt-4", Some("sk-123".to_string()), 60);
        assert!(scorer.is_available());
        assert_eq!(scorer.model_label(), "gpt-4");
    }

    #[test]
    fn chat_response_extracts_first_choice() {
        let json = r#"{"choices": [
            {"message": {"content": "{\"standard\": 80}"}},
            {"message": {"content": "ignored"}}
        ]}"#;
        let parsed: ChatResponse = serde_json::from_str(json).unwrap();
        let first = parsed.choices.into_iter().next().unwrap();
        assert_eq!(first.message.content.as_deref(), Some("{\"standard\": 80}"));
    }

    #[test]
    fn chat_request_serializes_messages_in_order() {
        let request = ChatRequest {
            model: "gpt-4",
            temperature: 0.0,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: "be strict",
                },
                ChatMessage {
                    role: "user",
                    content: "score this",
                },
            ],
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.find("system").unwrap() < json.find("user").unwrap());
    }
}
