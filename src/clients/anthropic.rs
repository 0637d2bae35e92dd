//! Anthropic Messages API client.
//!
//! The whole conversation is flattened into a single user message of
//! `[role]\ncontent` sections; the system prompt rides in the top-level
//! `system` field.

use super::{
    build_upstream_http, check_response, ChatRequest, ChatResponse, ClientConfig, ClientError,
    UpstreamClient,
};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;

pub struct AnthropicClient {
    api_key: String,
    base_url: String,
    model: String,
    version: String,
    http: Client,
}

#[derive(Serialize)]
struct WireRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    system: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct WireMessage {
    role: String,
    content: Vec<WireText>,
}

#[derive(Serialize, Deserialize)]
struct WireText {
    #[serde(rename = "type")]
    kind: String,
    text: String,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    content: Vec<WireText>,
}

impl AnthropicClient {
    pub fn new(cfg: &ClientConfig) -> Self {
        let base_url = if cfg.base_url.is_empty() {
            DEFAULT_BASE_URL.to_string()
        } else {
            cfg.base_url.clone()
        };
        let version = if cfg.anthropic_version.is_empty() {
            DEFAULT_API_VERSION.to_string()
        } else {
            cfg.anthropic_version.clone()
        };
        Self {
            api_key: cfg.api_key.clone(),
            base_url,
            model: cfg.model.clone(),
            version,
            http: build_upstream_http(cfg.timeout),
        }
    }

    fn flatten_messages(request: &ChatRequest) -> String {
        let mut text = String::new();
        for m in &request.messages {
            if !text.is_empty() {
                text.push_str("\n\n");
            }
            text.push('[');
            text.push_str(&m.role);
            text.push_str("]\n");
            text.push_str(&m.content);
        }
        text
    }
}

#[async_trait]
impl UpstreamClient for AnthropicClient {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ClientError> {
        if self.api_key.is_empty() {
            return Err(ClientError::Config("Anthropic API key not set".to_string()));
        }

        let url = format!("{}/v1/messages", self.base_url);
        let max_tokens = if request.max_tokens > 0 {
            request.max_tokens
        } else {
            DEFAULT_MAX_TOKENS
        };

        let body = WireRequest {
            model: self.model.clone(),
            max_tokens,
            system: request.system.clone(),
            messages: vec![WireMessage {
                role: "user".to_string(),
                content: vec![WireText {
                    kind: "text".to_string(),
                    text: Self::flatten_messages(request),
                }],
            }],
            temperature: (request.temperature != 0.0).then_some(request.temperature),
        };

        let response = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.version)
            .json(&body)
            .send()
            .await?;
        let text = check_response(response).await?;

        let parsed: WireResponse = serde_json::from_str(&text)?;
        let first = parsed
            .content
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::InvalidResponse("response contains no content".to_string()))?;
        Ok(ChatResponse {
            content: first.text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::ChatMessage;

    #[test]
    fn flatten_tags_roles_and_joins_with_blank_lines() {
        let req = ChatRequest {
            messages: vec![
                ChatMessage {
                    role: "user".to_string(),
                    content: "hi".to_string(),
                },
                ChatMessage {
                    role: "assistant".to_string(),
                    content: "hello".to_string(),
                },
            ],
            ..Default::default()
        };
        assert_eq!(
            AnthropicClient::flatten_messages(&req),
            "[user]\nhi\n\n[assistant]\nhello"
        );
    }
}
