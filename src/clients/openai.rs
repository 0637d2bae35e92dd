//! OpenAI chat-completions client, also used for any OpenAI-compatible
//! gateway (same wire shape, Bearer auth, custom base URL).

use super::{
    build_upstream_http, check_response, ChatRequest, ChatResponse, ClientConfig, ClientError,
    UpstreamClient,
};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

pub struct OpenAiClient {
    api_key: String,
    base_url: String,
    model: String,
    http: Client,
}

#[derive(Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
}

impl OpenAiClient {
    pub fn new(cfg: &ClientConfig) -> Self {
        let base_url = if cfg.base_url.is_empty() {
            DEFAULT_BASE_URL.to_string()
        } else {
            cfg.base_url.clone()
        };
        Self {
            api_key: cfg.api_key.clone(),
            base_url,
            model: cfg.model.clone(),
            http: build_upstream_http(cfg.timeout),
        }
    }
}

#[async_trait]
impl UpstreamClient for OpenAiClient {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ClientError> {
        if self.api_key.is_empty() {
            return Err(ClientError::Config("OpenAI API key not set".to_string()));
        }

        let url = format!("{}/v1/chat/completions", self.base_url);

        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if !request.system.is_empty() {
            messages.push(WireMessage {
                role: "system".to_string(),
                content: request.system.clone(),
            });
        }
        for m in &request.messages {
            let role = if m.role.is_empty() { "user" } else { &m.role };
            messages.push(WireMessage {
                role: role.to_string(),
                content: m.content.clone(),
            });
        }

        let body = WireRequest {
            model: self.model.clone(),
            messages,
            temperature: (request.temperature != 0.0).then_some(request.temperature),
            max_tokens: (request.max_tokens > 0).then_some(request.max_tokens),
        };

        let response = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;
        let text = check_response(response).await?;

        let parsed: WireResponse = serde_json::from_str(&text)?;
        let first = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::InvalidResponse("response contains no choices".to_string()))?;
        Ok(ChatResponse {
            content: first.message.content,
        })
    }
}
