//! Google Gemini generateContent client.
//!
//! The prompt is assembled into a single content part from the system prompt
//! and role-tagged message sections; authentication is a `?key=` query
//! parameter.

use super::{
    build_upstream_http, check_response, ChatRequest, ChatResponse, ClientConfig, ClientError,
    UpstreamClient,
};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_MODEL: &str = "gemini-1.5-flash";

pub struct GeminiClient {
    api_key: String,
    base_url: String,
    model: String,
    http: Client,
}

#[derive(Serialize)]
struct WireRequest {
    contents: Vec<WireContent>,
    #[serde(rename = "generationConfig", skip_serializing_if = "Option::is_none")]
    generation_config: Option<WireGenConfig>,
}

#[derive(Serialize, Deserialize, Default)]
struct WireContent {
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Serialize, Deserialize)]
struct WirePart {
    text: String,
}

#[derive(Serialize)]
struct WireGenConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(rename = "maxOutputTokens", skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    candidates: Vec<WireCandidate>,
}

#[derive(Deserialize)]
struct WireCandidate {
    #[serde(default)]
    content: WireContent,
}

impl GeminiClient {
    pub fn new(cfg: &ClientConfig) -> Self {
        let base_url = if cfg.gemini_endpoint.is_empty() {
            DEFAULT_BASE_URL.to_string()
        } else {
            cfg.gemini_endpoint.clone()
        };
        let model = if cfg.model.is_empty() {
            DEFAULT_MODEL.to_string()
        } else {
            cfg.model.clone()
        };
        Self {
            api_key: cfg.api_key.clone(),
            base_url,
            model,
            http: build_upstream_http(cfg.timeout),
        }
    }

    fn assemble_prompt(request: &ChatRequest) -> String {
        let mut prompt = String::new();
        if !request.system.is_empty() {
            prompt.push_str("[System]\n");
            prompt.push_str(&request.system);
            prompt.push_str("\n\n");
        }
        for m in &request.messages {
            prompt.push('[');
            prompt.push_str(if m.role.is_empty() { "user" } else { &m.role });
            prompt.push_str("]\n");
            prompt.push_str(&m.content);
            prompt.push_str("\n\n");
        }
        prompt
    }
}

#[async_trait]
impl UpstreamClient for GeminiClient {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ClientError> {
        if self.api_key.is_empty() {
            return Err(ClientError::Config("Gemini API key not set".to_string()));
        }

        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );

        let generation_config = (request.temperature != 0.0 || request.max_tokens > 0).then(|| {
            WireGenConfig {
                temperature: (request.temperature != 0.0).then_some(request.temperature),
                max_output_tokens: (request.max_tokens > 0).then_some(request.max_tokens),
            }
        });

        let body = WireRequest {
            contents: vec![WireContent {
                parts: vec![WirePart {
                    text: Self::assemble_prompt(request),
                }],
            }],
            generation_config,
        };

        let response = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;
        let text = check_response(response).await?;

        let parsed: WireResponse = serde_json::from_str(&text)?;
        let part = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .ok_or_else(|| ClientError::InvalidResponse("response contains no candidates".to_string()))?;
        Ok(ChatResponse { content: part.text })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::ChatMessage;

    #[test]
    fn prompt_includes_system_and_role_tags() {
        let req = ChatRequest {
            system: "be brief".to_string(),
            messages: vec![ChatMessage {
                role: String::new(),
                content: "hi".to_string(),
            }],
            ..Default::default()
        };
        let prompt = GeminiClient::assemble_prompt(&req);
        assert!(prompt.starts_with("[System]\nbe brief\n\n"));
        assert!(prompt.contains("[user]\nhi\n\n"));
    }
}
