//! Upstream LLM wire clients.
//!
//! One [`UpstreamClient`] per configured endpoint, built from the endpoint's
//! [`ClientConfig`]. Each implementation owns its provider's request/response
//! framing; the dispatch core only sees `chat(req) -> resp | err`.

pub mod anthropic;
pub mod gemini;
pub mod mock;
pub mod openai;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub use anthropic::AnthropicClient;
pub use gemini::GeminiClient;
pub use mock::MockClient;
pub use openai::OpenAiClient;

/// Connect-phase budget for all upstream clients. Total request time is
/// bounded separately by the endpoint's `timeout_seconds`.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Upstream provider family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[default]
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "openai_compatible")]
    OpenAiCompatible,
    Anthropic,
    Gemini,
    Mock,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::OpenAiCompatible => "openai_compatible",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Mock => "mock",
        };
        f.write_str(s)
    }
}

/// Errors produced by upstream clients.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("client configuration error: {0}")]
    Config(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream error: status={status}, body={body}")]
    Api { status: u16, body: String },

    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One turn of a conversation. An empty role is sent as `user`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Provider-agnostic chat request. Zero `temperature` / `max_tokens` mean
/// "not set" and are omitted from the wire encodings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// One completed upstream answer. Streaming is out of scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
}

/// Everything a client needs, lifted from the endpoint's `ProviderConfig`.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub provider: ProviderKind,
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
    pub anthropic_version: String,
    pub gemini_endpoint: String,
}

/// Capability the dispatch core depends on: one call, one completed answer.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ClientError>;
}

/// Build a tuned reqwest::Client for upstream calls.
///
/// Applies TCP_NODELAY, a connect timeout, connection pooling and the
/// endpoint's total request timeout.
pub(crate) fn build_upstream_http(timeout: Duration) -> Client {
    let timeout = if timeout.is_zero() {
        Duration::from_secs(30)
    } else {
        timeout
    };
    Client::builder()
        .tcp_nodelay(true)
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_max_idle_per_host(20)
        .pool_idle_timeout(Duration::from_secs(90))
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Construct the client for a provider kind. Fails only on unusable config;
/// missing API keys surface at call time so a misconfigured endpoint can
/// still be registered and reported in status.
pub fn new_client(cfg: &ClientConfig) -> Result<Arc<dyn UpstreamClient>, ClientError> {
    match cfg.provider {
        ProviderKind::OpenAi | ProviderKind::OpenAiCompatible => {
            Ok(Arc::new(OpenAiClient::new(cfg)))
        }
        ProviderKind::Anthropic => Ok(Arc::new(AnthropicClient::new(cfg))),
        ProviderKind::Gemini => Ok(Arc::new(GeminiClient::new(cfg))),
        ProviderKind::Mock => Ok(Arc::new(MockClient)),
    }
}

/// Read the body and map a non-2xx response to `ClientError::Api`.
pub(crate) async fn check_response(response: reqwest::Response) -> Result<String, ClientError> {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(ClientError::Api {
            status: status.as_u16(),
            body,
        });
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_kind_round_trips_through_serde() {
        let kind: ProviderKind = serde_json::from_str("\"openai_compatible\"").unwrap();
        assert_eq!(kind, ProviderKind::OpenAiCompatible);
        assert_eq!(
            serde_json::to_string(&ProviderKind::Gemini).unwrap(),
            "\"gemini\""
        );
    }

    #[test]
    fn new_client_covers_every_kind() {
        for kind in [
            ProviderKind::OpenAi,
            ProviderKind::OpenAiCompatible,
            ProviderKind::Anthropic,
            ProviderKind::Gemini,
            ProviderKind::Mock,
        ] {
            let cfg = ClientConfig {
                provider: kind,
                api_key: "key".to_string(),
                model: "m".to_string(),
                timeout: Duration::from_secs(5),
                ..Default::default()
            };
            assert!(new_client(&cfg).is_ok(), "{kind} should construct");
        }
    }
}
