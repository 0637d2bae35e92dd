//! Deterministic mock client for local development and tests.

use super::{ChatRequest, ChatResponse, ClientError, UpstreamClient};
use async_trait::async_trait;

const MOCK_CONTENT: &str =
    r#"{"story_segment":"Locally mocked story segment for development.","highlight_task_ids":[],"proposals":[]}"#;

pub struct MockClient;

#[async_trait]
impl UpstreamClient for MockClient {
    async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse, ClientError> {
        Ok(ChatResponse {
            content: MOCK_CONTENT.to_string(),
        })
    }
}
