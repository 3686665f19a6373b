use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;

use super::{AiError, CompletionRequest, CompletionTransport, TransportResponse, DEFAULT_ENDPOINT};

/// OpenAI-style chat-completions endpoint (SiliconFlow by default).
#[derive(Clone)]
pub struct SiliconFlowClient {
    client: Client,
    endpoint: String,
}

impl Default for SiliconFlowClient {
    fn default() -> Self {
        Self::new(DEFAULT_ENDPOINT)
    }
}

impl SiliconFlowClient {
    pub fn new(endpoint: &str) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.to_string(),
        }
    }

    pub fn list_models() -> Vec<String> {
        vec![
            "Qwen/Qwen2.5-7B-Instruct".to_string(),
            "Qwen/Qwen2.5-72B-Instruct".to_string(),
            "deepseek-ai/DeepSeek-V3".to_string(),
            "THUDM/glm-4-9b-chat".to_string(),
        ]
    }
}

#[async_trait]
impl CompletionTransport for SiliconFlowClient {
    async fn send(&self, request: &CompletionRequest) -> Result<TransportResponse, AiError> {
        tracing::debug!(
            endpoint = %self.endpoint,
            model = %request.model,
            stream = request.stream,
            messages = request.messages.len(),
            "sending completion request"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", request.api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| AiError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = response.bytes_stream().map(|chunk| {
            chunk
                .map(|bytes| bytes.to_vec())
                .map_err(|e| AiError::Transport(e.to_string()))
        });

        Ok(TransportResponse {
            status,
            content_type,
            body: Box::pin(body),
        })
    }
}
