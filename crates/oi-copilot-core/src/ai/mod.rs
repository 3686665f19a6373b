//! Chat-completion client seam.
//!
//! The background process is the only context that talks to the endpoint.
//! [`CompletionTransport`] hides HTTP so the streaming bridge and the one-shot
//! CALL path can be exercised against canned responses.

pub mod siliconflow;

pub use siliconflow::SiliconFlowClient;

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::state::ChatMessage;

pub const DEFAULT_ENDPOINT: &str = "https://api.siliconflow.cn/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "Qwen/Qwen2.5-7B-Instruct";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AiError {
    #[error("API Key or Model not set.")]
    MissingCredentials,
    #[error("Missing API Key")]
    MissingApiKey,
    #[error("HTTP error! status: {0}")]
    Status(u16),
    #[error("{0}")]
    Transport(String),
    #[error("invalid response body: {0}")]
    Decode(String),
    #[error("Empty response from model")]
    EmptyResponse,
}

/// Request body for the chat-completions endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    #[serde(skip)]
    pub api_key: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
}

impl CompletionRequest {
    pub fn new(api_key: &str, model: &str, messages: Vec<ChatMessage>, stream: bool) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            messages,
            stream,
        }
    }
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, AiError>> + Send>>;

/// Status line, content type and the raw body as it arrives.
pub struct TransportResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: ByteStream,
}

impl TransportResponse {
    /// A response whose body is delivered as the given chunks, in order.
    pub fn from_chunks(status: u16, content_type: Option<&str>, chunks: Vec<Vec<u8>>) -> Self {
        Self {
            status,
            content_type: content_type.map(str::to_string),
            body: Box::pin(stream::iter(chunks.into_iter().map(Ok))),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_event_stream(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.contains("stream"))
    }

    pub async fn collect_body(mut self) -> Result<Vec<u8>, AiError> {
        let mut body = Vec::new();
        while let Some(chunk) = self.body.next().await {
            body.extend_from_slice(&chunk?);
        }
        Ok(body)
    }

    pub async fn json(self) -> Result<Value, AiError> {
        let body = self.collect_body().await?;
        serde_json::from_slice(&body).map_err(|e| AiError::Decode(e.to_string()))
    }
}

#[async_trait]
pub trait CompletionTransport: Send + Sync {
    async fn send(&self, request: &CompletionRequest) -> Result<TransportResponse, AiError>;
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: Option<CompletionMessage>,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

/// Issue a non-streaming request and return the first choice's content.
pub async fn complete(
    transport: &dyn CompletionTransport,
    request: &CompletionRequest,
) -> Result<String, AiError> {
    let response = transport.send(request).await?;
    if !response.is_success() {
        return Err(AiError::Status(response.status));
    }

    let body = response.json().await?;
    let parsed: CompletionResponse =
        serde_json::from_value(body).map_err(|e| AiError::Decode(e.to_string()))?;

    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message)
        .and_then(|m| m.content)
        .filter(|content| !content.is_empty())
        .ok_or(AiError::EmptyResponse)
}

/// Text carried by one streamed chunk, or by a whole non-streamed response.
pub fn chunk_text(chunk: &Value) -> Option<&str> {
    let choice = chunk.get("choices")?.get(0)?;
    choice
        .get("delta")
        .and_then(|d| d.get("content"))
        .or_else(|| choice.get("message").and_then(|m| m.get("content")))
        .and_then(Value::as_str)
}
