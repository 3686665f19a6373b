//! Typed one-shot messages between the background process and pages.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::state::ChatMessage;

/// Names one page instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Requests handled by the background process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Which context am I? Only answerable for page senders.
    GetContextId,
    Ping,
    /// Non-streaming completion.
    CallAi { messages: Vec<ChatMessage> },
    /// Menu toggles changed.
    UpdateMenus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    ContextId(ContextId),
    Pong { timestamp: i64 },
    Completion(Result<String, String>),
    Ack,
    Error(String),
}

/// Commands the background (or the popup) sends to a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageCommand {
    Ping,
    ProcessPending,
    AnnotationAdded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageReply {
    Pong { url: String, timestamp: i64 },
    Processed { done: bool },
    /// The page must be rebuilt from scratch.
    Reload,
}

/// Milliseconds since the epoch, used for liveness replies.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
