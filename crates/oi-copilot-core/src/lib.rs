pub mod ai;
pub mod annotate;
pub mod background;
pub mod bridge;
pub mod chat;
pub mod config;
pub mod dom;
pub mod glossary;
pub mod hub;
pub mod menus;
pub mod messages;
pub mod page;
pub mod relay;
pub mod render;
pub mod rewrite;
pub mod state;
pub mod store;

// Re-export main types for convenience
pub use ai::{AiError, CompletionTransport, SiliconFlowClient};
pub use background::{Background, MenuEffect};
pub use bridge::{StreamBridge, StreamReader, StreamUpdate};
pub use chat::{AskOutcome, AskSession};
pub use config::{Config, Credentials};
pub use dom::{Document, Selection};
pub use glossary::AnnotationMap;
pub use hub::{Hub, HubClient};
pub use menus::{MenuItem, MenuSettings};
pub use messages::{ContextId, PageCommand, PageReply, Request, Response};
pub use page::{PageExit, PageSession};
pub use relay::{ActionKind, ActionRelay, PendingAction};
pub use rewrite::{RewriteEngine, RewriteOutcome};
pub use state::{ChatMessage, ChatRole};
pub use store::{JsonFileStore, KeyValueStore, MemoryStore, Stores};
