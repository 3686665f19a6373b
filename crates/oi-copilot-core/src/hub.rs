//! In-process message runtime.
//!
//! Stands in for the browser's extension messaging: pages register under a
//! fresh [`ContextId`], one-shot requests travel over mpsc with a oneshot
//! reply, and streaming ports are handed to the background as they open.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::debug;

use crate::background::{BackgroundInbox, BackgroundMessage};
use crate::bridge::{port_pair, StreamConnector, StreamReader, AI_STREAM_PORT};
use crate::messages::{ContextId, PageCommand, PageReply, Request, Response};
use crate::relay::{ContextLookup, DeliveryError, PageMessenger, RelayError};
use crate::rewrite::Completion;
use crate::state::ChatMessage;

/// Messages delivered to a page.
pub enum PageMessage {
    Command {
        command: PageCommand,
        reply: oneshot::Sender<PageReply>,
    },
    /// Injected call to the page's drain handler.
    RunDrain,
}

pub type PageInbox = mpsc::UnboundedReceiver<PageMessage>;

struct PageEntry {
    url: String,
    inbox: mpsc::UnboundedSender<PageMessage>,
    listening: bool,
}

#[derive(Clone)]
pub struct Hub {
    pages: Arc<RwLock<HashMap<ContextId, PageEntry>>>,
    next_id: Arc<AtomicU64>,
    background: mpsc::UnboundedSender<BackgroundMessage>,
}

impl Hub {
    /// The hub plus the inbox the background should run on.
    pub fn new() -> (Self, BackgroundInbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let hub = Self {
            pages: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            background: tx,
        };
        (hub, rx)
    }

    /// Registers a page. It receives commands only after [`Hub::listen`].
    pub async fn open_page(&self, url: &str) -> (ContextId, PageInbox) {
        let ctx = ContextId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.pages.write().await.insert(
            ctx,
            PageEntry {
                url: url.to_string(),
                inbox: tx,
                listening: false,
            },
        );
        debug!(%ctx, url, "page opened");
        (ctx, rx)
    }

    /// Marks the page's command listener as installed.
    pub async fn listen(&self, ctx: ContextId) {
        if let Some(entry) = self.pages.write().await.get_mut(&ctx) {
            entry.listening = true;
        }
    }

    pub async fn close_page(&self, ctx: ContextId) {
        if self.pages.write().await.remove(&ctx).is_some() {
            debug!(%ctx, "page closed");
        }
    }

    pub async fn pages(&self) -> Vec<(ContextId, String)> {
        let mut pages: Vec<_> = self
            .pages
            .read()
            .await
            .iter()
            .map(|(ctx, entry)| (*ctx, entry.url.clone()))
            .collect();
        pages.sort();
        pages
    }

    /// A client speaking for `sender` (`None` for non-page callers).
    pub fn client(&self, sender: Option<ContextId>) -> HubClient {
        HubClient {
            hub: self.clone(),
            sender,
        }
    }

    pub fn messenger(&self) -> HubMessenger {
        HubMessenger { hub: self.clone() }
    }

    pub async fn send_to_page(&self, ctx: ContextId, command: PageCommand) -> Result<PageReply, DeliveryError> {
        let (reply, rx) = oneshot::channel();
        {
            let pages = self.pages.read().await;
            let entry = pages.get(&ctx).filter(|e| e.listening).ok_or(DeliveryError::NoReceiver)?;
            entry
                .inbox
                .send(PageMessage::Command { command, reply })
                .map_err(|_| DeliveryError::NoReceiver)?;
        }
        rx.await.map_err(|_| DeliveryError::Closed)
    }

    async fn inject(&self, ctx: ContextId) -> Result<(), DeliveryError> {
        let pages = self.pages.read().await;
        let entry = pages.get(&ctx).ok_or(DeliveryError::NoReceiver)?;
        entry
            .inbox
            .send(PageMessage::RunDrain)
            .map_err(|_| DeliveryError::NoReceiver)
    }
}

/// Background → page delivery through the hub.
#[derive(Clone)]
pub struct HubMessenger {
    hub: Hub,
}

#[async_trait]
impl PageMessenger for HubMessenger {
    async fn send_command(&self, ctx: ContextId, command: PageCommand) -> Result<PageReply, DeliveryError> {
        self.hub.send_to_page(ctx, command).await
    }

    async fn inject_drain(&self, ctx: ContextId) -> Result<(), DeliveryError> {
        self.hub.inject(ctx).await
    }
}

/// Page (or settings/popup) → background requests through the hub.
#[derive(Clone)]
pub struct HubClient {
    hub: Hub,
    sender: Option<ContextId>,
}

impl HubClient {
    pub async fn request(&self, request: Request) -> Result<Response, DeliveryError> {
        let (reply, rx) = oneshot::channel();
        self.hub
            .background
            .send(BackgroundMessage::Request {
                sender: self.sender,
                request,
                reply,
            })
            .map_err(|_| DeliveryError::NoReceiver)?;
        rx.await.map_err(|_| DeliveryError::Closed)
    }
}

#[async_trait]
impl ContextLookup for HubClient {
    async fn current_context(&self) -> Result<ContextId, RelayError> {
        match self.request(Request::GetContextId).await {
            Ok(Response::ContextId(ctx)) => Ok(ctx),
            Ok(Response::Error(message)) => Err(RelayError::NoContext(message)),
            Ok(other) => Err(RelayError::NoContext(format!("unexpected reply: {other:?}"))),
            Err(e) => Err(RelayError::NoContext(e.to_string())),
        }
    }
}

#[async_trait]
impl Completion for HubClient {
    async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String, String> {
        match self.request(Request::CallAi { messages }).await {
            Ok(Response::Completion(result)) => result,
            Ok(Response::Error(message)) => Err(message),
            Ok(other) => Err(format!("unexpected reply: {other:?}")),
            Err(e) => Err(e.to_string()),
        }
    }
}

#[async_trait]
impl StreamConnector for HubClient {
    async fn open_stream(&self, messages: Vec<ChatMessage>) -> Result<StreamReader, String> {
        let (page, background) = port_pair(AI_STREAM_PORT);
        self.hub
            .background
            .send(BackgroundMessage::Connect(background))
            .map_err(|_| DeliveryError::NoReceiver.to_string())?;
        Ok(page.call(messages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::testing::ScriptedTransport;
    use crate::background::Background;
    use crate::bridge::StreamUpdate;
    use crate::store::{keys, Stores};
    use serde_json::json;

    fn start(transport: ScriptedTransport, stores: Stores) -> Hub {
        let (hub, inbox) = Hub::new();
        let background = Background::new(stores, Arc::new(transport), Arc::new(hub.messenger()));
        tokio::spawn(background.run(inbox));
        hub
    }

    #[tokio::test]
    async fn test_context_lookup_round_trip() {
        let hub = start(ScriptedTransport::new(), Stores::in_memory());
        let (ctx, _inbox) = hub.open_page("https://oi-wiki.org/").await;

        assert_eq!(hub.client(Some(ctx)).current_context().await.unwrap(), ctx);
        assert!(matches!(
            hub.client(None).current_context().await,
            Err(RelayError::NoContext(ref m)) if m == "Sender is not a tab."
        ));
    }

    #[tokio::test]
    async fn test_commands_need_a_listener() {
        let (hub, _inbox) = Hub::new();
        let (ctx, mut page) = hub.open_page("https://oi-wiki.org/").await;
        let messenger = hub.messenger();

        assert_eq!(
            messenger.send_command(ctx, PageCommand::Ping).await,
            Err(DeliveryError::NoReceiver)
        );
        messenger.inject_drain(ctx).await.unwrap();
        assert!(matches!(page.recv().await, Some(PageMessage::RunDrain)));

        hub.listen(ctx).await;
        let responder = tokio::spawn(async move {
            if let Some(PageMessage::Command { reply, .. }) = page.recv().await {
                reply.send(PageReply::Processed { done: true }).unwrap();
            }
        });
        assert_eq!(messenger.process_pending(ctx).await, Ok(true));
        responder.await.unwrap();

        hub.close_page(ctx).await;
        assert_eq!(
            messenger.inject_drain(ctx).await,
            Err(DeliveryError::NoReceiver)
        );
    }

    #[tokio::test]
    async fn test_stream_through_hub() {
        let transport = ScriptedTransport::new();
        transport.push(Ok(crate::ai::TransportResponse::from_chunks(
            200,
            Some("text/event-stream"),
            vec![
                format!("data: {}\n\n", json!({"choices": [{"delta": {"content": "你好"}}]})).into_bytes(),
                b"data: [DONE]\n\n".to_vec(),
            ],
        )));
        let stores = Stores::in_memory();
        stores.synced.set(keys::API_KEY, json!("sk")).await.unwrap();
        stores.synced.set(keys::MODEL_ID, json!("m")).await.unwrap();
        let hub = start(transport, stores);

        let mut reader = hub
            .client(Some(ContextId(1)))
            .open_stream(vec![ChatMessage::user("hi")])
            .await
            .unwrap();
        let mut last = None;
        while let Some(update) = reader.next().await {
            last = Some(update);
        }
        assert_eq!(last, Some(StreamUpdate::Done("你好".into())));
    }

    #[tokio::test]
    async fn test_completion_through_hub() {
        let transport = ScriptedTransport::new();
        transport.push_json(500, json!({}));
        let stores = Stores::in_memory();
        stores.synced.set(keys::API_KEY, json!("sk")).await.unwrap();
        let hub = start(transport, stores);

        let result = hub.client(Some(ContextId(1))).complete(vec![ChatMessage::user("x")]).await;
        assert_eq!(result, Err("HTTP error! status: 500".into()));
    }
}
