//! The privileged background process.
//!
//! Holds credentials, answers one-shot requests, serves streaming ports,
//! reacts to context menu clicks and seeds storage on install.

use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::ai::{self, AiError, CompletionRequest, CompletionTransport, DEFAULT_MODEL};
use crate::bridge::{BackgroundPort, StreamBridge};
use crate::config::Credentials;
use crate::glossary::{self, AnnotationMap};
use crate::menus::{MenuItem, MenuSettings};
use crate::messages::{now_millis, ContextId, PageCommand, PageReply, Request, Response};
use crate::relay::{ActionKind, ActionRelay, DeliveryError, DeliveryOutcome, PageMessenger, PendingSlot, RelayError};
use crate::state::ChatMessage;
use crate::store::{StoreError, Stores};

pub const SEARCH_URL: &str = "https://oi-wiki.org/?q=";

pub fn search_url(text: &str) -> String {
    format!("{SEARCH_URL}{}", urlencoding::encode(text))
}

/// What a menu click asks the host to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MenuEffect {
    None,
    /// Ask the user for an explanation of `keyword` inside page `target`.
    PromptAnnotation { target: ContextId, keyword: String },
    OpenUrl(String),
    Queued(DeliveryOutcome),
}

/// Messages arriving at the background's inbox.
pub enum BackgroundMessage {
    Request {
        sender: Option<ContextId>,
        request: Request,
        reply: tokio::sync::oneshot::Sender<Response>,
    },
    Connect(BackgroundPort),
}

pub type BackgroundInbox = mpsc::UnboundedReceiver<BackgroundMessage>;

#[derive(Clone)]
pub struct Background {
    stores: Stores,
    transport: Arc<dyn CompletionTransport>,
    messenger: Arc<dyn PageMessenger>,
    relay: ActionRelay,
    bridge: StreamBridge,
    menus: Arc<RwLock<Vec<MenuItem>>>,
    default_model: String,
}

impl Background {
    pub fn new(
        stores: Stores,
        transport: Arc<dyn CompletionTransport>,
        messenger: Arc<dyn PageMessenger>,
    ) -> Self {
        let relay = ActionRelay::new(PendingSlot::new(&stores), messenger.clone());
        let bridge = StreamBridge::new(transport.clone(), stores.synced.clone());
        Self {
            stores,
            transport,
            messenger,
            relay,
            bridge,
            menus: Arc::new(RwLock::new(MenuItem::ALL.to_vec())),
            default_model: DEFAULT_MODEL.to_string(),
        }
    }

    /// Model used by one-shot calls when none is configured.
    pub fn with_default_model(mut self, model: &str) -> Self {
        self.default_model = model.to_string();
        self
    }

    pub fn relay(&self) -> &ActionRelay {
        &self.relay
    }

    /// Entries currently offered in the context menu.
    pub async fn menus(&self) -> Vec<MenuItem> {
        self.menus.read().await.clone()
    }

    pub async fn handle(&self, sender: Option<ContextId>, request: Request) -> Response {
        match request {
            Request::GetContextId => match sender {
                Some(ctx) => Response::ContextId(ctx),
                None => Response::Error("Sender is not a tab.".to_string()),
            },
            Request::Ping => Response::Pong {
                timestamp: now_millis(),
            },
            Request::CallAi { messages } => Response::Completion(
                self.call(messages).await.map_err(|e| e.to_string()),
            ),
            Request::UpdateMenus => {
                if let Err(e) = self.refresh_menus().await {
                    warn!(error = %e, "could not reload menu settings");
                }
                Response::Ack
            }
        }
    }

    async fn call(&self, messages: Vec<ChatMessage>) -> Result<String, AiError> {
        let credentials = Credentials::load(self.stores.synced.as_ref())
            .await
            .map_err(|e| AiError::Transport(e.to_string()))?;
        let (api_key, model) = credentials
            .for_call(&self.default_model)
            .ok_or(AiError::MissingApiKey)?;
        let request = CompletionRequest::new(api_key, model, messages, false);
        let result = ai::complete(self.transport.as_ref(), &request).await;
        if let Err(e) = &result {
            warn!(error = %e, "completion call failed");
        }
        result
    }

    /// Serves one streaming port until the page drops it.
    pub async fn accept_port(&self, port: BackgroundPort) {
        debug!(port = %port.name(), "port connected");
        self.bridge.serve(port).await;
    }

    pub async fn refresh_menus(&self) -> Result<Vec<MenuItem>, StoreError> {
        let enabled = MenuSettings::load(self.stores.synced.as_ref())
            .await?
            .enabled_items();
        *self.menus.write().await = enabled.clone();
        debug!(?enabled, "context menus updated");
        Ok(enabled)
    }

    pub async fn on_menu_click(
        &self,
        item: MenuItem,
        target: Option<ContextId>,
        selection_text: Option<&str>,
    ) -> Result<MenuEffect, RelayError> {
        if !self.menus.read().await.contains(&item) {
            debug!(%item, "click on a disabled menu entry");
            return Ok(MenuEffect::None);
        }
        let selection = selection_text.unwrap_or("");

        match item {
            MenuItem::AddAnnotation => match target {
                Some(target) if !selection.is_empty() => Ok(MenuEffect::PromptAnnotation {
                    target,
                    keyword: selection.to_string(),
                }),
                _ => Ok(MenuEffect::None),
            },
            MenuItem::Search if !selection.is_empty() => Ok(MenuEffect::OpenUrl(search_url(selection))),
            MenuItem::Search => Ok(MenuEffect::None),
            MenuItem::AskAi | MenuItem::Rewrite => {
                let ctx = target.ok_or_else(|| RelayError::NoContext("menu click outside a page".to_string()))?;
                let kind = if item == MenuItem::AskAi {
                    ActionKind::Ask
                } else {
                    ActionKind::Rewrite
                };
                let outcome = self.relay.enqueue_and_deliver(ctx, kind, selection).await?;
                info!(%ctx, ?kind, ?outcome, "menu action queued");
                Ok(MenuEffect::Queued(outcome))
            }
        }
    }

    /// Stores the answer to an annotation prompt. `None` means the user
    /// cancelled; an empty string masks the keyword.
    pub async fn complete_annotation(
        &self,
        target: ContextId,
        keyword: &str,
        explanation: Option<&str>,
    ) -> Result<bool, StoreError> {
        let Some(explanation) = explanation else {
            return Ok(false);
        };
        glossary::upsert(self.stores.synced.as_ref(), keyword, explanation).await?;
        self.notify_annotation_added(target).await;
        Ok(true)
    }

    /// Tells a page its annotations changed. Unreachable pages pick the
    /// change up on their next load.
    pub async fn notify_annotation_added(&self, target: ContextId) -> Option<PageReply> {
        match self
            .messenger
            .send_command(target, PageCommand::AnnotationAdded)
            .await
        {
            Ok(reply) => Some(reply),
            Err(DeliveryError::NoReceiver) => None,
            Err(e) => {
                debug!(%target, error = %e, "annotation notification dropped");
                None
            }
        }
    }

    /// Install/update hook.
    pub async fn on_installed(&self) -> Result<AnnotationMap, StoreError> {
        let merged = glossary::seed(self.stores.synced.as_ref()).await?;
        self.refresh_menus().await?;
        info!(annotations = merged.len(), "seeded predefined annotations");
        Ok(merged)
    }

    /// Handles inbox messages until every sender is gone.
    pub async fn run(self, mut inbox: BackgroundInbox) {
        while let Some(message) = inbox.recv().await {
            let background = self.clone();
            match message {
                BackgroundMessage::Request {
                    sender,
                    request,
                    reply,
                } => {
                    tokio::spawn(async move {
                        let response = background.handle(sender, request).await;
                        if reply.send(response).is_err() {
                            debug!("requester went away before the reply");
                        }
                    });
                }
                BackgroundMessage::Connect(port) => {
                    tokio::spawn(async move { background.accept_port(port).await });
                }
            }
        }
        debug!("background inbox closed");
    }
}
