//! Pending-action handoff between the background process and pages.
//!
//! # Protocol
//!
//! - The background writes a [`PendingAction`] into a single slot in the
//!   local store. A newer action for any context replaces the old one.
//! - It then asks the page to drain (PROCESS_PENDING). If nobody answers, it
//!   injects a drain call into the page. If that fails too, the action stays
//!   in the slot and the page drains it when its script next attaches.
//! - Draining removes the action before dispatching it, so it runs at most
//!   once no matter how many drains race.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::messages::{ContextId, PageCommand, PageReply};
use crate::store::{self, keys, KeyValueStore, StoreError, Stores};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    #[serde(rename = "ask-ai")]
    Ask,
    #[serde(rename = "rewrite-text")]
    Rewrite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAction {
    #[serde(rename = "tabId")]
    pub target: ContextId,
    #[serde(rename = "action")]
    pub kind: ActionKind,
    #[serde(rename = "selectionText", default)]
    pub selection_text: String,
}

/// Single-slot mailbox in the local store.
#[derive(Clone)]
pub struct PendingSlot {
    store: Arc<dyn KeyValueStore>,
    lock: Arc<Mutex<()>>,
}

impl PendingSlot {
    pub fn new(stores: &Stores) -> Self {
        Self {
            store: stores.local.clone(),
            lock: stores.pending_lock.clone(),
        }
    }

    pub async fn peek(&self) -> Result<Option<PendingAction>, StoreError> {
        let _guard = self.lock.lock().await;
        self.load_lenient().await
    }

    /// Stores `action`, returning whatever it displaced.
    pub async fn replace(&self, action: PendingAction) -> Result<Option<PendingAction>, StoreError> {
        let _guard = self.lock.lock().await;
        let previous = self.load_lenient().await?;
        store::save(self.store.as_ref(), keys::PENDING_ACTION, &action).await?;
        Ok(previous)
    }

    /// Removes and returns the action only if it targets `ctx`.
    pub async fn take_for(&self, ctx: ContextId) -> Result<Option<PendingAction>, StoreError> {
        let _guard = self.lock.lock().await;
        match self.load_lenient().await? {
            Some(action) if action.target == ctx => {
                self.store.remove(keys::PENDING_ACTION).await?;
                Ok(Some(action))
            }
            _ => Ok(None),
        }
    }

    /// A slot holding something undecodable is treated as empty and cleared.
    async fn load_lenient(&self) -> Result<Option<PendingAction>, StoreError> {
        match store::load(self.store.as_ref(), keys::PENDING_ACTION).await {
            Ok(action) => Ok(action),
            Err(StoreError::Json(e)) => {
                warn!(error = %e, "discarding malformed pending action");
                self.store.remove(keys::PENDING_ACTION).await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("Could not establish connection. Receiving end does not exist.")]
    NoReceiver,
    #[error("page closed before replying")]
    Closed,
}

/// How the background reaches a page.
#[async_trait]
pub trait PageMessenger: Send + Sync {
    async fn send_command(&self, ctx: ContextId, command: PageCommand) -> Result<PageReply, DeliveryError>;
    /// Runs the page's drain handler, if it has one, without messaging.
    async fn inject_drain(&self, ctx: ContextId) -> Result<(), DeliveryError>;

    /// Sends PROCESS_PENDING; `Ok(done)` is the page's answer.
    async fn process_pending(&self, ctx: ContextId) -> Result<bool, DeliveryError> {
        match self.send_command(ctx, PageCommand::ProcessPending).await? {
            PageReply::Processed { done } => Ok(done),
            _ => Ok(false),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Injected,
    /// Left queued for the page's next load.
    Deferred,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("no page context: {0}")]
    NoContext(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Background-side half of the relay.
#[derive(Clone)]
pub struct ActionRelay {
    slot: PendingSlot,
    messenger: Arc<dyn PageMessenger>,
}

impl ActionRelay {
    pub fn new(slot: PendingSlot, messenger: Arc<dyn PageMessenger>) -> Self {
        Self { slot, messenger }
    }

    pub fn slot(&self) -> &PendingSlot {
        &self.slot
    }

    pub async fn enqueue(
        &self,
        ctx: ContextId,
        kind: ActionKind,
        selection_text: &str,
    ) -> Result<(), RelayError> {
        let action = PendingAction {
            target: ctx,
            kind,
            selection_text: selection_text.to_string(),
        };
        if let Some(previous) = self.slot.replace(action).await? {
            debug!(?previous, "pending action overwritten");
        }
        Ok(())
    }

    pub async fn try_deliver(&self, ctx: ContextId) -> DeliveryOutcome {
        match self.messenger.process_pending(ctx).await {
            Ok(true) => return DeliveryOutcome::Delivered,
            Ok(false) => debug!(%ctx, "page reported drain failure, injecting"),
            Err(e) => debug!(%ctx, error = %e, "direct delivery failed, injecting"),
        }

        match self.messenger.inject_drain(ctx).await {
            Ok(()) => DeliveryOutcome::Injected,
            Err(e) => {
                warn!(
                    %ctx,
                    error = %e,
                    "could not reach page; the action will be handled on next page load"
                );
                DeliveryOutcome::Deferred
            }
        }
    }

    pub async fn enqueue_and_deliver(
        &self,
        ctx: ContextId,
        kind: ActionKind,
        selection_text: &str,
    ) -> Result<DeliveryOutcome, RelayError> {
        self.enqueue(ctx, kind, selection_text).await?;
        Ok(self.try_deliver(ctx).await)
    }
}

/// Resolves the context the calling page runs in.
#[async_trait]
pub trait ContextLookup: Send + Sync {
    async fn current_context(&self) -> Result<ContextId, RelayError>;
}

/// Page-side executor for drained actions.
#[async_trait]
pub trait ActionHandler: Send {
    /// Live selection text, if anything is selected.
    fn current_selection(&self) -> Option<String>;
    async fn ask(&mut self, selection_text: &str);
    async fn rewrite(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    NoContext,
    Empty,
    /// Nothing queued for this context (the slot may hold another's action).
    OtherContext,
    SelectionChanged,
    Dispatched(ActionKind),
}

/// Page-side half of the relay.
pub async fn drain<H: ActionHandler + ?Sized>(
    contexts: &dyn ContextLookup,
    slot: &PendingSlot,
    handler: &mut H,
) -> Result<DrainOutcome, StoreError> {
    let ctx = match contexts.current_context().await {
        Ok(ctx) => ctx,
        Err(e) => {
            warn!(error = %e, "could not verify pending action because the context id is missing");
            return Ok(DrainOutcome::NoContext);
        }
    };

    let Some(action) = slot.take_for(ctx).await? else {
        return Ok(if slot.peek().await?.is_some() {
            DrainOutcome::OtherContext
        } else {
            DrainOutcome::Empty
        });
    };
    info!(%ctx, kind = ?action.kind, "found pending action");

    match action.kind {
        ActionKind::Ask => handler.ask(&action.selection_text).await,
        ActionKind::Rewrite => {
            let live = handler.current_selection().unwrap_or_default();
            let live = live.trim();
            if live.is_empty() || live != action.selection_text.trim() {
                warn!(%ctx, "selection for rewrite action was lost or changed");
                return Ok(DrainOutcome::SelectionChanged);
            }
            handler.rewrite().await;
        }
    }
    Ok(DrainOutcome::Dispatched(action.kind))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub struct FixedContext(pub Option<ContextId>);

    #[async_trait]
    impl ContextLookup for FixedContext {
        async fn current_context(&self) -> Result<ContextId, RelayError> {
            self.0
                .ok_or_else(|| RelayError::NoContext("Sender is not a tab.".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FixedContext;
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingHandler {
        selection: Option<String>,
        asked: Vec<String>,
        rewrites: usize,
    }

    #[async_trait]
    impl ActionHandler for RecordingHandler {
        fn current_selection(&self) -> Option<String> {
            self.selection.clone()
        }

        async fn ask(&mut self, selection_text: &str) {
            self.asked.push(selection_text.to_string());
        }

        async fn rewrite(&mut self) {
            self.rewrites += 1;
        }
    }

    /// Answers PROCESS_PENDING / injection with canned results.
    struct CannedMessenger {
        direct: Result<bool, DeliveryError>,
        inject: Result<(), DeliveryError>,
        calls: StdMutex<Vec<&'static str>>,
    }

    impl CannedMessenger {
        fn new(direct: Result<bool, DeliveryError>, inject: Result<(), DeliveryError>) -> Arc<Self> {
            Arc::new(Self {
                direct,
                inject,
                calls: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PageMessenger for CannedMessenger {
        async fn send_command(
            &self,
            _ctx: ContextId,
            command: PageCommand,
        ) -> Result<PageReply, DeliveryError> {
            assert_eq!(command, PageCommand::ProcessPending);
            self.calls.lock().unwrap().push("direct");
            self.direct.clone().map(|done| PageReply::Processed { done })
        }

        async fn inject_drain(&self, _ctx: ContextId) -> Result<(), DeliveryError> {
            self.calls.lock().unwrap().push("inject");
            self.inject.clone()
        }
    }

    fn slot() -> PendingSlot {
        PendingSlot::new(&Stores::in_memory())
    }

    #[tokio::test]
    async fn test_replace_is_last_write_wins() {
        let slot = slot();
        let first = PendingAction {
            target: ContextId(1),
            kind: ActionKind::Ask,
            selection_text: "a".into(),
        };
        let second = PendingAction {
            target: ContextId(2),
            kind: ActionKind::Rewrite,
            selection_text: "b".into(),
        };
        assert_eq!(slot.replace(first.clone()).await.unwrap(), None);
        assert_eq!(slot.replace(second.clone()).await.unwrap(), Some(first));
        assert_eq!(slot.peek().await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_take_for_leaves_foreign_action() {
        let slot = slot();
        slot.replace(PendingAction {
            target: ContextId(3),
            kind: ActionKind::Ask,
            selection_text: String::new(),
        })
        .await
        .unwrap();

        assert_eq!(slot.take_for(ContextId(4)).await.unwrap(), None);
        assert!(slot.peek().await.unwrap().is_some());
        assert!(slot.take_for(ContextId(3)).await.unwrap().is_some());
        assert!(slot.peek().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_wire_shape() {
        let action = PendingAction {
            target: ContextId(7),
            kind: ActionKind::Rewrite,
            selection_text: "foo".into(),
        };
        assert_eq!(
            serde_json::to_value(&action).unwrap(),
            serde_json::json!({"tabId": 7, "action": "rewrite-text", "selectionText": "foo"})
        );
    }

    #[tokio::test]
    async fn test_malformed_slot_is_cleared() {
        let stores = Stores::in_memory();
        stores
            .local
            .set(keys::PENDING_ACTION, serde_json::json!({"tabId": "nope"}))
            .await
            .unwrap();
        let slot = PendingSlot::new(&stores);
        assert_eq!(slot.take_for(ContextId(1)).await.unwrap(), None);
        assert!(stores.local.get(keys::PENDING_ACTION).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_peek_clears_malformed_slot() {
        let stores = Stores::in_memory();
        stores
            .local
            .set(keys::PENDING_ACTION, serde_json::json!({"tabId": 3, "action": "share"}))
            .await
            .unwrap();
        let slot = PendingSlot::new(&stores);
        assert_eq!(slot.peek().await.unwrap(), None);
        assert!(stores.local.get(keys::PENDING_ACTION).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_drain_twice_dispatches_once() {
        let slot = slot();
        let relay = ActionRelay::new(
            slot.clone(),
            CannedMessenger::new(Err(DeliveryError::NoReceiver), Err(DeliveryError::NoReceiver)),
        );
        relay.enqueue(ContextId(5), ActionKind::Ask, "松弛").await.unwrap();

        let contexts = FixedContext(Some(ContextId(5)));
        let mut handler = RecordingHandler::default();
        assert_eq!(
            drain(&contexts, &slot, &mut handler).await.unwrap(),
            DrainOutcome::Dispatched(ActionKind::Ask)
        );
        assert_eq!(
            drain(&contexts, &slot, &mut handler).await.unwrap(),
            DrainOutcome::Empty
        );
        assert_eq!(handler.asked, vec!["松弛".to_string()]);
    }

    #[tokio::test]
    async fn test_drain_rewrite_with_changed_selection_drops_action() {
        let slot = slot();
        slot.replace(PendingAction {
            target: ContextId(7),
            kind: ActionKind::Rewrite,
            selection_text: "foo".into(),
        })
        .await
        .unwrap();

        let mut handler = RecordingHandler {
            selection: Some("bar".into()),
            ..Default::default()
        };
        let outcome = drain(&FixedContext(Some(ContextId(7))), &slot, &mut handler)
            .await
            .unwrap();

        assert_eq!(outcome, DrainOutcome::SelectionChanged);
        assert_eq!(handler.rewrites, 0);
        assert!(slot.peek().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_drain_rewrite_matches_trimmed_selection() {
        let slot = slot();
        slot.replace(PendingAction {
            target: ContextId(7),
            kind: ActionKind::Rewrite,
            selection_text: " 显而易见 ".into(),
        })
        .await
        .unwrap();

        let mut handler = RecordingHandler {
            selection: Some("显而易见\n".into()),
            ..Default::default()
        };
        let outcome = drain(&FixedContext(Some(ContextId(7))), &slot, &mut handler)
            .await
            .unwrap();
        assert_eq!(outcome, DrainOutcome::Dispatched(ActionKind::Rewrite));
        assert_eq!(handler.rewrites, 1);
    }

    #[tokio::test]
    async fn test_drain_without_context_keeps_action() {
        let slot = slot();
        slot.replace(PendingAction {
            target: ContextId(1),
            kind: ActionKind::Ask,
            selection_text: String::new(),
        })
        .await
        .unwrap();

        let mut handler = RecordingHandler::default();
        let outcome = drain(&FixedContext(None), &slot, &mut handler).await.unwrap();
        assert_eq!(outcome, DrainOutcome::NoContext);
        assert!(slot.peek().await.unwrap().is_some());

        let outcome = drain(&FixedContext(Some(ContextId(2))), &slot, &mut handler)
            .await
            .unwrap();
        assert_eq!(outcome, DrainOutcome::OtherContext);
        assert!(handler.asked.is_empty());
    }

    #[tokio::test]
    async fn test_try_deliver_paths() {
        let delivered = ActionRelay::new(slot(), CannedMessenger::new(Ok(true), Ok(())));
        assert_eq!(delivered.try_deliver(ContextId(1)).await, DeliveryOutcome::Delivered);

        let messenger = CannedMessenger::new(Err(DeliveryError::NoReceiver), Ok(()));
        let injected = ActionRelay::new(slot(), messenger.clone());
        assert_eq!(injected.try_deliver(ContextId(1)).await, DeliveryOutcome::Injected);
        assert_eq!(*messenger.calls.lock().unwrap(), vec!["direct", "inject"]);

        let declined = ActionRelay::new(slot(), CannedMessenger::new(Ok(false), Ok(())));
        assert_eq!(declined.try_deliver(ContextId(1)).await, DeliveryOutcome::Injected);

        let unreachable_slot = slot();
        let unreachable = ActionRelay::new(
            unreachable_slot.clone(),
            CannedMessenger::new(Err(DeliveryError::NoReceiver), Err(DeliveryError::Closed)),
        );
        let outcome = unreachable
            .enqueue_and_deliver(ContextId(9), ActionKind::Ask, "")
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::Deferred);
        assert_eq!(
            unreachable_slot.peek().await.unwrap().map(|a| a.target),
            Some(ContextId(9))
        );
    }
}
