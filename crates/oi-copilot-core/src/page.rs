//! Per-page controller.
//!
//! A [`PageSession`] owns one page's document and everything the content
//! side keeps for it: the tooltip, the ask dialog, in-flight rewrites and
//! the current selection. It executes drained actions and answers commands
//! from the background.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::annotate::{annotate, Tooltip};
use crate::bridge::{StreamConnector, StreamUpdate};
use crate::chat::{AskOutcome, AskSession, DEFAULT_CONTEXT_CHARS, DIALOG_ID};
use crate::dom::{Document, NodeId, Selection};
use crate::glossary;
use crate::hub::{Hub, HubClient, PageInbox, PageMessage};
use crate::messages::{now_millis, ContextId, PageCommand, PageReply};
use crate::relay::{self, ActionHandler, ContextLookup, DrainOutcome, PendingSlot};
use crate::rewrite::{undo_target, Completion, ReapplyReport, RewriteEngine, RewriteError, RewriteOutcome};
use crate::store::{KeyValueStore, StoreError, Stores};

#[derive(Debug, Error)]
pub enum PageError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The page's channels to the background.
#[derive(Clone)]
pub struct PageLinks {
    pub contexts: Arc<dyn ContextLookup>,
    pub completion: Arc<dyn Completion>,
    pub streams: Arc<dyn StreamConnector>,
}

impl PageLinks {
    pub fn from_client(client: HubClient) -> Self {
        let client = Arc::new(client);
        Self {
            contexts: client.clone(),
            completion: client.clone(),
            streams: client,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachReport {
    pub markers: usize,
    pub rewrites: ReapplyReport,
    pub drained: DrainOutcome,
}

/// Why [`PageSession::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageExit {
    /// The page has to be rebuilt (annotations changed).
    Reload,
    Closed,
}

pub struct PageSession {
    url: String,
    doc: Document,
    synced: Arc<dyn KeyValueStore>,
    slot: PendingSlot,
    links: PageLinks,
    tooltip: Tooltip,
    rewrites: RewriteEngine,
    ask: Option<AskSession>,
    selection: Selection,
    context_chars: usize,
    attached: bool,
}

impl PageSession {
    pub fn new(url: &str, doc: Document, stores: &Stores, links: PageLinks) -> Self {
        Self {
            url: url.to_string(),
            doc,
            synced: stores.synced.clone(),
            slot: PendingSlot::new(stores),
            links,
            tooltip: Tooltip::new(),
            rewrites: RewriteEngine::new(stores.local.clone(), url),
            ask: None,
            selection: Selection::empty(),
            context_chars: DEFAULT_CONTEXT_CHARS,
            attached: false,
        }
    }

    pub fn with_context_chars(mut self, chars: usize) -> Self {
        self.context_chars = chars;
        self
    }

    pub fn with_retention_days(mut self, days: i64) -> Self {
        self.rewrites = self.rewrites.with_retention_days(days);
        self
    }

    pub fn doc(&self) -> &Document {
        &self.doc
    }

    pub fn doc_mut(&mut self) -> &mut Document {
        &mut self.doc
    }

    pub fn ask_session(&self) -> Option<&AskSession> {
        self.ask.as_ref()
    }

    pub fn tooltip(&self) -> &Tooltip {
        &self.tooltip
    }

    pub fn rewrites(&self) -> &RewriteEngine {
        &self.rewrites
    }

    /// One-time setup: annotate, restore rewrites, then pick up any action
    /// queued for this page. Annotation and rewrite failures are logged and
    /// never keep the queued action from running. Once an attach completes,
    /// later calls do nothing.
    pub async fn attach(&mut self) -> Result<Option<AttachReport>, PageError> {
        if self.attached {
            debug!(url = %self.url, "already attached");
            return Ok(None);
        }

        let markers = match glossary::load(self.synced.as_ref()).await {
            Ok(annotations) => annotate(&mut self.doc, &annotations),
            Err(e) => {
                warn!(url = %self.url, error = %e, "annotations unavailable, page left unannotated");
                0
            }
        };
        let rewrites = match self.rewrites.reapply(&mut self.doc).await {
            Ok(report) => report,
            Err(e) => {
                warn!(url = %self.url, error = %e, "stored rewrites not restored");
                ReapplyReport::default()
            }
        };
        let drained = self.drain().await?;
        self.attached = true;

        info!(url = %self.url, markers, ?drained, "page attached");
        Ok(Some(AttachReport {
            markers,
            rewrites,
            drained,
        }))
    }

    pub async fn drain(&mut self) -> Result<DrainOutcome, StoreError> {
        let contexts = self.links.contexts.clone();
        let slot = self.slot.clone();
        relay::drain(contexts.as_ref(), &slot, self).await
    }

    pub async fn handle_command(&mut self, command: PageCommand) -> PageReply {
        debug!(?command, url = %self.url, "page command");
        match command {
            PageCommand::Ping => PageReply::Pong {
                url: self.url.clone(),
                timestamp: now_millis(),
            },
            PageCommand::ProcessPending => match self.drain().await {
                Ok(_) => PageReply::Processed { done: true },
                Err(e) => {
                    warn!(error = %e, "pending action drain failed");
                    PageReply::Processed { done: false }
                }
            },
            PageCommand::AnnotationAdded => PageReply::Reload,
        }
    }

    /// Serves the page's inbox until it closes or the page must reload.
    pub async fn run(&mut self, inbox: &mut PageInbox) -> PageExit {
        while let Some(message) = inbox.recv().await {
            match message {
                PageMessage::Command { command, reply } => {
                    let response = self.handle_command(command).await;
                    let reload = response == PageReply::Reload;
                    if reply.send(response).is_err() {
                        debug!("command sender went away");
                    }
                    if reload {
                        return PageExit::Reload;
                    }
                }
                PageMessage::RunDrain => {
                    if let Err(e) = self.drain().await {
                        warn!(error = %e, "injected drain failed");
                    }
                }
            }
        }
        PageExit::Closed
    }

    /// Replaces the selection. While the dialog is open, a non-empty
    /// selection outside it becomes the new quoted text.
    pub fn set_selection(&mut self, selection: Selection) {
        self.selection = selection;
        let Some(ask) = self.ask.as_mut() else { return };

        if let Some(range) = self.selection.first_range() {
            let in_dialog = self
                .doc
                .closest(range.start.node, |el| el.id.as_deref() == Some(DIALOG_ID))
                .is_some();
            if in_dialog {
                return;
            }
        }
        let text = self.selection.text(&self.doc);
        let text = text.trim();
        if !text.is_empty() {
            ask.update_selection(&mut self.doc, text);
        }
    }

    /// Selects the first occurrence of `needle` with surrounding whitespace
    /// trimmed.
    pub fn select_text(&mut self, needle: &str) -> bool {
        let needle = needle.trim();
        if needle.is_empty() {
            return false;
        }
        match self.doc.find_text(needle) {
            Some(range) => {
                self.set_selection(Selection::new(range));
                true
            }
            None => false,
        }
    }

    pub fn selection_text(&self) -> String {
        self.selection.text(&self.doc)
    }

    /// Sends a question in the open dialog.
    pub async fn ask_question<F>(&mut self, question: &str, on_update: F) -> Option<AskOutcome>
    where
        F: FnMut(&StreamUpdate) + Send,
    {
        let streams = self.links.streams.clone();
        let ask = self.ask.as_mut()?;
        Some(ask.send_with(&mut self.doc, question, streams.as_ref(), on_update).await)
    }

    pub fn close_dialog(&mut self) {
        if let Some(ask) = self.ask.take() {
            ask.close(&mut self.doc);
        }
    }

    /// Runs the rewrite engine on the current selection.
    pub async fn rewrite_selection(&mut self) -> Result<RewriteOutcome, RewriteError> {
        let completion = self.links.completion.clone();
        let selection = std::mem::take(&mut self.selection);
        self.rewrites
            .rewrite(&mut self.doc, &selection, completion.as_ref())
            .await
    }

    /// A click on `node`. Undo buttons restore their rewrite.
    pub async fn click(&mut self, node: NodeId) -> Result<bool, RewriteError> {
        let Some(id) = undo_target(&self.doc, node) else {
            return Ok(false);
        };
        self.rewrites.undo(&mut self.doc, &id).await
    }

    pub fn pointer_over(&mut self, node: NodeId) -> bool {
        self.tooltip.show(&mut self.doc, node)
    }

    pub fn pointer_move(&mut self, x: i32, y: i32) {
        self.tooltip.move_to(&mut self.doc, x, y);
    }

    pub fn pointer_out(&mut self, node: NodeId) {
        self.tooltip.hide(&mut self.doc, node);
    }
}

#[async_trait]
impl ActionHandler for PageSession {
    fn current_selection(&self) -> Option<String> {
        (self.selection.range_count() > 0).then(|| self.selection.text(&self.doc))
    }

    async fn ask(&mut self, selection_text: &str) {
        self.close_dialog();
        self.ask = Some(AskSession::start(&mut self.doc, selection_text, self.context_chars));
    }

    async fn rewrite(&mut self) {
        match self.rewrite_selection().await {
            Ok(outcome) => debug!(?outcome, "rewrite finished"),
            Err(e) => warn!(error = %e, "rewrite could not start"),
        }
    }
}

/// Registers a page with the hub, attaches it and starts listening.
pub async fn open(
    hub: &Hub,
    url: &str,
    doc: Document,
    stores: &Stores,
) -> Result<(ContextId, PageSession, PageInbox), PageError> {
    let (ctx, inbox) = hub.open_page(url).await;
    let mut session = PageSession::new(url, doc, stores, PageLinks::from_client(hub.client(Some(ctx))));
    session.attach().await?;
    hub.listen(ctx).await;
    Ok((ctx, session, inbox))
}
