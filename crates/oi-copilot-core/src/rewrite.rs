//! In-place AI rewrites of a selected passage.
//!
//! A rewrite replaces the selection with a placeholder, asks for a one-shot
//! completion and swaps the placeholder for the rendered result plus an undo
//! button. Successful rewrites are stored per page URL so they can be
//! mounted again when the page is rebuilt.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::dom::{Document, DomError, NodeId, Selection};
use crate::messages::now_millis;
use crate::render::{mount, render_markdown, RenderNode};
use crate::state::ChatMessage;
use crate::store::{self, keys, KeyValueStore, StoreError};

pub const PLACEHOLDER_CLASS: &str = "ai-rewrite-placeholder";
pub const PLACEHOLDER_TEXT: &str = "AI 正在重写...";
pub const REWRITTEN_CLASS: &str = "ai-rewritten-text";
pub const ERROR_CLASS: &str = "ai-rewrite-error";
pub const UNDO_CLASS: &str = "ai-rewrite-undo";
pub const UNDO_LABEL: &str = "撤销";

const DEFAULT_RETENTION_DAYS: i64 = 30;

/// One-shot (non-streaming) completion, as served by the background.
#[async_trait]
pub trait Completion: Send + Sync {
    async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String, String>;
}

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("nothing is selected")]
    EmptySelection,
    #[error(transparent)]
    Dom(#[from] DomError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What gets written under `rewrites[url][id]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRewrite {
    pub rewritten: String,
    pub rendered: Vec<RenderNode>,
    #[serde(default)]
    pub original: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

type PageRewrites = BTreeMap<String, StoredRewrite>;
type RewriteTable = BTreeMap<String, PageRewrites>;

/// A placeholder waiting for its completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRewrite {
    pub id: String,
    pub original: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteOutcome {
    Rewritten { id: String },
    Failed { id: String, error: String },
    /// The placeholder was gone by the time the reply arrived.
    Detached { id: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapplyReport {
    pub applied: usize,
    pub skipped: usize,
    pub evicted: usize,
}

pub fn rewrite_prompt(original: &str) -> String {
    format!(
        "你是一个专业的算法竞赛（ICPC）教练和计算机科学（CS）领域的专家。请在完整保留原始信息和专业性的前提下，将以下文本重写得更清晰、更易于初学者理解。请特别注意消除 \"不难看出\", \"显而易见\", \"注意到\", \"易得\" 这类模糊的、对初学者不友好的表述，并用更具体的解释来代替。\n\n原始文本如下：\n---\n{original}\n---\n\n请直接输出重写后的文本，不要包含任何额外的解释或开场白。"
    )
}

/// Per-page rewrite state.
pub struct RewriteEngine {
    local: Arc<dyn KeyValueStore>,
    url: String,
    originals: HashMap<String, String>,
    retention_ms: i64,
}

impl RewriteEngine {
    pub fn new(local: Arc<dyn KeyValueStore>, url: &str) -> Self {
        Self {
            local,
            url: url.to_string(),
            originals: HashMap::new(),
            retention_ms: chrono::Duration::days(DEFAULT_RETENTION_DAYS).num_milliseconds(),
        }
    }

    /// Unresolved entries older than this are dropped during reapplication.
    pub fn with_retention_days(mut self, days: i64) -> Self {
        self.retention_ms = chrono::Duration::days(days).num_milliseconds();
        self
    }

    /// Original text still held in memory for `id`.
    pub fn original(&self, id: &str) -> Option<&str> {
        self.originals.get(id).map(String::as_str)
    }

    /// Swaps the selection for a placeholder.
    pub fn begin(&mut self, doc: &mut Document, selection: &Selection) -> Result<PendingRewrite, RewriteError> {
        let range = match selection.first_range() {
            Some(range) if !selection.is_collapsed() => *range,
            _ => return Err(RewriteError::EmptySelection),
        };
        let original = selection.text(doc);
        if original.trim().is_empty() {
            return Err(RewriteError::EmptySelection);
        }

        let id = self.fresh_id(doc);
        let span = doc.create_element("span");
        doc.set_id(span, &id);
        doc.add_class(span, PLACEHOLDER_CLASS);
        doc.set_text_content(span, PLACEHOLDER_TEXT);
        doc.replace_range(&range, span)?;

        self.originals.insert(id.clone(), original.clone());
        debug!(%id, chars = original.chars().count(), "rewrite started");
        Ok(PendingRewrite { id, original })
    }

    fn fresh_id(&self, doc: &Document) -> String {
        let mut millis = now_millis();
        loop {
            let id = format!("rewrite-{millis}");
            if doc.get_element_by_id(&id).is_none() && !self.originals.contains_key(&id) {
                return id;
            }
            millis += 1;
        }
    }

    /// Applies a completion result to the placeholder.
    pub async fn finish(
        &mut self,
        doc: &mut Document,
        pending: &PendingRewrite,
        result: Result<String, String>,
    ) -> Result<RewriteOutcome, RewriteError> {
        let id = pending.id.clone();
        let Some(span) = doc.get_element_by_id(&id) else {
            warn!(%id, "rewrite placeholder disappeared");
            self.originals.remove(&id);
            return Ok(RewriteOutcome::Detached { id });
        };

        let rewritten = match result {
            Ok(content) if !content.is_empty() => content,
            Ok(_) => return Ok(self.fail(doc, span, id, "模型响应为空".to_string())),
            Err(error) => return Ok(self.fail(doc, span, id, error)),
        };

        let rendered = render_markdown(&rewritten);
        apply_rendered(doc, span, &rendered);

        let entry = StoredRewrite {
            rewritten,
            rendered,
            original: Some(pending.original.clone()),
            created_at: now_millis(),
        };
        let mut table = self.load_table().await?;
        table.entry(self.url.clone()).or_default().insert(id.clone(), entry);
        self.save_table(&table).await?;

        info!(%id, url = %self.url, "rewrite applied");
        Ok(RewriteOutcome::Rewritten { id })
    }

    fn fail(&mut self, doc: &mut Document, span: NodeId, id: String, error: String) -> RewriteOutcome {
        warn!(%id, %error, "rewrite failed");
        doc.set_text_content(span, &format!("重写失败: {error}"));
        doc.set_class(span, ERROR_CLASS);
        self.originals.remove(&id);
        RewriteOutcome::Failed { id, error }
    }

    /// Full rewrite of the live selection.
    pub async fn rewrite(
        &mut self,
        doc: &mut Document,
        selection: &Selection,
        completion: &dyn Completion,
    ) -> Result<RewriteOutcome, RewriteError> {
        let pending = self.begin(doc, selection)?;
        let messages = vec![ChatMessage::user(rewrite_prompt(&pending.original))];
        let result = completion.complete(messages).await;
        self.finish(doc, &pending, result).await
    }

    /// Puts the original text back. Returns false when there is nothing to
    /// restore (unknown id or element gone).
    pub async fn undo(&mut self, doc: &mut Document, id: &str) -> Result<bool, RewriteError> {
        let Some(el) = doc.get_element_by_id(id) else {
            return Ok(false);
        };

        let mut table = self.load_table().await?;
        let stored = table
            .get_mut(&self.url)
            .and_then(|page| page.remove(id));
        let original = match self.originals.remove(id) {
            Some(original) => original,
            None => match stored.and_then(|entry| entry.original) {
                Some(original) => original,
                None => {
                    debug!(%id, "no original text recorded");
                    return Ok(false);
                }
            },
        };

        doc.set_text_content(el, &original);
        doc.remove_class(el, REWRITTEN_CLASS);

        if table.get(&self.url).is_some_and(BTreeMap::is_empty) {
            table.remove(&self.url);
        }
        self.save_table(&table).await?;
        info!(%id, "rewrite undone");
        Ok(true)
    }

    /// Mounts stored rewrites for this page again.
    pub async fn reapply(&self, doc: &mut Document) -> Result<ReapplyReport, RewriteError> {
        self.reapply_at(doc, now_millis()).await
    }

    pub async fn reapply_at(&self, doc: &mut Document, now: i64) -> Result<ReapplyReport, RewriteError> {
        let mut table = self.load_table().await?;
        let Some(page) = table.get_mut(&self.url) else {
            return Ok(ReapplyReport::default());
        };

        let mut report = ReapplyReport::default();
        let mut expired = Vec::new();
        for (id, entry) in page.iter() {
            if let Some(el) = doc.get_element_by_id(id) {
                apply_rendered(doc, el, &entry.rendered);
                report.applied += 1;
            } else if now - entry.created_at > self.retention_ms {
                expired.push(id.clone());
            } else {
                report.skipped += 1;
            }
        }

        if !expired.is_empty() {
            for id in &expired {
                page.remove(id);
            }
            report.evicted = expired.len();
            if page.is_empty() {
                table.remove(&self.url);
            }
            self.save_table(&table).await?;
        }

        debug!(url = %self.url, ?report, "reapplied rewrites");
        Ok(report)
    }

    /// Stored rewrites for this page.
    pub async fn stored(&self) -> Result<BTreeMap<String, StoredRewrite>, RewriteError> {
        Ok(self.load_table().await?.remove(&self.url).unwrap_or_default())
    }

    /// Loads every page's rewrites. Entries that no longer decode are
    /// skipped so one bad record cannot hide the rest of the table.
    async fn load_table(&self) -> Result<RewriteTable, StoreError> {
        let Some(raw) = self.local.get(keys::REWRITES).await? else {
            return Ok(RewriteTable::new());
        };
        let pages: BTreeMap<String, serde_json::Value> = match serde_json::from_value(raw) {
            Ok(pages) => pages,
            Err(e) => {
                warn!(error = %e, "rewrite table is malformed, ignoring it");
                return Ok(RewriteTable::new());
            }
        };

        let mut table = RewriteTable::new();
        for (url, page) in pages {
            let entries: BTreeMap<String, serde_json::Value> = match serde_json::from_value(page) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(%url, error = %e, "skipping malformed page rewrites");
                    continue;
                }
            };
            let mut decoded = PageRewrites::new();
            for (id, entry) in entries {
                match serde_json::from_value::<StoredRewrite>(entry) {
                    Ok(entry) => {
                        decoded.insert(id, entry);
                    }
                    Err(e) => warn!(%url, %id, error = %e, "skipping malformed rewrite"),
                }
            }
            if !decoded.is_empty() {
                table.insert(url, decoded);
            }
        }
        Ok(table)
    }

    async fn save_table(&self, table: &RewriteTable) -> Result<(), StoreError> {
        store::save(self.local.as_ref(), keys::REWRITES, table).await
    }
}

/// Replaces `el`'s content with the rendered text and an undo button.
fn apply_rendered(doc: &mut Document, el: NodeId, rendered: &[RenderNode]) {
    doc.clear_children(el);
    doc.set_class(el, REWRITTEN_CLASS);

    let content = doc.create_element("span");
    mount(doc, content, rendered);
    doc.append_child(el, content);

    let undo = doc.create_element("button");
    doc.add_class(undo, UNDO_CLASS);
    doc.set_text_content(undo, UNDO_LABEL);
    doc.append_child(el, undo);
}

/// Rewrite id targeted by a click on `node`, if it is an undo button.
pub fn undo_target(doc: &Document, node: NodeId) -> Option<String> {
    if !doc.has_class(node, UNDO_CLASS) {
        return None;
    }
    let container = doc.closest(node, |el| el.has_class(REWRITTEN_CLASS))?;
    doc.element(container)?.id.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Mutex;

    const URL: &str = "https://oi-wiki.org/graph/shortest-path/";

    struct Canned {
        reply: Result<String, String>,
        prompts: Mutex<Vec<String>>,
    }

    impl Canned {
        fn new(reply: Result<&str, &str>) -> Self {
            Self {
                reply: reply.map(str::to_string).map_err(str::to_string),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Completion for Canned {
        async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String, String> {
            let mut prompts = self.prompts.lock().unwrap();
            prompts.extend(messages.into_iter().map(|m| m.content));
            self.reply.clone()
        }
    }

    fn select(doc: &Document, needle: &str) -> Selection {
        Selection::new(doc.find_text(needle).unwrap())
    }

    fn engine(local: &Arc<MemoryStore>) -> RewriteEngine {
        RewriteEngine::new(local.clone(), URL)
    }

    #[tokio::test]
    async fn test_rewrite_then_undo_restores_text() {
        let local = Arc::new(MemoryStore::new());
        let mut engine = engine(&local);
        let mut doc = Document::from_text("松弛操作显而易见是正确的。");
        let before = doc.text_content(doc.body());
        let completion = Canned::new(Ok("松弛操作**不会**让距离变大。"));

        let selection = select(&doc, "显而易见是正确的");
        let outcome = engine
            .rewrite(&mut doc, &selection, &completion)
            .await
            .unwrap();
        let RewriteOutcome::Rewritten { id } = outcome else { panic!("expected success") };

        let el = doc.get_element_by_id(&id).unwrap();
        assert!(doc.has_class(el, REWRITTEN_CLASS));
        let button = doc.find_first(|e| e.has_class(UNDO_CLASS)).unwrap();
        assert_eq!(doc.text_content(button), UNDO_LABEL);
        assert_eq!(undo_target(&doc, button), Some(id.clone()));
        assert!(engine.stored().await.unwrap().contains_key(&id));
        assert!(completion.prompts.lock().unwrap()[0].contains("---\n显而易见是正确的\n---"));

        assert!(engine.undo(&mut doc, &id).await.unwrap());
        assert_eq!(doc.text_content(doc.body()), before);
        assert_eq!(doc.text_content(el), "显而易见是正确的");
        assert!(engine.stored().await.unwrap().is_empty());
        assert!(engine.original(&id).is_none());
        assert!(local.get(keys::REWRITES).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_placeholder_shown_while_waiting() {
        let local = Arc::new(MemoryStore::new());
        let mut engine = engine(&local);
        let mut doc = Document::from_text("不难看出答案");

        let selection = select(&doc, "不难看出");
        let pending = engine.begin(&mut doc, &selection).unwrap();
        let el = doc.get_element_by_id(&pending.id).unwrap();
        assert!(doc.has_class(el, PLACEHOLDER_CLASS));
        assert_eq!(doc.text_content(el), PLACEHOLDER_TEXT);
        assert_eq!(pending.original, "不难看出");
        assert_eq!(engine.original(&pending.id), Some("不难看出"));
        assert!(pending.id.starts_with("rewrite-"));
    }

    #[tokio::test]
    async fn test_failure_marks_error_and_persists_nothing() {
        let local = Arc::new(MemoryStore::new());
        let mut engine = engine(&local);
        let mut doc = Document::from_text("易得结论");
        let selection = select(&doc, "易得");
        let outcome = engine
            .rewrite(&mut doc, &selection, &Canned::new(Err("HTTP error! status: 500")))
            .await
            .unwrap();

        let RewriteOutcome::Failed { id, .. } = outcome else { panic!("expected failure") };
        let el = doc.get_element_by_id(&id).unwrap();
        assert_eq!(doc.text_content(el), "重写失败: HTTP error! status: 500");
        assert!(doc.has_class(el, ERROR_CLASS));
        assert!(local.get(keys::REWRITES).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_reply_is_failure() {
        let local = Arc::new(MemoryStore::new());
        let mut engine = engine(&local);
        let mut doc = Document::from_text("注意到");
        let selection = select(&doc, "注意到");
        let outcome = engine
            .rewrite(&mut doc, &selection, &Canned::new(Ok("")))
            .await
            .unwrap();
        assert!(matches!(outcome, RewriteOutcome::Failed { ref error, .. } if error == "模型响应为空"));
    }

    #[tokio::test]
    async fn test_collapsed_selection_rejected() {
        let local = Arc::new(MemoryStore::new());
        let mut engine = engine(&local);
        let mut doc = Document::from_text("文本");
        let mut range = doc.find_text("文").unwrap();
        range.end = range.start;

        assert!(matches!(
            engine.begin(&mut doc, &Selection::new(range)),
            Err(RewriteError::EmptySelection)
        ));
        assert!(matches!(
            engine.begin(&mut doc, &Selection::empty()),
            Err(RewriteError::EmptySelection)
        ));
        assert_eq!(doc.text_content(doc.body()), "文本");
    }

    #[tokio::test]
    async fn test_reapply_and_undo_after_reload() {
        let local = Arc::new(MemoryStore::new());
        let mut doc = Document::from_text("显而易见");
        let id = {
            let mut engine = engine(&local);
            let selection = select(&doc, "显而易见");
            match engine
                .rewrite(&mut doc, &selection, &Canned::new(Ok("因为 $a<b$")))
                .await
                .unwrap()
            {
                RewriteOutcome::Rewritten { id } => id,
                other => panic!("unexpected {other:?}"),
            }
        };
        let rendered_html = doc.inner_html(doc.get_element_by_id(&id).unwrap());

        // Rebuilt page where the element survived but holds stale content.
        let mut reloaded = Document::from_text("");
        let span = reloaded.create_element("span");
        reloaded.set_id(span, &id);
        reloaded.set_text_content(span, "显而易见");
        reloaded.append_child(reloaded.body(), span);

        let mut engine = engine(&local);
        let report = engine.reapply(&mut reloaded).await.unwrap();
        assert_eq!(report, ReapplyReport { applied: 1, skipped: 0, evicted: 0 });
        assert_eq!(reloaded.inner_html(span), rendered_html);

        assert!(engine.undo(&mut reloaded, &id).await.unwrap());
        assert_eq!(reloaded.text_content(span), "显而易见");
        assert!(engine.stored().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_entries_are_skipped() {
        let local = Arc::new(MemoryStore::new());
        let good = StoredRewrite {
            rewritten: "新".into(),
            rendered: vec![RenderNode::text("新")],
            original: Some("旧".into()),
            created_at: now_millis(),
        };
        let mut page = serde_json::Map::new();
        page.insert("rewrite-1".into(), serde_json::json!("<b>x</b>"));
        page.insert("rewrite-2".into(), serde_json::to_value(&good).unwrap());
        let mut table = serde_json::Map::new();
        table.insert(URL.into(), serde_json::Value::Object(page));
        table.insert("https://oi-wiki.org/other/".into(), serde_json::json!(5));
        local
            .set(keys::REWRITES, serde_json::Value::Object(table))
            .await
            .unwrap();

        let mut doc = Document::from_text("");
        let span = doc.create_element("span");
        doc.set_id(span, "rewrite-2");
        doc.set_text_content(span, "旧");
        doc.append_child(doc.body(), span);

        let engine = engine(&local);
        let report = engine.reapply(&mut doc).await.unwrap();
        assert_eq!(report, ReapplyReport { applied: 1, skipped: 0, evicted: 0 });
        assert!(doc.text_content(span).starts_with("新"));
        let stored = engine.stored().await.unwrap();
        assert_eq!(stored.keys().collect::<Vec<_>>(), vec!["rewrite-2"]);
    }

    #[tokio::test]
    async fn test_malformed_table_reads_as_empty() {
        let local = Arc::new(MemoryStore::new());
        local
            .set(keys::REWRITES, serde_json::json!(["not", "a", "table"]))
            .await
            .unwrap();
        let engine = engine(&local);
        let mut doc = Document::from_text("显而易见");
        assert_eq!(engine.reapply(&mut doc).await.unwrap(), ReapplyReport::default());
        assert!(engine.stored().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unresolved_entry_left_untouched() {
        let local = Arc::new(MemoryStore::new());
        let mut doc = Document::from_text("显而易见");
        let mut engine = engine(&local);
        let selection = select(&doc, "显而易见");
        engine
            .rewrite(&mut doc, &selection, &Canned::new(Ok("清楚地说")))
            .await
            .unwrap();
        let stored_before = local.get(keys::REWRITES).await.unwrap();

        let mut fresh = Document::from_text("显而易见");
        let html_before = fresh.to_html(fresh.root());
        let report = engine.reapply(&mut fresh).await.unwrap();

        assert_eq!(report, ReapplyReport { applied: 0, skipped: 1, evicted: 0 });
        assert_eq!(fresh.to_html(fresh.root()), html_before);
        assert_eq!(local.get(keys::REWRITES).await.unwrap(), stored_before);
    }

    #[tokio::test]
    async fn test_stale_unresolved_entries_evicted() {
        let local = Arc::new(MemoryStore::new());
        let mut table = RewriteTable::new();
        let entry = |created_at| StoredRewrite {
            rewritten: "x".into(),
            rendered: vec![RenderNode::text("x")],
            original: None,
            created_at,
        };
        let day = chrono::Duration::days(1).num_milliseconds();
        let now = 100 * day;
        let page = table.entry(URL.to_string()).or_default();
        page.insert("rewrite-old".into(), entry(now - 31 * day));
        page.insert("rewrite-young".into(), entry(now - day));
        table
            .entry("https://oi-wiki.org/other/".to_string())
            .or_default()
            .insert("rewrite-elsewhere".into(), entry(0));
        store::save(local.as_ref(), keys::REWRITES, &table).await.unwrap();

        let engine = engine(&local);
        let mut doc = Document::from_text("空页面");
        let report = engine.reapply_at(&mut doc, now).await.unwrap();
        assert_eq!(report, ReapplyReport { applied: 0, skipped: 1, evicted: 1 });

        let stored = engine.stored().await.unwrap();
        assert_eq!(stored.keys().collect::<Vec<_>>(), vec!["rewrite-young"]);
        let all: RewriteTable = store::load(local.as_ref(), keys::REWRITES).await.unwrap().unwrap();
        assert!(all.contains_key("https://oi-wiki.org/other/"));
    }

    #[tokio::test]
    async fn test_detached_placeholder_is_reported() {
        let local = Arc::new(MemoryStore::new());
        let mut engine = engine(&local);
        let mut doc = Document::from_text("显而易见");
        let selection = select(&doc, "显而易见");
        let pending = engine.begin(&mut doc, &selection).unwrap();
        let el = doc.get_element_by_id(&pending.id).unwrap();
        doc.detach(el);

        let outcome = engine
            .finish(&mut doc, &pending, Ok("新文本".into()))
            .await
            .unwrap();
        assert_eq!(outcome, RewriteOutcome::Detached { id: pending.id });
        assert!(local.get(keys::REWRITES).await.unwrap().is_none());
    }
}
