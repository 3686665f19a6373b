//! The ask-AI dialog and its conversation.

use tracing::{debug, warn};

use crate::annotate::TOOLTIP_CLASS;
use crate::bridge::{StreamConnector, StreamUpdate};
use crate::dom::{Document, NodeData, NodeId};
use crate::render::{mount, render_markdown};
use crate::state::{ChatMessage, ConversationHistory};

pub const DIALOG_ID: &str = "ai-dialog";
pub const MESSAGES_ID: &str = "ai-dialog-messages";
pub const DEFAULT_CONTEXT_CHARS: usize = 4000;

const THINKING_TEXT: &str = "正在思考...";
const HINT_PREVIEW_CHARS: usize = 100;

/// Selectors tried in order for the page's main text.
const CONTENT_CLASSES: [&[&str]; 1] = [&["md-content__inner", "md-typeset"]];
const CONTENT_TAGS: [&str; 2] = ["article", "main"];

/// Elements whose text starts on its own line.
const BLOCK_TAGS: [&str; 20] = [
    "p", "div", "section", "article", "main", "header", "footer", "nav", "ul", "ol", "li",
    "pre", "blockquote", "table", "tr", "h1", "h2", "h3", "h4", "br",
];

/// Text of the main content area, one line per block, cut to `limit` chars
/// and trimmed. The dialog and the tooltip never count as page text.
pub fn visible_page_text(doc: &Document, limit: usize) -> String {
    let container = CONTENT_CLASSES
        .iter()
        .find_map(|classes| doc.find_first(|el| classes.iter().all(|c| el.has_class(c))))
        .or_else(|| {
            CONTENT_TAGS
                .iter()
                .find_map(|tag| doc.find_first(|el| el.tag == *tag))
        })
        .unwrap_or(doc.body());
    let mut raw = String::new();
    collect_block_text(doc, container, &mut raw);
    let lines: Vec<&str> = raw.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    let text: String = lines.join("\n").chars().take(limit).collect();
    text.trim().to_string()
}

fn collect_block_text(doc: &Document, node: NodeId, out: &mut String) {
    let el = match doc.data(node) {
        NodeData::Text(text) => {
            out.push_str(text);
            return;
        }
        NodeData::Element(el) => el,
    };
    if el.id.as_deref() == Some(DIALOG_ID)
        || el.has_class(TOOLTIP_CLASS)
        || matches!(el.tag.as_str(), "script" | "style")
    {
        return;
    }
    let block = BLOCK_TAGS.contains(&el.tag.as_str());
    if block {
        out.push('\n');
    }
    for &child in doc.children(node) {
        collect_block_text(doc, child, out);
    }
    if block {
        out.push('\n');
    }
}

pub fn system_prompt(page_text: &str) -> String {
    format!(
        "你是一个专业的算法竞赛教练和计算机科学专家，名叫OI Copilot。用户正在阅读 OI-Wiki 的以下内容：\n\n===== 页面内容 =====\n{page_text}\n===== 页面内容结束 =====\n\n请基于以上内容回答用户的问题，用通俗易懂的语言解释算法和数据结构概念。"
    )
}

/// The user turn as sent, with any quoted selection in front.
pub fn user_turn(selection: &str, question: &str) -> String {
    if selection.is_empty() {
        question.to_string()
    } else {
        format!("【引用内容】: \"{selection}\"\n\n【我的问题】: {question}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AskOutcome {
    /// Blank question, nothing sent.
    Ignored,
    Answered(String),
    Failed(String),
}

/// One open dialog. Dropping it discards the conversation.
pub struct AskSession {
    dialog: NodeId,
    messages: NodeId,
    history: ConversationHistory,
    selection: String,
}

impl AskSession {
    /// Opens (or reuses) the dialog and starts a fresh conversation.
    pub fn start(doc: &mut Document, selection_text: &str, context_chars: usize) -> Self {
        let (dialog, messages) = ensure_dialog(doc);
        doc.clear_children(messages);

        let page_text = visible_page_text(doc, context_chars);
        let mut session = Self {
            dialog,
            messages,
            history: vec![ChatMessage::system(system_prompt(&page_text))],
            selection: String::new(),
        };
        session.update_selection(doc, selection_text);
        doc.add_class(dialog, "show");
        debug!(context_chars = page_text.chars().count(), "ask session started");
        session
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn selection(&self) -> &str {
        &self.selection
    }

    pub fn dialog(&self) -> NodeId {
        self.dialog
    }

    pub fn messages(&self) -> NodeId {
        self.messages
    }

    /// Replaces the quoted selection; an empty string drops the quote.
    pub fn update_selection(&mut self, doc: &mut Document, selection_text: &str) {
        self.selection = selection_text.to_string();
        if let Some(old) = doc
            .children(self.messages)
            .iter()
            .copied()
            .find(|&n| doc.has_class(n, "system-message"))
        {
            doc.detach(old);
        }
        if self.selection.is_empty() {
            return;
        }

        let preview: String = self.selection.chars().take(HINT_PREVIEW_CHARS).collect();
        let ellipsis = if self.selection.chars().count() > HINT_PREVIEW_CHARS { "..." } else { "" };
        let hint = bubble(doc, "system-message");
        let content = doc.create_element("div");
        doc.add_class(content, "message-content");
        doc.set_text_content(content, &format!("📎 已引用选中内容: \"{preview}{ellipsis}\""));
        doc.append_child(hint, content);
        doc.insert_before(self.messages, hint, doc.children(self.messages).first().copied());
    }

    pub async fn send(
        &mut self,
        doc: &mut Document,
        question: &str,
        connector: &dyn StreamConnector,
    ) -> AskOutcome {
        self.send_with(doc, question, connector, |_| {}).await
    }

    /// Streams one answer into a new assistant bubble, calling `on_update`
    /// for every update.
    pub async fn send_with<F>(
        &mut self,
        doc: &mut Document,
        question: &str,
        connector: &dyn StreamConnector,
        mut on_update: F,
    ) -> AskOutcome
    where
        F: FnMut(&StreamUpdate) + Send,
    {
        let question = question.trim();
        if question.is_empty() {
            return AskOutcome::Ignored;
        }

        let user = bubble(doc, "user-message");
        let user_content = doc.create_element("div");
        doc.add_class(user_content, "message-content");
        doc.set_text_content(user_content, question);
        doc.append_child(user, user_content);
        doc.append_child(self.messages, user);

        let assistant = bubble(doc, "assistant-message");
        let content = doc.create_element("div");
        doc.set_class(content, "message-content thinking");
        doc.set_text_content(content, THINKING_TEXT);
        doc.append_child(assistant, content);
        doc.append_child(self.messages, assistant);

        let turn = user_turn(&self.selection, question);
        let mut outgoing = self.history.clone();
        outgoing.push(ChatMessage::user(turn.clone()));

        let mut reader = match connector.open_stream(outgoing).await {
            Ok(reader) => reader,
            Err(error) => {
                let update = StreamUpdate::Failed(error);
                on_update(&update);
                return show_failure(doc, content, update);
            }
        };

        while let Some(update) = reader.next().await {
            on_update(&update);
            match update {
                StreamUpdate::Progress(ref text) => {
                    doc.remove_class(content, "thinking");
                    doc.clear_children(content);
                    mount(doc, content, &render_markdown(text));
                }
                StreamUpdate::Done(text) => {
                    doc.remove_class(content, "thinking");
                    doc.clear_children(content);
                    mount(doc, content, &render_markdown(&text));
                    self.history.push(ChatMessage::user(turn));
                    self.history.push(ChatMessage::assistant(text.clone()));
                    return AskOutcome::Answered(text);
                }
                failed @ StreamUpdate::Failed(_) => return show_failure(doc, content, failed),
            }
        }
        show_failure(doc, content, StreamUpdate::Failed("stream ended unexpectedly".to_string()))
    }

    /// Hides the dialog and ends the session.
    pub fn close(self, doc: &mut Document) {
        doc.remove_class(self.dialog, "show");
    }
}

fn show_failure(doc: &mut Document, content: NodeId, update: StreamUpdate) -> AskOutcome {
    let StreamUpdate::Failed(error) = update else {
        return AskOutcome::Ignored;
    };
    warn!(%error, "ask failed");
    doc.set_class(content, "message-content error");
    doc.set_text_content(content, &format!("出错了: {error}"));
    AskOutcome::Failed(error)
}

fn bubble(doc: &mut Document, kind: &str) -> NodeId {
    let el = doc.create_element("div");
    doc.add_class(el, "ai-message");
    doc.add_class(el, kind);
    el
}

/// Returns the dialog and its message list, creating them on first use.
fn ensure_dialog(doc: &mut Document) -> (NodeId, NodeId) {
    if let (Some(dialog), Some(messages)) = (
        doc.get_element_by_id(DIALOG_ID),
        doc.get_element_by_id(MESSAGES_ID),
    ) {
        return (dialog, messages);
    }

    let dialog = doc.create_element("div");
    doc.set_id(dialog, DIALOG_ID);
    let header = doc.create_element("div");
    doc.add_class(header, "ai-dialog-header");
    doc.set_text_content(header, "OI Copilot");
    let messages = doc.create_element("div");
    doc.set_id(messages, MESSAGES_ID);
    let input = doc.create_element("textarea");
    doc.set_id(input, "ai-dialog-input");

    doc.append_child(dialog, header);
    doc.append_child(dialog, messages);
    doc.append_child(dialog, input);
    doc.append_child(doc.body(), dialog);
    (dialog, messages)
}
