//! Structured fragment builder for model output and annotation tooltips.
//!
//! Rendering never produces markup strings from user or model text. It builds
//! a [`RenderNode`] tree, which is either mounted into a [`Document`] or
//! serialized with escaping. Math is carried as source in [`RenderNode::Math`];
//! typesetting it is the host's business.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::dom::{escape_html, Document, NodeId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RenderNode {
    Text {
        text: String,
    },
    Element {
        tag: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        class: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        href: Option<String>,
        #[serde(default)]
        children: Vec<RenderNode>,
    },
    Math {
        latex: String,
        display: bool,
    },
    LineBreak,
}

impl RenderNode {
    pub fn text(text: impl Into<String>) -> Self {
        RenderNode::Text { text: text.into() }
    }

    pub fn element(tag: &str, children: Vec<RenderNode>) -> Self {
        RenderNode::Element {
            tag: tag.to_string(),
            class: None,
            href: None,
            children,
        }
    }

    pub fn with_class(mut self, value: &str) -> Self {
        if let RenderNode::Element { class, .. } = &mut self {
            *class = Some(value.to_string());
        }
        self
    }

    fn link(href: &str, children: Vec<RenderNode>) -> Self {
        RenderNode::Element {
            tag: "a".to_string(),
            class: None,
            href: Some(href.to_string()),
            children,
        }
    }
}

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static pattern"))
}

fn inline_pattern() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    regex(
        &CELL,
        r"(?s)\$\$(?P<dmath>.+?)\$\$|\\\[(?P<bmath>.+?)\\\]|\$(?P<imath>[^$\n]+?)\$|\\\((?P<pmath>.+?)\\\)|\*\*(?P<strong>.+?)\*\*|\*(?P<em>[^*\n]+?)\*|`(?P<code>[^`]+)`|\[(?P<label>[^\]]*)\]\((?P<href>https?:[^)\s]+)\)",
    )
}

fn heading_pattern() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    regex(&CELL, r"^(#{1,6})\s+(.*)$")
}

fn list_pattern() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    regex(&CELL, r"^(?:- |\* )(.*)$")
}

fn blank_lines_pattern() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    regex(&CELL, r"\n\s*\n")
}

/// Markdown subset plus TeX math: headings, lists, paragraphs, strong,
/// emphasis, code, http(s) links, `$..$`, `$$..$$`, `\(..\)` and `\[..\]`.
pub fn render_markdown(text: &str) -> Vec<RenderNode> {
    let text = text.replace("\r\n", "\n");
    let mut out = Vec::new();

    for block in blank_lines_pattern().split(&text) {
        let mut paragraph: Vec<&str> = Vec::new();
        let mut items: Vec<RenderNode> = Vec::new();

        for line in block.lines() {
            if let Some(caps) = heading_pattern().captures(line) {
                flush_paragraph(&mut paragraph, &mut out);
                flush_list(&mut items, &mut out);
                let tag = format!("h{}", caps[1].len());
                out.push(RenderNode::element(&tag, render_inline(caps[2].trim())));
            } else if let Some(caps) = list_pattern().captures(line) {
                flush_paragraph(&mut paragraph, &mut out);
                items.push(RenderNode::element("li", render_inline(&caps[1])));
            } else {
                flush_list(&mut items, &mut out);
                paragraph.push(line);
            }
        }
        flush_paragraph(&mut paragraph, &mut out);
        flush_list(&mut items, &mut out);
    }
    out
}

fn flush_paragraph(lines: &mut Vec<&str>, out: &mut Vec<RenderNode>) {
    let joined = lines.join("\n");
    lines.clear();
    if joined.trim().is_empty() {
        return;
    }
    out.push(RenderNode::element("p", with_line_breaks(render_inline(&joined))));
}

fn flush_list(items: &mut Vec<RenderNode>, out: &mut Vec<RenderNode>) {
    if !items.is_empty() {
        out.push(RenderNode::element("ul", std::mem::take(items)));
    }
}

/// Splits newlines inside top-level text nodes into explicit breaks.
fn with_line_breaks(nodes: Vec<RenderNode>) -> Vec<RenderNode> {
    let mut out = Vec::new();
    for node in nodes {
        match node {
            RenderNode::Text { text } if text.contains('\n') => {
                for (i, line) in text.split('\n').enumerate() {
                    if i > 0 {
                        out.push(RenderNode::LineBreak);
                    }
                    if !line.is_empty() {
                        out.push(RenderNode::text(line));
                    }
                }
            }
            other => out.push(other),
        }
    }
    out
}

fn render_inline(text: &str) -> Vec<RenderNode> {
    let mut out = Vec::new();
    let mut last = 0;
    for caps in inline_pattern().captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        if whole.start() > last {
            out.push(RenderNode::text(&text[last..whole.start()]));
        }
        out.push(inline_node(&caps));
        last = whole.end();
    }
    if last < text.len() {
        out.push(RenderNode::text(&text[last..]));
    }
    out
}

fn inline_node(caps: &Captures<'_>) -> RenderNode {
    let group = |name: &str| caps.name(name).map(|m| m.as_str());

    if let Some(latex) = group("dmath").or_else(|| group("bmath")) {
        RenderNode::Math {
            latex: latex.trim().to_string(),
            display: true,
        }
    } else if let Some(latex) = group("imath").or_else(|| group("pmath")) {
        RenderNode::Math {
            latex: latex.trim().to_string(),
            display: false,
        }
    } else if let Some(inner) = group("strong") {
        RenderNode::element("strong", render_inline(inner))
    } else if let Some(inner) = group("em") {
        RenderNode::element("em", render_inline(inner))
    } else if let Some(code) = group("code") {
        RenderNode::element("code", vec![RenderNode::text(code)])
    } else if let (Some(label), Some(href)) = (group("label"), group("href")) {
        RenderNode::link(href, vec![RenderNode::text(label)])
    } else {
        RenderNode::text(caps.get(0).map_or("", |m| m.as_str()))
    }
}

fn annotation_math_pattern() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    regex(&CELL, r"(?s)\$\$(?P<dmath>.*?)\$\$|\$(?P<imath>.*?)\$")
}

fn latin_word_pattern() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    regex(&CELL, r"(?-u:\b)[a-zA-Z]{2,}(?-u:\b)")
}

/// Tooltip/card rendering: TeX math, with latin words set in the math font.
pub fn render_annotation(text: &str) -> Vec<RenderNode> {
    let mut out = Vec::new();
    let mut last = 0;
    for caps in annotation_math_pattern().captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        push_styled_words(&text[last..whole.start()], &mut out);
        let (latex, display) = match (caps.name("dmath"), caps.name("imath")) {
            (Some(m), _) => (m.as_str(), true),
            (None, Some(m)) => (m.as_str(), false),
            (None, None) => ("", false),
        };
        out.push(RenderNode::Math {
            latex: latex.to_string(),
            display,
        });
        last = whole.end();
    }
    push_styled_words(&text[last..], &mut out);
    out
}

fn push_styled_words(text: &str, out: &mut Vec<RenderNode>) {
    let mut last = 0;
    for word in latin_word_pattern().find_iter(text) {
        if word.start() > last {
            out.push(RenderNode::text(&text[last..word.start()]));
        }
        out.push(
            RenderNode::element("span", vec![RenderNode::text(word.as_str())]).with_class("math-font"),
        );
        last = word.end();
    }
    if last < text.len() {
        out.push(RenderNode::text(&text[last..]));
    }
}

/// Creates document nodes for `nodes` under `parent`.
pub fn mount(doc: &mut Document, parent: NodeId, nodes: &[RenderNode]) {
    for node in nodes {
        let id = match node {
            RenderNode::Text { text } => doc.create_text(text),
            RenderNode::LineBreak => doc.create_element("br"),
            RenderNode::Math { latex, display } => {
                let span = doc.create_element("span");
                doc.set_class(span, if *display { "math math-display" } else { "math math-inline" });
                doc.set_attr(span, "data-latex", latex);
                doc.set_text_content(span, latex);
                span
            }
            RenderNode::Element {
                tag,
                class,
                href,
                children,
            } => {
                let el = doc.create_element(tag);
                if let Some(class) = class {
                    doc.set_class(el, class);
                }
                if let Some(href) = href {
                    doc.set_attr(el, "href", href);
                    doc.set_attr(el, "target", "_blank");
                    doc.set_attr(el, "rel", "noopener noreferrer");
                }
                mount(doc, el, children);
                el
            }
        };
        doc.append_child(parent, id);
    }
}

/// Serializes a fragment, escaping every piece of text.
pub fn to_html(nodes: &[RenderNode]) -> String {
    let mut doc = Document::new();
    let holder = doc.create_element("div");
    mount(&mut doc, holder, nodes);
    doc.inner_html(holder)
}
