//! Inline glossary annotations.
//!
//! Every text node under the page body is scanned with one alternation built
//! from all keywords, longest first, so a keyword that contains another
//! always wins over its substring.

use regex::Regex;
use tracing::debug;

use crate::dom::{Document, Element, NodeId};
use crate::glossary::AnnotationMap;
use crate::render::{mount, render_annotation};

pub const MARKER_CLASS: &str = "annotation-highlight";
pub const MARKER_DATA: &str = "data-annotation";
pub const TOOLTIP_CLASS: &str = "annotation-tooltip";

const SKIPPED_TAGS: [&str; 3] = ["script", "style", "a"];
const TOOLTIP_OFFSET: i32 = 15;

/// Compiled keyword alternation.
#[derive(Debug, Clone)]
pub struct KeywordMatcher {
    pattern: Regex,
}

impl KeywordMatcher {
    /// `None` when the map is empty.
    pub fn new(annotations: &AnnotationMap) -> Option<Self> {
        let mut keywords: Vec<&str> = annotations
            .keys()
            .map(String::as_str)
            .filter(|k| !k.is_empty())
            .collect();
        if keywords.is_empty() {
            return None;
        }
        // Stable: equal lengths keep map order.
        keywords.sort_by_key(|k| std::cmp::Reverse(k.chars().count()));

        let alternation = keywords
            .iter()
            .map(|key| {
                let escaped = regex::escape(key);
                if is_identifier(key) {
                    format!(r"(?-u:\b){escaped}(?-u:\b)")
                } else {
                    escaped
                }
            })
            .collect::<Vec<_>>()
            .join("|");

        match Regex::new(&alternation) {
            Ok(pattern) => Some(Self { pattern }),
            Err(e) => {
                tracing::warn!(error = %e, "could not compile annotation pattern");
                None
            }
        }
    }

    /// Byte ranges of non-overlapping matches, left to right.
    pub fn find_all<'t>(&self, text: &'t str) -> Vec<(usize, usize, &'t str)> {
        self.pattern
            .find_iter(text)
            .filter(|m| !m.as_str().is_empty())
            .map(|m| (m.start(), m.end(), m.as_str()))
            .collect()
    }
}

fn is_identifier(key: &str) -> bool {
    key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_skipped(el: &Element) -> bool {
    SKIPPED_TAGS.contains(&el.tag.as_str()) || el.has_class(MARKER_CLASS)
}

/// Wraps keyword occurrences under body in marker spans. Returns the number
/// of markers created.
pub fn annotate(doc: &mut Document, annotations: &AnnotationMap) -> usize {
    let Some(matcher) = KeywordMatcher::new(annotations) else {
        return 0;
    };

    let candidates: Vec<NodeId> = doc
        .text_nodes(doc.body())
        .into_iter()
        .filter(|&node| doc.closest(node, is_skipped).is_none())
        .collect();

    let mut created = 0;
    for node in candidates {
        let Some(text) = doc.text(node).map(str::to_string) else {
            continue;
        };
        let matches = matcher.find_all(&text);
        if matches.is_empty() {
            continue;
        }

        let mut fragment = Vec::with_capacity(matches.len() * 2 + 1);
        let mut last = 0;
        for (start, end, keyword) in matches {
            if start > last {
                fragment.push(doc.create_text(&text[last..start]));
            }
            let explanation = annotations.get(keyword).map(String::as_str).unwrap_or("");
            fragment.push(create_marker(doc, keyword, explanation));
            created += 1;
            last = end;
        }
        if last < text.len() {
            fragment.push(doc.create_text(&text[last..]));
        }

        if let Err(e) = doc.replace_with(node, &fragment) {
            debug!(error = %e, "text node vanished before annotation");
        }
    }

    debug!(markers = created, keywords = annotations.len(), "annotated page");
    created
}

fn create_marker(doc: &mut Document, keyword: &str, explanation: &str) -> NodeId {
    let span = doc.create_element("span");
    doc.add_class(span, MARKER_CLASS);
    doc.set_attr(span, MARKER_DATA, explanation);
    doc.set_text_content(span, keyword);
    span
}

/// The single shared tooltip, created on first use.
#[derive(Debug, Default)]
pub struct Tooltip {
    element: Option<NodeId>,
    visible: bool,
}

impl Tooltip {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn element(&self) -> Option<NodeId> {
        self.element
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    fn ensure(&mut self, doc: &mut Document) -> NodeId {
        if let Some(el) = self.element.filter(|&el| doc.is_attached(el)) {
            return el;
        }
        let el = doc.create_element("div");
        doc.add_class(el, TOOLTIP_CLASS);
        doc.append_child(doc.body(), el);
        self.element = Some(el);
        el
    }

    /// Pointer entered `target`; shows the explanation if it is a marker.
    pub fn show(&mut self, doc: &mut Document, target: NodeId) -> bool {
        if !doc.has_class(target, MARKER_CLASS) {
            return false;
        }
        let explanation = doc.attr(target, MARKER_DATA).unwrap_or("").to_string();
        let el = self.ensure(doc);
        doc.clear_children(el);
        mount(doc, el, &render_annotation(&explanation));
        doc.add_class(el, "visible");
        self.visible = true;
        true
    }

    /// Pointer moved; positions are page coordinates.
    pub fn move_to(&mut self, doc: &mut Document, x: i32, y: i32) {
        let Some(el) = self.element else { return };
        doc.set_attr(
            el,
            "style",
            &format!("left: {}px; top: {}px;", x + TOOLTIP_OFFSET, y + TOOLTIP_OFFSET),
        );
    }

    /// Pointer left `target`.
    pub fn hide(&mut self, doc: &mut Document, target: NodeId) {
        if !doc.has_class(target, MARKER_CLASS) {
            return;
        }
        if let Some(el) = self.element {
            doc.remove_class(el, "visible");
        }
        self.visible = false;
    }
}
