//! A small typed document tree.
//!
//! Nodes live in an arena owned by [`Document`] and are addressed by
//! [`NodeId`]. Detached nodes stay in the arena; lookups that should only see
//! the live page (`get_element_by_id`, tree walks) start from the root.
//! Text offsets in [`Boundary`] are counted in chars, not bytes.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Element {
    pub tag: String,
    pub id: Option<String>,
    pub classes: Vec<String>,
    pub attrs: BTreeMap<String, String>,
}

impl Element {
    pub fn has_class(&self, class: &str) -> bool {
        self.classes.iter().any(|c| c == class)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeData {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone)]
struct Node {
    data: NodeData,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomError {
    #[error("node is not a text node")]
    NotText,
    #[error("node is not an element")]
    NotElement,
    #[error("node is not attached to a parent")]
    Detached,
    #[error("range offset {offset} is out of bounds")]
    OffsetOutOfBounds { offset: usize },
    #[error("range end precedes its start")]
    Inverted,
}

pub struct Document {
    nodes: Vec<Node>,
    root: NodeId,
    body: NodeId,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// An empty `<html><body></body></html>` document.
    pub fn new() -> Self {
        let mut doc = Self {
            nodes: Vec::new(),
            root: NodeId(0),
            body: NodeId(0),
        };
        doc.root = doc.create_element("html");
        doc.body = doc.create_element("body");
        doc.append_child(doc.root, doc.body);
        doc
    }

    /// Builds a wiki-like page from plain text: one `<p>` per blank-line
    /// separated paragraph inside the main content container.
    pub fn from_text(text: &str) -> Self {
        let mut doc = Self::new();
        let article = doc.create_element("article");
        doc.add_class(article, "md-content__inner");
        doc.add_class(article, "md-typeset");
        doc.append_child(doc.body, article);

        for paragraph in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
            let p = doc.create_element("p");
            let t = doc.create_text(paragraph);
            doc.append_child(p, t);
            doc.append_child(article, p);
        }
        doc
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn body(&self) -> NodeId {
        self.body
    }

    pub fn create_element(&mut self, tag: &str) -> NodeId {
        self.push(NodeData::Element(Element {
            tag: tag.to_string(),
            ..Element::default()
        }))
    }

    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.push(NodeData::Text(text.to_string()))
    }

    fn push(&mut self, data: NodeData) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            data,
            parent: None,
            children: Vec::new(),
        });
        id
    }

    pub fn data(&self, node: NodeId) -> &NodeData {
        &self.nodes[node.0].data
    }

    pub fn element(&self, node: NodeId) -> Option<&Element> {
        match &self.nodes[node.0].data {
            NodeData::Element(el) => Some(el),
            NodeData::Text(_) => None,
        }
    }

    pub fn element_mut(&mut self, node: NodeId) -> Option<&mut Element> {
        match &mut self.nodes[node.0].data {
            NodeData::Element(el) => Some(el),
            NodeData::Text(_) => None,
        }
    }

    pub fn text(&self, node: NodeId) -> Option<&str> {
        match &self.nodes[node.0].data {
            NodeData::Text(t) => Some(t),
            NodeData::Element(_) => None,
        }
    }

    pub fn set_text(&mut self, node: NodeId, text: &str) -> Result<(), DomError> {
        match &mut self.nodes[node.0].data {
            NodeData::Text(t) => {
                *t = text.to_string();
                Ok(())
            }
            NodeData::Element(_) => Err(DomError::NotText),
        }
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes[node.0].parent
    }

    pub fn children(&self, node: NodeId) -> &[NodeId] {
        &self.nodes[node.0].children
    }

    pub fn is_attached(&self, node: NodeId) -> bool {
        let mut current = node;
        while let Some(parent) = self.parent(current) {
            current = parent;
        }
        current == self.root
    }

    // ---- attributes ----

    pub fn set_id(&mut self, node: NodeId, id: &str) {
        if let Some(el) = self.element_mut(node) {
            el.id = Some(id.to_string());
        }
    }

    pub fn has_class(&self, node: NodeId, class: &str) -> bool {
        self.element(node).is_some_and(|el| el.has_class(class))
    }

    pub fn add_class(&mut self, node: NodeId, class: &str) {
        if let Some(el) = self.element_mut(node) {
            if !el.has_class(class) {
                el.classes.push(class.to_string());
            }
        }
    }

    pub fn remove_class(&mut self, node: NodeId, class: &str) {
        if let Some(el) = self.element_mut(node) {
            el.classes.retain(|c| c != class);
        }
    }

    /// Replaces the whole class list.
    pub fn set_class(&mut self, node: NodeId, class: &str) {
        if let Some(el) = self.element_mut(node) {
            el.classes = class.split_whitespace().map(str::to_string).collect();
        }
    }

    pub fn set_attr(&mut self, node: NodeId, name: &str, value: &str) {
        if let Some(el) = self.element_mut(node) {
            el.attrs.insert(name.to_string(), value.to_string());
        }
    }

    pub fn attr(&self, node: NodeId, name: &str) -> Option<&str> {
        self.element(node)?.attrs.get(name).map(String::as_str)
    }

    // ---- structure ----

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        self.detach(child);
        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].children.push(child);
    }

    /// Inserts `child` before `reference`, or at the end when `reference` is
    /// `None` or not a child of `parent`.
    pub fn insert_before(&mut self, parent: NodeId, child: NodeId, reference: Option<NodeId>) {
        self.detach(child);
        let siblings = &mut self.nodes[parent.0].children;
        let index = reference
            .and_then(|r| siblings.iter().position(|&c| c == r))
            .unwrap_or(siblings.len());
        siblings.insert(index, child);
        self.nodes[child.0].parent = Some(parent);
    }

    pub fn insert_after(&mut self, node: NodeId, new: NodeId) -> Result<(), DomError> {
        let parent = self.parent(node).ok_or(DomError::Detached)?;
        let next = self.next_sibling(node);
        self.insert_before(parent, new, next);
        Ok(())
    }

    pub fn next_sibling(&self, node: NodeId) -> Option<NodeId> {
        let parent = self.parent(node)?;
        let siblings = self.children(parent);
        let index = siblings.iter().position(|&c| c == node)?;
        siblings.get(index + 1).copied()
    }

    pub fn detach(&mut self, node: NodeId) {
        if let Some(parent) = self.nodes[node.0].parent.take() {
            self.nodes[parent.0].children.retain(|&c| c != node);
        }
    }

    /// Swaps `node` for `replacements` at the same position.
    pub fn replace_with(&mut self, node: NodeId, replacements: &[NodeId]) -> Result<(), DomError> {
        let parent = self.parent(node).ok_or(DomError::Detached)?;
        let next = self.next_sibling(node);
        self.detach(node);
        for &replacement in replacements {
            self.insert_before(parent, replacement, next);
        }
        Ok(())
    }

    pub fn clear_children(&mut self, node: NodeId) {
        let children = std::mem::take(&mut self.nodes[node.0].children);
        for child in children {
            self.nodes[child.0].parent = None;
        }
    }

    /// Replaces all children of `node` with a single text node.
    pub fn set_text_content(&mut self, node: NodeId, text: &str) {
        self.clear_children(node);
        if !text.is_empty() {
            let t = self.create_text(text);
            self.append_child(node, t);
        }
    }

    // ---- queries ----

    /// `node` and everything below it, in document order.
    pub fn descendants(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            out.push(current);
            stack.extend(self.children(current).iter().rev().copied());
        }
        out
    }

    pub fn text_nodes(&self, node: NodeId) -> Vec<NodeId> {
        self.descendants(node)
            .into_iter()
            .filter(|&n| self.text(n).is_some())
            .collect()
    }

    pub fn text_content(&self, node: NodeId) -> String {
        self.text_nodes(node)
            .into_iter()
            .filter_map(|n| self.text(n))
            .collect()
    }

    /// Only attached elements resolve.
    pub fn get_element_by_id(&self, id: &str) -> Option<NodeId> {
        self.descendants(self.root)
            .into_iter()
            .find(|&n| self.element(n).and_then(|el| el.id.as_deref()) == Some(id))
    }

    pub fn find_first(&self, pred: impl Fn(&Element) -> bool) -> Option<NodeId> {
        self.descendants(self.root)
            .into_iter()
            .find(|&n| self.element(n).is_some_and(&pred))
    }

    /// Nearest element at or above `node` matching `pred`. Text nodes start
    /// from their parent element.
    pub fn closest(&self, node: NodeId, pred: impl Fn(&Element) -> bool) -> Option<NodeId> {
        let mut current = Some(node);
        while let Some(n) = current {
            if let Some(el) = self.element(n) {
                if pred(el) {
                    return Some(n);
                }
            }
            current = self.parent(n);
        }
        None
    }

    /// First occurrence of `needle` inside a single text node under body.
    pub fn find_text(&self, needle: &str) -> Option<Range> {
        if needle.is_empty() {
            return None;
        }
        self.text_nodes(self.body).into_iter().find_map(|node| {
            let text = self.text(node)?;
            let byte = text.find(needle)?;
            let start = text[..byte].chars().count();
            Some(Range {
                start: Boundary { node, offset: start },
                end: Boundary {
                    node,
                    offset: start + needle.chars().count(),
                },
            })
        })
    }

    // ---- ranges ----

    pub fn range_text(&self, range: &Range) -> Result<String, DomError> {
        let (start_text, end_text) = self.range_texts(range)?;
        if range.start.node == range.end.node {
            return Ok(char_slice(start_text, range.start.offset, range.end.offset).to_string());
        }

        let mut out = char_slice(start_text, range.start.offset, usize::MAX).to_string();
        for node in self.contained_nodes(range)? {
            out.push_str(&self.text_content(node));
        }
        out.push_str(char_slice(end_text, 0, range.end.offset));
        Ok(out)
    }

    /// Removes the range's contents and puts `new` where the range started.
    pub fn replace_range(&mut self, range: &Range, new: NodeId) -> Result<(), DomError> {
        let (start_text, end_text) = self.range_texts(range)?;
        let start_text = start_text.to_string();
        let end_text = end_text.to_string();

        if range.start.node == range.end.node {
            let before = char_slice(&start_text, 0, range.start.offset).to_string();
            let after = char_slice(&start_text, range.end.offset, usize::MAX).to_string();
            self.set_text(range.start.node, &before)?;
            self.insert_after(range.start.node, new)?;
            if !after.is_empty() {
                let tail = self.create_text(&after);
                self.insert_after(new, tail)?;
            }
        } else {
            let contained = self.contained_nodes(range)?;
            let before = char_slice(&start_text, 0, range.start.offset).to_string();
            let after = char_slice(&end_text, range.end.offset, usize::MAX).to_string();
            self.set_text(range.start.node, &before)?;
            self.set_text(range.end.node, &after)?;
            for node in contained {
                self.detach(node);
            }
            self.insert_after(range.start.node, new)?;
            if after.is_empty() {
                self.detach(range.end.node);
            }
        }

        if self.text(range.start.node) == Some("") {
            self.detach(range.start.node);
        }
        Ok(())
    }

    fn range_texts(&self, range: &Range) -> Result<(&str, &str), DomError> {
        let start = self.text(range.start.node).ok_or(DomError::NotText)?;
        let end = self.text(range.end.node).ok_or(DomError::NotText)?;
        for (text, offset) in [(start, range.start.offset), (end, range.end.offset)] {
            if offset > text.chars().count() {
                return Err(DomError::OffsetOutOfBounds { offset });
            }
        }
        if range.start.node == range.end.node && range.end.offset < range.start.offset {
            return Err(DomError::Inverted);
        }
        Ok((start, end))
    }

    /// Top-most nodes lying strictly between the range's start and end text
    /// nodes, excluding ancestors of either end.
    fn contained_nodes(&self, range: &Range) -> Result<Vec<NodeId>, DomError> {
        let order = self.descendants(self.root);
        let start = order
            .iter()
            .position(|&n| n == range.start.node)
            .ok_or(DomError::Detached)?;
        let end = order
            .iter()
            .position(|&n| n == range.end.node)
            .ok_or(DomError::Detached)?;
        if end < start {
            return Err(DomError::Inverted);
        }

        let end_ancestors = self.ancestors(range.end.node);
        let inner: Vec<NodeId> = order[start + 1..end]
            .iter()
            .copied()
            .filter(|n| !end_ancestors.contains(n))
            .collect();
        Ok(inner
            .iter()
            .copied()
            .filter(|&n| self.parent(n).map_or(true, |p| !inner.contains(&p)))
            .collect())
    }

    fn ancestors(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut current = self.parent(node);
        while let Some(n) = current {
            out.push(n);
            current = self.parent(n);
        }
        out
    }

    // ---- serialization ----

    pub fn to_html(&self, node: NodeId) -> String {
        let mut out = String::new();
        self.write_html(node, &mut out);
        out
    }

    pub fn inner_html(&self, node: NodeId) -> String {
        let mut out = String::new();
        for &child in self.children(node) {
            self.write_html(child, &mut out);
        }
        out
    }

    fn write_html(&self, node: NodeId, out: &mut String) {
        match self.data(node) {
            NodeData::Text(text) => out.push_str(&escape_html(text)),
            NodeData::Element(el) => {
                let _ = write!(out, "<{}", el.tag);
                if let Some(id) = &el.id {
                    let _ = write!(out, " id=\"{}\"", escape_html(id));
                }
                if !el.classes.is_empty() {
                    let _ = write!(out, " class=\"{}\"", escape_html(&el.classes.join(" ")));
                }
                for (name, value) in &el.attrs {
                    let _ = write!(out, " {}=\"{}\"", name, escape_html(value));
                }
                out.push('>');
                if is_void(&el.tag) {
                    return;
                }
                for &child in self.children(node) {
                    self.write_html(child, out);
                }
                let _ = write!(out, "</{}>", el.tag);
            }
        }
    }
}

fn is_void(tag: &str) -> bool {
    matches!(tag, "br" | "hr" | "img" | "input")
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Slice by char positions, clamped to the string.
fn char_slice(text: &str, start: usize, end: usize) -> &str {
    let byte_at = |idx: usize| {
        text.char_indices()
            .nth(idx)
            .map(|(i, _)| i)
            .unwrap_or(text.len())
    };
    let start = byte_at(start);
    let end = byte_at(end).max(start);
    &text[start..end]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Boundary {
    pub node: NodeId,
    pub offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: Boundary,
    pub end: Boundary,
}

impl Range {
    pub fn collapsed(&self) -> bool {
        self.start == self.end
    }
}

/// The page's current selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    ranges: Vec<Range>,
}

impl Selection {
    pub fn new(range: Range) -> Self {
        Self { ranges: vec![range] }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    pub fn first_range(&self) -> Option<&Range> {
        self.ranges.first()
    }

    pub fn is_collapsed(&self) -> bool {
        self.ranges.iter().all(Range::collapsed)
    }

    pub fn text(&self, doc: &Document) -> String {
        self.ranges
            .iter()
            .filter_map(|r| doc.range_text(r).ok())
            .collect()
    }
}
