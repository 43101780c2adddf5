//! Persisted document representation.
//!
//! Documents are stored as a recursive node tree in the ProseMirror/TipTap
//! JSON shape:
//!
//! ```text
//! { "type": "doc", "content": [
//!     { "type": "heading", "attrs": { "level": 1 }, "content": [
//!         { "type": "text", "text": "Title", "marks": [{ "type": "bold" }] }
//!     ]}
//! ]}
//! ```
//!
//! Parsing is strict: node and mark types outside the editor schema are
//! rejected instead of being carried through untyped.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Maximum nesting accepted when parsing a tree.
pub const MAX_DEPTH: usize = 128;

/// Node types understood by the editor schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeKind {
    Doc,
    Paragraph,
    Text,
    Heading,
    Blockquote,
    BulletList,
    OrderedList,
    ListItem,
    CodeBlock,
    HardBreak,
    HorizontalRule,
    Image,
    Table,
    TableRow,
    TableCell,
    TableHeader,
}

impl NodeKind {
    pub const ALL: [NodeKind; 16] = [
        NodeKind::Doc,
        NodeKind::Paragraph,
        NodeKind::Text,
        NodeKind::Heading,
        NodeKind::Blockquote,
        NodeKind::BulletList,
        NodeKind::OrderedList,
        NodeKind::ListItem,
        NodeKind::CodeBlock,
        NodeKind::HardBreak,
        NodeKind::HorizontalRule,
        NodeKind::Image,
        NodeKind::Table,
        NodeKind::TableRow,
        NodeKind::TableCell,
        NodeKind::TableHeader,
    ];

    /// The `type` tag used in JSON and as the XML element name.
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Doc => "doc",
            NodeKind::Paragraph => "paragraph",
            NodeKind::Text => "text",
            NodeKind::Heading => "heading",
            NodeKind::Blockquote => "blockquote",
            NodeKind::BulletList => "bulletList",
            NodeKind::OrderedList => "orderedList",
            NodeKind::ListItem => "listItem",
            NodeKind::CodeBlock => "codeBlock",
            NodeKind::HardBreak => "hardBreak",
            NodeKind::HorizontalRule => "horizontalRule",
            NodeKind::Image => "image",
            NodeKind::Table => "table",
            NodeKind::TableRow => "tableRow",
            NodeKind::TableCell => "tableCell",
            NodeKind::TableHeader => "tableHeader",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.as_str() == tag)
    }
}

/// Inline formatting applied to a text node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MarkKind {
    Bold,
    Italic,
    Strike,
    Link,
    Code,
}

impl MarkKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MarkKind::Bold => "bold",
            MarkKind::Italic => "italic",
            MarkKind::Strike => "strike",
            MarkKind::Link => "link",
            MarkKind::Code => "code",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        [
            MarkKind::Bold,
            MarkKind::Italic,
            MarkKind::Strike,
            MarkKind::Link,
            MarkKind::Code,
        ]
        .into_iter()
        .find(|kind| kind.as_str() == tag)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Mark {
    #[serde(rename = "type")]
    pub kind: MarkKind,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, Value>,
}

impl Mark {
    pub fn new(kind: MarkKind) -> Self {
        Self {
            kind,
            attrs: BTreeMap::new(),
        }
    }

    /// Parse a single mark.
    pub fn from_value(value: &Value) -> Result<Self, NodeError> {
        Self::parse(value)
    }

    fn parse(value: &Value) -> Result<Self, NodeError> {
        let obj = value
            .as_object()
            .ok_or_else(|| NodeError::Malformed("mark must be an object".into()))?;
        let tag = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| NodeError::Malformed("mark without a type".into()))?;
        let kind = MarkKind::from_tag(tag).ok_or_else(|| NodeError::UnknownMark(tag.to_string()))?;
        Ok(Self {
            kind,
            attrs: parse_attrs(obj)?,
        })
    }
}

/// Errors raised while parsing or validating a node tree.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    #[error("Unknown node type: {0}")]
    UnknownKind(String),
    #[error("Unknown mark type: {0}")]
    UnknownMark(String),
    #[error("Document root must be 'doc', found '{0}'")]
    InvalidRoot(String),
    #[error("Text node without text")]
    MissingText,
    #[error("'{0}' node cannot carry text")]
    UnexpectedText(&'static str),
    #[error("'{0}' node cannot carry marks")]
    UnexpectedMarks(&'static str),
    #[error("Text node cannot have children")]
    TextWithChildren,
    #[error("Tree nesting exceeds {MAX_DEPTH} levels")]
    TooDeep,
    #[error("Malformed node: {0}")]
    Malformed(String),
}

/// One node of the persisted document tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocNode {
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<DocNode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub marks: Vec<Mark>,
}

impl DocNode {
    pub fn element(kind: NodeKind) -> Self {
        Self {
            kind,
            attrs: BTreeMap::new(),
            content: Vec::new(),
            text: None,
            marks: Vec::new(),
        }
    }

    /// An empty `doc` root.
    pub fn empty_document() -> Self {
        Self::element(NodeKind::Doc)
    }

    pub fn doc(content: Vec<DocNode>) -> Self {
        Self::element(NodeKind::Doc).with_content(content)
    }

    pub fn paragraph(text: impl Into<String>) -> Self {
        Self::element(NodeKind::Paragraph).with_content(vec![Self::text(text)])
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::element(NodeKind::Text)
        }
    }

    pub fn with_content(mut self, content: Vec<DocNode>) -> Self {
        self.content = content;
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attrs.insert(key.into(), value);
        self
    }

    pub fn with_mark(mut self, mark: Mark) -> Self {
        self.marks.push(mark);
        self
    }

    /// Parse a full persisted document.
    ///
    /// Accepts the tree itself, a JSON string holding the tree (legacy rows
    /// stored content as text), or `null` for a document that has never been
    /// written. The result is validated and sanitised.
    pub fn parse_document(value: &Value) -> Result<Self, NodeError> {
        let mut root = match value {
            Value::Null => return Ok(Self::empty_document()),
            Value::String(raw) => {
                let inner: Value = serde_json::from_str(raw)
                    .map_err(|e| NodeError::Malformed(e.to_string()))?;
                Self::parse(&inner, 0)?
            }
            other => Self::parse(other, 0)?,
        };
        if root.kind != NodeKind::Doc {
            return Err(NodeError::InvalidRoot(root.kind.as_str().to_string()));
        }
        root.sanitize();
        Ok(root)
    }

    /// Parse a single node (and its subtree) without sanitising.
    pub fn from_value(value: &Value) -> Result<Self, NodeError> {
        Self::parse(value, 0)
    }

    fn parse(value: &Value, depth: usize) -> Result<Self, NodeError> {
        if depth > MAX_DEPTH {
            return Err(NodeError::TooDeep);
        }
        let obj = value
            .as_object()
            .ok_or_else(|| NodeError::Malformed("node must be an object".into()))?;
        let tag = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| NodeError::Malformed("node without a type".into()))?;
        let kind = NodeKind::from_tag(tag).ok_or_else(|| NodeError::UnknownKind(tag.to_string()))?;

        let content = match obj.get("content") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(children)) => children
                .iter()
                .map(|child| Self::parse(child, depth + 1))
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => return Err(NodeError::Malformed("content must be an array".into())),
        };

        let text = match obj.get("text") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => return Err(NodeError::Malformed("text must be a string".into())),
        };

        let marks = match obj.get("marks") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(marks)) => marks.iter().map(Mark::parse).collect::<Result<Vec<_>, _>>()?,
            Some(_) => return Err(NodeError::Malformed("marks must be an array".into())),
        };

        let node = Self {
            kind,
            attrs: parse_attrs(obj)?,
            content,
            text,
            marks,
        };
        node.check_shape()?;
        Ok(node)
    }

    fn check_shape(&self) -> Result<(), NodeError> {
        if self.kind == NodeKind::Text {
            if self.text.is_none() {
                return Err(NodeError::MissingText);
            }
            if !self.content.is_empty() {
                return Err(NodeError::TextWithChildren);
            }
        } else {
            if self.text.is_some() {
                return Err(NodeError::UnexpectedText(self.kind.as_str()));
            }
            if !self.marks.is_empty() {
                return Err(NodeError::UnexpectedMarks(self.kind.as_str()));
            }
        }
        Ok(())
    }

    /// Validate this subtree against the schema rules.
    pub fn validate(&self) -> Result<(), NodeError> {
        self.validate_at(0)
    }

    fn validate_at(&self, depth: usize) -> Result<(), NodeError> {
        if depth > MAX_DEPTH {
            return Err(NodeError::TooDeep);
        }
        self.check_shape()?;
        self.content
            .iter()
            .try_for_each(|child| child.validate_at(depth + 1))
    }

    /// Drop shapes the editor cannot render: non-cell children of table
    /// rows and empty text runs.
    pub fn sanitize(&mut self) {
        if self.kind == NodeKind::TableRow {
            self.content
                .retain(|cell| matches!(cell.kind, NodeKind::TableCell | NodeKind::TableHeader));
        }
        self.content.retain(|child| {
            child.kind != NodeKind::Text || child.text.as_deref().is_some_and(|t| !t.is_empty())
        });
        for child in &mut self.content {
            child.sanitize();
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Concatenated text of the subtree, for diagnostics and tests.
    pub fn plain_text(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        if let Some(text) = &self.text {
            out.push_str(text);
        }
        for child in &self.content {
            child.collect_text(out);
        }
    }
}

fn parse_attrs(obj: &Map<String, Value>) -> Result<BTreeMap<String, Value>, NodeError> {
    match obj.get("attrs") {
        None | Some(Value::Null) => Ok(BTreeMap::new()),
        Some(Value::Object(attrs)) => Ok(attrs.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        Some(_) => Err(NodeError::Malformed("attrs must be an object".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_tags_roundtrip() {
        for kind in NodeKind::ALL {
            assert_eq!(NodeKind::from_tag(kind.as_str()), Some(kind));
        }
        assert_eq!(NodeKind::from_tag("iframe"), None);
    }

    #[test]
    fn test_serialized_tag_matches_as_str() {
        for kind in NodeKind::ALL {
            assert_eq!(serde_json::to_value(kind).unwrap(), json!(kind.as_str()));
        }
    }

    #[test]
    fn test_parse_heading_with_marks() {
        let value = json!({
            "type": "doc",
            "content": [{
                "type": "heading",
                "attrs": { "level": 2 },
                "content": [{ "type": "text", "text": "Hi", "marks": [{ "type": "bold" }] }]
            }]
        });
        let doc = DocNode::parse_document(&value).unwrap();
        let heading = &doc.content[0];
        assert_eq!(heading.kind, NodeKind::Heading);
        assert_eq!(heading.attrs["level"], json!(2));
        assert_eq!(heading.content[0].marks, vec![Mark::new(MarkKind::Bold)]);
        assert_eq!(doc.to_value(), value);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let value = json!({ "type": "doc", "content": [{ "type": "video" }] });
        assert_eq!(
            DocNode::parse_document(&value),
            Err(NodeError::UnknownKind("video".into()))
        );
    }

    #[test]
    fn test_unknown_mark_rejected() {
        let value = json!({
            "type": "doc",
            "content": [{ "type": "paragraph", "content": [
                { "type": "text", "text": "x", "marks": [{ "type": "blink" }] }
            ]}]
        });
        assert_eq!(
            DocNode::parse_document(&value),
            Err(NodeError::UnknownMark("blink".into()))
        );
    }

    #[test]
    fn test_root_must_be_doc() {
        let value = json!({ "type": "paragraph" });
        assert_eq!(
            DocNode::parse_document(&value),
            Err(NodeError::InvalidRoot("paragraph".into()))
        );
    }

    #[test]
    fn test_text_node_rules() {
        let missing = json!({ "type": "text" });
        assert_eq!(DocNode::from_value(&missing), Err(NodeError::MissingText));

        let para_with_text = json!({ "type": "paragraph", "text": "oops" });
        assert_eq!(
            DocNode::from_value(&para_with_text),
            Err(NodeError::UnexpectedText("paragraph"))
        );

        let para_with_marks = json!({ "type": "paragraph", "marks": [{ "type": "bold" }] });
        assert_eq!(
            DocNode::from_value(&para_with_marks),
            Err(NodeError::UnexpectedMarks("paragraph"))
        );
    }

    #[test]
    fn test_string_content_is_parsed() {
        let raw = json!({ "type": "doc", "content": [{ "type": "paragraph" }] }).to_string();
        let doc = DocNode::parse_document(&Value::String(raw)).unwrap();
        assert_eq!(doc.content.len(), 1);
    }

    #[test]
    fn test_null_is_empty_document() {
        assert_eq!(
            DocNode::parse_document(&Value::Null).unwrap(),
            DocNode::empty_document()
        );
    }

    #[test]
    fn test_sanitize_table_rows_and_empty_text() {
        let value = json!({
            "type": "doc",
            "content": [
                { "type": "table", "content": [{
                    "type": "tableRow",
                    "content": [
                        { "type": "tableCell", "content": [{ "type": "paragraph" }] },
                        { "type": "paragraph" },
                        { "type": "tableHeader" }
                    ]
                }]},
                { "type": "paragraph", "content": [{ "type": "text", "text": "" }] }
            ]
        });
        let doc = DocNode::parse_document(&value).unwrap();
        let row = &doc.content[0].content[0];
        assert_eq!(row.content.len(), 2);
        assert!(row
            .content
            .iter()
            .all(|c| matches!(c.kind, NodeKind::TableCell | NodeKind::TableHeader)));
        assert!(doc.content[1].content.is_empty());
    }

    #[test]
    fn test_depth_limit() {
        let mut value = json!({ "type": "text", "text": "deep" });
        for _ in 0..(MAX_DEPTH + 2) {
            value = json!({ "type": "blockquote", "content": [value] });
        }
        let doc = json!({ "type": "doc", "content": [value] });
        assert_eq!(DocNode::parse_document(&doc), Err(NodeError::TooDeep));
    }

    #[test]
    fn test_plain_text() {
        let doc = DocNode::doc(vec![DocNode::paragraph("Hello, "), DocNode::paragraph("world")]);
        assert_eq!(doc.plain_text(), "Hello, world");
    }
}
