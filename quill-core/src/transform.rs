//! Conversion between the persisted representation and a replica.
//!
//! The tree lives in the `document` XML fragment of the replica. Each
//! non-text node becomes an XML element named after its type, with every
//! attribute stored as a JSON-encoded string. Text nodes become XML text
//! carrying their marks as a JSON array in the `marks` attribute.
//!
//! Loading is strict: a stored tree that breaks the schema is refused.
//! Reading a replica back is lenient, because peers can write any XML: nodes
//! and marks outside the schema, non-string attributes and subtrees nested
//! deeper than [`MAX_DEPTH`] are dropped, so an edited replica can always be
//! saved.

use serde_json::Value;
use thiserror::Error;
use yrs::{
    Any, GetString, Out, ReadTxn, Transact, TransactionMut, Xml, XmlElementPrelim, XmlElementRef,
    XmlFragment, XmlOut, XmlTextPrelim, XmlTextRef,
};

use crate::node::{DocNode, Mark, NodeError, NodeKind, MAX_DEPTH};
use crate::replica::{Replica, DOCUMENT_FRAGMENT};

/// The persisted form of a document (a `doc`-rooted node tree as JSON).
pub type Representation = Value;

const MARKS_ATTR: &str = "marks";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error(transparent)]
    Node(#[from] NodeError),
}

/// Converts between the persisted representation and a replica.
///
/// Implementations must be pure: `from_replica(to_replica(r))` equals `r`
/// for every valid `r`, after sanitising.
pub trait ReplicaTransform: Send + Sync {
    fn to_replica(&self, representation: &Representation) -> Result<Replica, TransformError>;
    fn from_replica(&self, replica: &Replica) -> Result<Representation, TransformError>;
}

/// The default transform for rich-text trees.
#[derive(Debug, Default, Clone, Copy)]
pub struct XmlTreeTransform;

impl XmlTreeTransform {
    pub fn new() -> Self {
        Self
    }
}

impl ReplicaTransform for XmlTreeTransform {
    fn to_replica(&self, representation: &Representation) -> Result<Replica, TransformError> {
        let root = DocNode::parse_document(representation)?;
        let mut replica = Replica::new();
        if root.content.is_empty() {
            return Ok(replica);
        }
        replica.edit(|txn, fragment| {
            for child in &root.content {
                write_node(txn, fragment, child);
            }
        });
        Ok(replica)
    }

    fn from_replica(&self, replica: &Replica) -> Result<Representation, TransformError> {
        let txn = replica.doc().transact();
        let mut root = DocNode::empty_document();
        if let Some(fragment) = txn.get_xml_fragment(DOCUMENT_FRAGMENT) {
            root.content = fragment
                .children(&txn)
                .filter_map(|child| read_node(&txn, child, 1))
                .collect();
        }
        root.sanitize();
        Ok(root.to_value())
    }
}

fn write_node<F: XmlFragment>(txn: &mut TransactionMut, parent: &F, node: &DocNode) {
    if node.kind == NodeKind::Text {
        let text = parent.push_back(txn, XmlTextPrelim::new(node.text.clone().unwrap_or_default()));
        if !node.marks.is_empty() {
            let marks = serde_json::to_string(&node.marks).unwrap_or_else(|_| "[]".into());
            text.insert_attribute(txn, MARKS_ATTR, marks);
        }
        return;
    }

    let element = parent.push_back(txn, XmlElementPrelim::empty(node.kind.as_str()));
    for (name, value) in &node.attrs {
        element.insert_attribute(txn, name.as_str(), value.to_string());
    }
    for child in &node.content {
        write_node(txn, &element, child);
    }
}

fn read_node<T: ReadTxn>(txn: &T, node: XmlOut, depth: usize) -> Option<DocNode> {
    if depth > MAX_DEPTH {
        log::warn!("Dropping replica content nested deeper than {MAX_DEPTH} levels");
        return None;
    }
    match node {
        XmlOut::Element(element) => read_element(txn, &element, depth),
        XmlOut::Text(text) => Some(read_text(txn, &text)),
        XmlOut::Fragment(_) => {
            log::warn!("Dropping nested XML fragment from replica");
            None
        }
    }
}

fn read_element<T: ReadTxn>(txn: &T, element: &XmlElementRef, depth: usize) -> Option<DocNode> {
    let tag = element.tag().to_string();
    let kind = match NodeKind::from_tag(&tag) {
        Some(kind) if kind != NodeKind::Text => kind,
        _ => {
            log::warn!("Dropping unknown element '{tag}' from replica");
            return None;
        }
    };

    let mut node = DocNode::element(kind);
    for (name, value) in element.attributes(txn) {
        if let Some(value) = decode_attr(value) {
            node.attrs.insert(name.to_string(), value);
        }
    }
    node.content = element
        .children(txn)
        .filter_map(|child| read_node(txn, child, depth + 1))
        .collect();
    Some(node)
}

fn read_text<T: ReadTxn>(txn: &T, text: &XmlTextRef) -> DocNode {
    let mut node = DocNode::text(text.get_string(txn));
    if let Some(Value::Array(marks)) = text.get_attribute(txn, MARKS_ATTR).and_then(decode_attr) {
        node.marks = marks.iter().filter_map(|mark| Mark::from_value(mark).ok()).collect();
    }
    node
}

fn decode_attr(value: Out) -> Option<Value> {
    match value {
        // Attributes written by other editors may be bare strings.
        Out::Any(Any::String(raw)) => {
            Some(serde_json::from_str(&raw).unwrap_or_else(|_| Value::String(raw.to_string())))
        }
        _ => None,
    }
}
