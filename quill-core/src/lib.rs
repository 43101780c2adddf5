//! # quill-core: Document model for Quill collaborative editing
//!
//! Everything here is synchronous and free of I/O:
//!
//! - [`node`]: Persisted document tree (ProseMirror-style JSON) with
//!   schema validation and sanitising
//! - [`replica`]: CRDT replica (Yrs) with merge, state vectors and diffs
//! - [`transform`]: Conversion between the persisted tree and a replica
//!
//! ```text
//! Representation (JSON) ──to_replica──► Replica ◄──merge── update fragments
//!          ▲                               │
//!          └──────────from_replica─────────┘
//! ```

pub mod node;
pub mod replica;
pub mod transform;

pub use node::{DocNode, Mark, MarkKind, NodeError, NodeKind, MAX_DEPTH};
pub use replica::{Replica, ReplicaError, DOCUMENT_FRAGMENT};
pub use transform::{Representation, ReplicaTransform, TransformError, XmlTreeTransform};

// Yrs types needed to write local edits through `Replica::edit`.
pub use yrs;
