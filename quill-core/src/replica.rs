//! Mergeable replica: the in-memory CRDT state of one document.
//!
//! Wraps a Yrs `Doc`. Update fragments are Yrs v1 updates, so merging is
//! associative, commutative and idempotent: applying the same set of
//! fragments in any order, with any duplication, converges to one state.
//! Fragments that arrive before their causal dependencies are held as
//! pending by Yrs and integrated once the missing pieces land.

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, TransactionMut, Update, WriteTxn, XmlFragmentRef};

/// Name of the shared XML fragment holding the document tree.
pub const DOCUMENT_FRAGMENT: &str = "document";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReplicaError {
    #[error("Malformed update fragment: {0}")]
    MalformedUpdate(String),
    #[error("Malformed state vector: {0}")]
    MalformedStateVector(String),
    #[error("Update could not be integrated: {0}")]
    Rejected(String),
}

/// A document replica.
///
/// Mutation goes through `&mut self`, so the owner decides the serialization
/// discipline (the collab server keeps each replica inside one session task).
pub struct Replica {
    doc: Doc,
}

impl Replica {
    /// An empty replica.
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Build a replica from a full encoded state.
    pub fn from_state(state: &[u8]) -> Result<Self, ReplicaError> {
        let mut replica = Self::new();
        replica.merge(state)?;
        Ok(replica)
    }

    /// Merge one update fragment into the replica.
    pub fn merge(&mut self, fragment: &[u8]) -> Result<(), ReplicaError> {
        self.merge_changed(fragment).map(|_| ())
    }

    /// Merge one update fragment and report whether it changed anything.
    ///
    /// Deletions count even though they leave the state vector alone. While
    /// Yrs holds updates back for missing dependencies every merge counts as
    /// a change.
    pub fn merge_changed(&mut self, fragment: &[u8]) -> Result<bool, ReplicaError> {
        let update =
            Update::decode_v1(fragment).map_err(|e| ReplicaError::MalformedUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        let before = txn.state_vector();
        txn.apply_update(update)
            .map_err(|e| ReplicaError::Rejected(e.to_string()))?;

        let store = txn.store();
        let waiting = store.pending_update().is_some() || store.pending_ds().is_some();
        Ok(waiting || txn.state_vector() != before || !txn.delete_set().is_empty())
    }

    /// Apply a local edit against the document fragment and return the
    /// update fragment it produced.
    pub fn edit<F>(&mut self, f: F) -> Vec<u8>
    where
        F: FnOnce(&mut TransactionMut, &XmlFragmentRef),
    {
        let mut txn = self.doc.transact_mut();
        let root = txn.get_or_insert_xml_fragment(DOCUMENT_FRAGMENT);
        f(&mut txn, &root);
        txn.encode_update_v1()
    }

    /// Encoded state vector (what this replica has seen).
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// The whole state as a single update fragment.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Everything this replica has that a peer with `remote_state_vector`
    /// is missing.
    pub fn diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, ReplicaError> {
        let remote = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| ReplicaError::MalformedStateVector(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&remote))
    }

    /// True when no update has ever been integrated.
    pub fn is_empty(&self) -> bool {
        let txn = self.doc.transact();
        txn.state_vector().is_empty()
    }

    pub(crate) fn doc(&self) -> &Doc {
        &self.doc
    }
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("state_vector_len", &self.state_vector().len())
            .finish()
    }
}
