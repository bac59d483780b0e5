//! Remote document store contract.
//!
//! The remote ledger is treated as an abstract transactional document store:
//! documents addressed by `collection/id`, holding a JSON object, with
//! optimistic transactions and per-document change feeds. The wire encoding
//! of any concrete backend stays behind this trait.

use crate::error::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::broadcast;

/// Field map of a stored document.
pub type Fields = Map<String, Value>;

/// Transaction body: receives the current document (if any) and returns the
/// complete replacement field set, or an error to abort.
///
/// May run several times when the store detects a conflicting write, so it
/// must not have side effects beyond its return value and captured state it
/// overwrites on every run.
pub type TxUpdate<'a> = dyn FnMut(Option<&Document>) -> Result<Fields> + Send + 'a;

/// Address of a document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocRef {
    /// Collection name
    pub collection: String,
    /// Document id within the collection
    pub id: String,
}

impl DocRef {
    /// Create a document reference.
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl std::fmt::Display for DocRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// A document as read from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Where the document lives
    pub reference: DocRef,
    /// Stored fields
    pub fields: Fields,
    /// Store-assigned version, bumped on every committed write
    pub version: u64,
}

impl Document {
    /// Boolean field lookup, `false` when missing or not a bool.
    pub fn flag(&self, name: &str) -> bool {
        self.fields.get(name).and_then(Value::as_bool).unwrap_or(false)
    }
}

/// Abstract transactional document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read a document. `Ok(None)` means it definitively does not exist.
    async fn get(&self, doc: &DocRef) -> Result<Option<Document>>;

    /// Write a document. With `merge`, only the given top-level fields are
    /// replaced; otherwise the document is overwritten.
    async fn set(&self, doc: &DocRef, fields: Fields, merge: bool) -> Result<()>;

    /// Atomic read-modify-write of one document.
    ///
    /// The store retries `update` on conflicting concurrent writes up to its
    /// built-in bound, then fails with `TransactionConflict`.
    async fn run_transaction(&self, doc: &DocRef, update: &mut TxUpdate<'_>) -> Result<Document>;

    /// Subscribe to committed changes of a document until the feed is dropped.
    async fn listen(&self, doc: &DocRef) -> Result<DocumentFeed>;
}

/// Event delivered by a [`DocumentFeed`].
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// A new committed version of the document
    Changed(Document),
    /// The subscriber fell behind and missed this many versions
    Lagged(u64),
    /// The store shut the feed down
    Closed,
}

/// Change feed for one document. Dropping it unsubscribes.
#[derive(Debug)]
pub struct DocumentFeed {
    reference: DocRef,
    rx: broadcast::Receiver<Document>,
}

impl DocumentFeed {
    /// Wrap a broadcast receiver of committed documents.
    pub fn new(reference: DocRef, rx: broadcast::Receiver<Document>) -> Self {
        Self { reference, rx }
    }

    /// The document this feed follows.
    pub fn reference(&self) -> &DocRef {
        &self.reference
    }

    /// Wait for the next event.
    pub async fn next(&mut self) -> FeedEvent {
        match self.rx.recv().await {
            Ok(doc) => FeedEvent::Changed(doc),
            Err(broadcast::error::RecvError::Lagged(missed)) => FeedEvent::Lagged(missed),
            Err(broadcast::error::RecvError::Closed) => FeedEvent::Closed,
        }
    }
}
