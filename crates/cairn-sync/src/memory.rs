//! In-process document store.
//!
//! Versioned documents behind a mutex with optimistic transactions: the
//! transaction body runs against a snapshot, and the commit only lands if the
//! document version is still the one that was read. Used by the `cairn-node`
//! binary and by tests, and as the reference behavior for real backends.

use crate::document::{DocRef, Document, DocumentFeed, DocumentStore, Fields, TxUpdate};
use crate::error::{Error, Result};
use async_trait::async_trait;
use cairn_ledger::{check_vote_write, VoteAggregate};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_FEED_CAPACITY: usize = 64;

#[derive(Debug)]
struct Entry {
    fields: Fields,
    version: u64,
}

#[derive(Debug, Default)]
struct Inner {
    docs: HashMap<DocRef, Entry>,
    feeds: HashMap<DocRef, broadcast::Sender<Document>>,
    writes: HashMap<DocRef, u64>,
}

enum CommitError {
    Conflict,
    Rejected(Error),
}

/// In-memory [`DocumentStore`].
#[derive(Debug)]
pub struct MemoryDocumentStore {
    inner: Mutex<Inner>,
    max_attempts: u32,
    feed_capacity: usize,
    vote_rules_collection: Option<String>,
    offline: AtomicBool,
    injected_conflicts: AtomicU32,
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocumentStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            feed_capacity: DEFAULT_FEED_CAPACITY,
            vote_rules_collection: None,
            offline: AtomicBool::new(false),
            injected_conflicts: AtomicU32::new(0),
        }
    }

    /// Builder: set the transaction attempt bound.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Builder: set the per-document feed capacity.
    pub fn with_feed_capacity(mut self, capacity: usize) -> Self {
        self.feed_capacity = capacity.max(1);
        self
    }

    /// Builder: enforce aggregate write rules on writes to `collection`.
    pub fn with_vote_rules(mut self, collection: impl Into<String>) -> Self {
        self.vote_rules_collection = Some(collection.into());
        self
    }

    /// Simulate losing (or regaining) connectivity.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make the next `count` transaction commits fail as if another writer
    /// got in first.
    pub fn inject_conflicts(&self, count: u32) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    /// Write a document directly, bypassing rules. Administrative path.
    pub fn seed(&self, doc: &DocRef, fields: Fields) -> Document {
        let mut inner = self.lock();
        Self::commit_locked(&mut inner, doc, fields)
    }

    /// Current state of a document.
    pub fn document(&self, doc: &DocRef) -> Option<Document> {
        let inner = self.lock();
        Self::read_locked(&inner, doc)
    }

    /// Number of committed writes to a document.
    pub fn write_count(&self, doc: &DocRef) -> u64 {
        self.lock().writes.get(doc).copied().unwrap_or(0)
    }

    /// Close every open listener, as a dropped backend connection would.
    ///
    /// Later `listen` calls open fresh feeds.
    pub fn close_feeds(&self) {
        let closed = std::mem::take(&mut self.lock().feeds);
        debug!("Closed {} document feeds", closed.len());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves plain data behind; keep serving it
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_online(&self, doc: &DocRef) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(Error::RemoteUnreachable(format!("{} (store offline)", doc)))
        } else {
            Ok(())
        }
    }

    fn read_locked(inner: &Inner, doc: &DocRef) -> Option<Document> {
        inner.docs.get(doc).map(|entry| Document {
            reference: doc.clone(),
            fields: entry.fields.clone(),
            version: entry.version,
        })
    }

    fn commit_locked(inner: &mut Inner, doc: &DocRef, fields: Fields) -> Document {
        let version = inner.docs.get(doc).map(|e| e.version).unwrap_or(0) + 1;
        inner.docs.insert(
            doc.clone(),
            Entry {
                fields: fields.clone(),
                version,
            },
        );
        *inner.writes.entry(doc.clone()).or_insert(0) += 1;

        let committed = Document {
            reference: doc.clone(),
            fields,
            version,
        };
        if let Some(tx) = inner.feeds.get(doc) {
            // No live subscribers is fine
            let _ = tx.send(committed.clone());
        }
        committed
    }

    fn check_rules(&self, doc: &DocRef, before: Option<&Fields>, after: &Fields) -> Result<()> {
        if self.vote_rules_collection.as_deref() != Some(doc.collection.as_str()) {
            return Ok(());
        }

        let empty = Fields::new();
        let before = VoteAggregate::from_fields(before.unwrap_or(&empty));
        let after = VoteAggregate::from_fields(after);

        let writer = changed_voters(&before, &after)
            .into_iter()
            .next()
            .unwrap_or_default();
        check_vote_write(&before, &after, &writer)?;
        Ok(())
    }

    fn try_commit(
        &self,
        doc: &DocRef,
        read_version: u64,
        fields: Fields,
    ) -> std::result::Result<Document, CommitError> {
        let mut inner = self.lock();
        let current = inner.docs.get(doc).map(|e| e.version).unwrap_or(0);

        let injected = self
            .injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected || current != read_version {
            return Err(CommitError::Conflict);
        }

        let before = inner.docs.get(doc).map(|e| &e.fields);
        self.check_rules(doc, before, &fields)
            .map_err(CommitError::Rejected)?;

        Ok(Self::commit_locked(&mut inner, doc, fields))
    }
}

/// User ids whose vote entries differ between two aggregates.
///
/// With more than one id the rule check reports the write as touching a
/// foreign entry, whichever id is taken as the writer.
fn changed_voters(before: &VoteAggregate, after: &VoteAggregate) -> Vec<String> {
    let mut changed: Vec<String> = before
        .votes_by_user
        .keys()
        .chain(after.votes_by_user.keys())
        .filter(|user| before.votes_by_user.get(*user) != after.votes_by_user.get(*user))
        .cloned()
        .collect();
    changed.sort();
    changed.dedup();
    changed
}

fn backoff(attempt: u32) -> Duration {
    let base = 1u64 << attempt.min(6);
    let jitter = rand::thread_rng().gen_range(0..=base);
    Duration::from_millis(base + jitter)
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, doc: &DocRef) -> Result<Option<Document>> {
        self.ensure_online(doc)?;
        Ok(self.document(doc))
    }

    async fn set(&self, doc: &DocRef, fields: Fields, merge: bool) -> Result<()> {
        self.ensure_online(doc)?;
        let mut inner = self.lock();

        let before = inner.docs.get(doc).map(|e| e.fields.clone());
        let after = match (&before, merge) {
            (Some(existing), true) => {
                let mut merged = existing.clone();
                merged.extend(fields);
                merged
            }
            _ => fields,
        };

        self.check_rules(doc, before.as_ref(), &after)?;
        Self::commit_locked(&mut inner, doc, after);
        Ok(())
    }

    async fn run_transaction(&self, doc: &DocRef, update: &mut TxUpdate<'_>) -> Result<Document> {
        for attempt in 1..=self.max_attempts {
            self.ensure_online(doc)?;

            let snapshot = self.document(doc);
            let read_version = snapshot.as_ref().map(|d| d.version).unwrap_or(0);
            let fields = update(snapshot.as_ref())?;

            // Give concurrent transactions a chance to interleave
            tokio::task::yield_now().await;

            match self.try_commit(doc, read_version, fields) {
                Ok(committed) => return Ok(committed),
                Err(CommitError::Rejected(e)) => return Err(e),
                Err(CommitError::Conflict) => {
                    debug!("Transaction on {} conflicted (attempt {})", doc, attempt);
                    if attempt < self.max_attempts {
                        tokio::time::sleep(backoff(attempt)).await;
                    }
                }
            }
        }

        Err(Error::TransactionConflict {
            attempts: self.max_attempts,
        })
    }

    async fn listen(&self, doc: &DocRef) -> Result<DocumentFeed> {
        self.ensure_online(doc)?;
        let mut inner = self.lock();
        let capacity = self.feed_capacity;
        let tx = inner
            .feeds
            .entry(doc.clone())
            .or_insert_with(|| broadcast::channel(capacity).0);
        Ok(DocumentFeed::new(doc.clone(), tx.subscribe()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::FeedEvent;
    use serde_json::json;
    use std::sync::Arc;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn set_and_merge() {
        let store = MemoryDocumentStore::new();
        let doc = DocRef::new("notes", "a");

        store.set(&doc, fields(json!({ "x": 1, "y": 2 })), false).await.unwrap();
        store.set(&doc, fields(json!({ "y": 3 })), true).await.unwrap();
        let read = store.get(&doc).await.unwrap().unwrap();
        assert_eq!(read.fields, fields(json!({ "x": 1, "y": 3 })));
        assert_eq!(read.version, 2);

        store.set(&doc, fields(json!({ "z": 0 })), false).await.unwrap();
        let read = store.get(&doc).await.unwrap().unwrap();
        assert_eq!(read.fields, fields(json!({ "z": 0 })));
    }

    #[tokio::test]
    async fn missing_document_reads_none() {
        let store = MemoryDocumentStore::new();
        assert!(store.get(&DocRef::new("notes", "nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn offline_store_is_unreachable() {
        let store = MemoryDocumentStore::new();
        store.set_offline(true);
        let err = store.get(&DocRef::new("notes", "a")).await.unwrap_err();
        assert!(matches!(err, Error::RemoteUnreachable(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryDocumentStore::new().with_max_attempts(50));
        let doc = DocRef::new("counters", "c");
        store.seed(&doc, fields(json!({ "n": 0 })));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let doc = doc.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .run_transaction(&doc, &mut |current: Option<&Document>| {
                        let n = current
                            .and_then(|d| d.fields.get("n"))
                            .and_then(|v| v.as_u64())
                            .unwrap_or(0);
                        Ok(fields(json!({ "n": n + 1 })))
                    })
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let read = store.document(&doc).unwrap();
        assert_eq!(read.fields["n"], json!(8));
    }

    #[tokio::test]
    async fn conflicts_exhaust_attempts() {
        let store = MemoryDocumentStore::new().with_max_attempts(3);
        let doc = DocRef::new("counters", "c");
        store.inject_conflicts(3);

        let mut runs = 0;
        let err = store
            .run_transaction(&doc, &mut |_: Option<&Document>| {
                runs += 1;
                Ok(Fields::new())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::TransactionConflict { attempts: 3 }));
        assert_eq!(runs, 3);
        assert!(store.document(&doc).is_none());
    }

    #[tokio::test]
    async fn listeners_see_commits() {
        let store = MemoryDocumentStore::new();
        let doc = DocRef::new("notes", "a");
        let mut feed = store.listen(&doc).await.unwrap();

        store.set(&doc, fields(json!({ "x": 1 })), false).await.unwrap();
        match feed.next().await {
            FeedEvent::Changed(d) => assert_eq!(d.fields["x"], json!(1)),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn closing_feeds_ends_listeners() {
        let store = MemoryDocumentStore::new();
        let doc = DocRef::new("notes", "a");
        let mut feed = store.listen(&doc).await.unwrap();

        store.close_feeds();
        assert!(matches!(feed.next().await, FeedEvent::Closed));

        let mut reopened = store.listen(&doc).await.unwrap();
        store.set(&doc, fields(json!({ "x": 2 })), false).await.unwrap();
        assert!(matches!(reopened.next().await, FeedEvent::Changed(_)));
    }

    #[tokio::test]
    async fn vote_rules_reject_one_sided_flip() {
        let store = MemoryDocumentStore::new().with_vote_rules("drops");
        let doc = DocRef::new("drops", "d1");
        store.seed(
            &doc,
            fields(json!({ "upvoteCount": 1, "downvoteCount": 0, "votesByUser": { "u": "up" } })),
        );

        let err = store
            .run_transaction(&doc, &mut |_: Option<&Document>| {
                Ok(fields(json!({
                    "upvoteCount": 1,
                    "downvoteCount": 1,
                    "votesByUser": { "u": "down" },
                })))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Rule(_)));
        assert!(!err.is_transient());
    }
}
