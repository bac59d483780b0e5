//! Per-user inventory documents in the remote ledger.

use crate::document::{DocRef, DocumentFeed, DocumentStore, FeedEvent};
use crate::error::Result;
use crate::models::InventoryRecord;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

/// Server timestamp field written on every push.
pub const UPDATED_AT_FIELD: &str = "updatedAt";

/// Remote view of user inventories, one document per user.
#[derive(Clone)]
pub struct RemoteInventoryStore {
    documents: Arc<dyn DocumentStore>,
    collection: String,
}

impl RemoteInventoryStore {
    /// Inventories stored in `collection`.
    pub fn new(documents: Arc<dyn DocumentStore>, collection: impl Into<String>) -> Self {
        Self {
            documents,
            collection: collection.into(),
        }
    }

    /// Document holding a user's inventory.
    pub fn doc_ref(&self, user_id: &str) -> DocRef {
        DocRef::new(self.collection.clone(), user_id)
    }

    /// Read a user's inventory. `Ok(None)` means no document exists.
    pub async fn fetch(&self, user_id: &str) -> Result<Option<InventoryRecord>> {
        match self.documents.get(&self.doc_ref(user_id)).await? {
            Some(doc) => Ok(Some(InventoryRecord::from_fields(&doc.fields)?)),
            None => Ok(None),
        }
    }

    /// Write a user's inventory, leaving unrelated document fields alone.
    pub async fn push(&self, user_id: &str, record: &InventoryRecord) -> Result<()> {
        let mut fields = record.to_fields()?;
        fields.insert(UPDATED_AT_FIELD.to_string(), Value::from(crate::now_millis()));
        self.documents.set(&self.doc_ref(user_id), fields, true).await
    }

    /// Follow a user's inventory document.
    pub async fn watch(&self, user_id: &str) -> Result<InventoryFeed> {
        let feed = self.documents.listen(&self.doc_ref(user_id)).await?;
        Ok(InventoryFeed { feed })
    }
}

/// Event delivered by an [`InventoryFeed`].
#[derive(Debug, Clone, PartialEq)]
pub enum InventoryEvent {
    /// New remote snapshot
    Changed(InventoryRecord),
    /// Snapshots were missed; refetch to catch up
    Lagged(u64),
    /// Feed shut down
    Closed,
}

/// Decoded change feed of one user's inventory.
#[derive(Debug)]
pub struct InventoryFeed {
    feed: DocumentFeed,
}

impl InventoryFeed {
    /// Wait for the next decodable event.
    pub async fn next(&mut self) -> InventoryEvent {
        loop {
            match self.feed.next().await {
                FeedEvent::Changed(doc) => match InventoryRecord::from_fields(&doc.fields) {
                    Ok(record) => return InventoryEvent::Changed(record),
                    Err(e) => {
                        warn!("Skipping undecodable inventory {}: {}", doc.reference, e);
                    }
                },
                FeedEvent::Lagged(missed) => return InventoryEvent::Lagged(missed),
                FeedEvent::Closed => return InventoryEvent::Closed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Fields;
    use crate::memory::MemoryDocumentStore;
    use crate::models::{CollectedItem, DropSnapshot};
    use serde_json::json;

    fn setup() -> (Arc<MemoryDocumentStore>, RemoteInventoryStore) {
        let documents = Arc::new(MemoryDocumentStore::new());
        let remote = RemoteInventoryStore::new(documents.clone(), "inventories");
        (documents, remote)
    }

    fn record() -> InventoryRecord {
        let mut record = InventoryRecord::default();
        record.upsert(CollectedItem::new("d1", DropSnapshot::text("hi"), 10));
        record
    }

    #[tokio::test]
    async fn missing_document_is_none() {
        let (_, remote) = setup();
        assert!(remote.fetch("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn document_without_inventory_fields_is_empty() {
        let (documents, remote) = setup();
        let mut fields = Fields::new();
        fields.insert("displayName".into(), json!("Ana"));
        documents.seed(&remote.doc_ref("u1"), fields);

        let fetched = remote.fetch("u1").await.unwrap().unwrap();
        assert!(fetched.is_empty());
    }

    #[tokio::test]
    async fn push_merges_and_stamps() {
        let (documents, remote) = setup();
        let mut fields = Fields::new();
        fields.insert("displayName".into(), json!("Ana"));
        documents.seed(&remote.doc_ref("u1"), fields);

        remote.push("u1", &record()).await.unwrap();

        let doc = documents.document(&remote.doc_ref("u1")).unwrap();
        assert_eq!(doc.fields["displayName"], json!("Ana"));
        assert!(doc.fields[UPDATED_AT_FIELD].is_u64());
        assert_eq!(remote.fetch("u1").await.unwrap().unwrap(), record());
    }

    #[tokio::test]
    async fn watch_skips_undecodable_documents() {
        let (documents, remote) = setup();
        let mut feed = remote.watch("u1").await.unwrap();

        let mut broken = Fields::new();
        broken.insert("collectedItems".into(), json!("not a list"));
        documents.seed(&remote.doc_ref("u1"), broken);
        remote.push("u1", &record()).await.unwrap();

        assert_eq!(feed.next().await, InventoryEvent::Changed(record()));
    }
}
