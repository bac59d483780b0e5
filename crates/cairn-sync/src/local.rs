//! On-device inventory cache with origin-tagged change events.
//!
//! Every mutation persists the full record and then broadcasts an
//! [`InventoryChange`]. The origin tag tells listeners whether application
//! code caused the change ([`ChangeOrigin::Local`]) or the reconciler applied
//! a remote snapshot ([`ChangeOrigin::Remote`]). The reconciler only pushes
//! local-origin changes upstream, which is what keeps the two stores from
//! echoing each other forever.

use crate::error::{Error, Result};
use crate::kv::{inventory_key, KeyValueStore};
use crate::models::{CollectedItem, InventoryRecord, LikeStatus, Redemption};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::debug;

/// What caused a change to the local inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Direct call from application logic
    Local,
    /// Reconciler applying a remote snapshot
    Remote,
}

impl std::fmt::Display for ChangeOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// Notification emitted after each persisted mutation.
#[derive(Debug, Clone)]
pub struct InventoryChange {
    /// Cause of the change
    pub origin: ChangeOrigin,
    /// Record after the change
    pub record: InventoryRecord,
    /// Per-store mutation counter, starting at 1
    pub sequence: u64,
}

#[derive(Debug, Default)]
struct State {
    record: InventoryRecord,
    sequence: u64,
}

/// Persistent cache of one user's inventory.
pub struct LocalInventoryStore {
    namespace: String,
    kv: Arc<dyn KeyValueStore>,
    state: Mutex<State>,
    events: broadcast::Sender<InventoryChange>,
}

impl LocalInventoryStore {
    /// Open the inventory persisted under `namespace`, or start empty.
    pub fn open(kv: Arc<dyn KeyValueStore>, namespace: &str, capacity: usize) -> Result<Self> {
        let record = match kv.get(&inventory_key(namespace))? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => InventoryRecord::default(),
        };
        let (events, _) = broadcast::channel(capacity.max(1));

        debug!(
            "Opened local inventory {} ({} collected, {} ignored)",
            namespace,
            record.collected_items.len(),
            record.ignored_item_ids.len()
        );

        Ok(Self {
            namespace: namespace.to_string(),
            kv,
            state: Mutex::new(State {
                record,
                sequence: 0,
            }),
            events,
        })
    }

    /// Namespace (user id) this store persists under.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Current record.
    pub fn snapshot(&self) -> InventoryRecord {
        self.lock().record.clone()
    }

    /// Number of mutations applied since the store was opened.
    pub fn sequence(&self) -> u64 {
        self.lock().sequence
    }

    /// Subscribe to change events.
    pub fn subscribe(&self) -> broadcast::Receiver<InventoryChange> {
        self.events.subscribe()
    }

    /// Insert a collected drop at the head, or replace it in place.
    pub fn upsert_collected(&self, item: CollectedItem) -> Result<()> {
        self.mutate(ChangeOrigin::Local, |record| {
            record.upsert(item);
            Ok(())
        })
    }

    /// Discard a collected drop.
    pub fn remove_collected(&self, item_id: &str) -> Result<CollectedItem> {
        self.mutate(ChangeOrigin::Local, |record| {
            record
                .remove(item_id)
                .ok_or_else(|| Error::NotFound(format!("collected item {}", item_id)))
        })
    }

    /// Add or remove a drop from the ignored set.
    pub fn set_ignored(&self, item_id: &str, ignored: bool) -> Result<()> {
        self.mutate(ChangeOrigin::Local, |record| {
            record.set_ignored(item_id, ignored);
            Ok(())
        })
    }

    /// Overwrite the redemption state of a collected drop.
    pub fn update_redemption(
        &self,
        item_id: &str,
        count: u32,
        redeemed_at: Option<u64>,
        is_redeemed: bool,
    ) -> Result<Redemption> {
        self.modify_item(item_id, |item| {
            item.redemption.count = count;
            item.redemption.redeemed_at = redeemed_at;
            item.redemption.is_redeemed = is_redeemed;
            Ok(item.redemption.clone())
        })
    }

    /// Remember the code used for the latest redemption.
    pub fn record_redemption_code(&self, item_id: &str, code: &str) -> Result<()> {
        self.modify_item(item_id, |item| {
            item.redemption.last_code = Some(code.to_string());
            Ok(())
        })
    }

    /// Set like/dislike on a collected drop.
    pub fn set_like_status(&self, item_id: &str, status: LikeStatus) -> Result<()> {
        self.modify_item(item_id, |item| {
            item.like_status = status;
            Ok(())
        })
    }

    /// Apply `f` to one collected drop as a single local mutation.
    ///
    /// If `f` fails nothing is persisted and no event is emitted.
    pub fn modify_item<T>(
        &self,
        item_id: &str,
        f: impl FnOnce(&mut CollectedItem) -> Result<T>,
    ) -> Result<T> {
        self.mutate(ChangeOrigin::Local, |record| {
            let item = record
                .get_mut(item_id)
                .ok_or_else(|| Error::NotFound(format!("collected item {}", item_id)))?;
            f(item)
        })
    }

    /// Fold an anonymous record into this one, keeping existing entries.
    pub fn adopt(&self, other: InventoryRecord) -> Result<()> {
        self.mutate(ChangeOrigin::Local, |record| {
            record.merge_missing(other);
            Ok(())
        })
    }

    /// Drop everything stored under this namespace.
    pub fn clear(&self) -> Result<()> {
        self.mutate(ChangeOrigin::Local, |record| {
            *record = InventoryRecord::default();
            Ok(())
        })
    }

    /// Replace the record with a remote snapshot.
    ///
    /// Returns false, without persisting or emitting, when the snapshot equals
    /// the current record.
    pub fn apply_remote(&self, remote: InventoryRecord) -> Result<bool> {
        if self.lock().record == remote {
            return Ok(false);
        }
        self.mutate(ChangeOrigin::Remote, |record| {
            *record = remote;
            Ok(())
        })?;
        Ok(true)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn mutate<T>(
        &self,
        origin: ChangeOrigin,
        f: impl FnOnce(&mut InventoryRecord) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.lock();

        let mut next = state.record.clone();
        let out = f(&mut next)?;

        let key = inventory_key(&self.namespace);
        if next.is_empty() {
            self.kv.delete(&key)?;
        } else {
            self.kv.set(&key, &serde_json::to_vec(&next)?)?;
        }

        state.record = next;
        state.sequence += 1;

        // Sent under the lock so events arrive in mutation order
        let _ = self.events.send(InventoryChange {
            origin,
            record: state.record.clone(),
            sequence: state.sequence,
        });

        Ok(out)
    }
}
