//! Engagement engine: votes, collection, likes and redemptions behind one
//! handle.
//!
//! Inventory operations are local-first. They land in the active
//! [`LocalInventoryStore`](crate::local::LocalInventoryStore) immediately and
//! the reconciler carries them to the remote store in the background. Votes
//! go straight to the remote store as transactions.

use crate::config::EngineConfig;
use crate::document::DocumentStore;
use crate::error::{Error, Result};
use crate::kv::KeyValueStore;
use crate::models::{CollectedItem, DropSnapshot, InventoryRecord, LikeStatus, Redemption};
use crate::reconciler::{InventoryReconciler, ReconcilerState, SyncStats};
use crate::remote::RemoteInventoryStore;
use crate::session::SessionLifecycleController;
use crate::storage::RocksKv;
use crate::votes::{VoteOutcome, VoteTransactionRunner};
use cairn_ledger::{Vote, VoteAggregate};
use std::sync::Arc;
use tracing::{debug, info};

/// Engagement engine for one device.
pub struct Engine {
    config: EngineConfig,
    votes: VoteTransactionRunner,
    reconciler: Arc<InventoryReconciler>,
    session: Arc<SessionLifecycleController>,
}

impl Engine {
    /// Create an engine over the given device cache and remote store.
    pub fn new(
        config: EngineConfig,
        kv: Arc<dyn KeyValueStore>,
        documents: Arc<dyn DocumentStore>,
    ) -> Result<Self> {
        let votes = VoteTransactionRunner::new(Arc::clone(&documents), config.drops_collection.clone());
        let remote = RemoteInventoryStore::new(documents, config.inventory_collection.clone());
        let reconciler = Arc::new(InventoryReconciler::new(remote, config.echo_window));
        let session = Arc::new(SessionLifecycleController::new(
            kv,
            Arc::clone(&reconciler),
            config.event_capacity,
        )?);

        Ok(Self {
            config,
            votes,
            reconciler,
            session,
        })
    }

    /// Create an engine with a RocksDB cache in `config.data_dir`.
    pub fn open(config: EngineConfig, documents: Arc<dyn DocumentStore>) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let kv = RocksKv::open(&config.data_dir)?;
        info!("Opened device cache at {}", config.data_dir.display());
        Self::new(config, Arc::new(kv), documents)
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Session controller, for wiring an identity feed.
    pub fn session(&self) -> Arc<SessionLifecycleController> {
        Arc::clone(&self.session)
    }

    /// Move `user_id`'s vote on `item_id` to `desired`.
    pub async fn vote(&self, item_id: &str, user_id: &str, desired: Vote) -> Result<VoteOutcome> {
        self.votes.vote(item_id, user_id, desired).await
    }

    /// Vote as the signed-in user.
    pub async fn vote_as_active(&self, item_id: &str, desired: Vote) -> Result<VoteOutcome> {
        let user_id = self.session.active_user().ok_or(Error::NotSignedIn)?;
        self.votes.vote(item_id, &user_id, desired).await
    }

    /// Current aggregate of a drop.
    pub async fn aggregate(&self, item_id: &str) -> Result<VoteAggregate> {
        self.votes.fetch_aggregate(item_id).await
    }

    /// Collect a drop and take it out of the ignored set.
    ///
    /// Collecting it again returns the existing entry untouched.
    pub fn collect(&self, item_id: &str, snapshot: DropSnapshot) -> Result<CollectedItem> {
        let store = self.session.active_store();
        let current = store.snapshot();
        if let Some(existing) = current.get(item_id) {
            debug!("Drop {} already collected", item_id);
            if current.is_ignored(item_id) {
                store.set_ignored(item_id, false)?;
            }
            return Ok(existing.clone());
        }

        let item = CollectedItem::new(item_id, snapshot, crate::now_millis());
        store.upsert_collected(item.clone())?;
        info!("Collected drop {}", item_id);
        Ok(item)
    }

    /// Hide a drop from the map.
    pub fn ignore(&self, item_id: &str) -> Result<()> {
        self.session.active_store().set_ignored(item_id, true)
    }

    /// Show an ignored drop again.
    pub fn unignore(&self, item_id: &str) -> Result<()> {
        self.session.active_store().set_ignored(item_id, false)
    }

    /// Remove a drop from the inventory.
    pub fn discard(&self, item_id: &str) -> Result<CollectedItem> {
        let removed = self.session.active_store().remove_collected(item_id)?;
        info!("Discarded drop {}", item_id);
        Ok(removed)
    }

    /// Set like/dislike on a collected drop.
    pub fn set_like(&self, item_id: &str, status: LikeStatus) -> Result<()> {
        self.session.active_store().set_like_status(item_id, status)
    }

    /// Press like or dislike: pressing the active one clears it.
    pub fn toggle_like(&self, item_id: &str, pressed: LikeStatus) -> Result<LikeStatus> {
        self.session.active_store().modify_item(item_id, |item| {
            item.like_status = item.like_status.toggled(pressed);
            Ok(item.like_status)
        })
    }

    /// Redeem a collected drop, optionally recording the code used.
    ///
    /// `limit` sets the redemption limit if the drop has none yet.
    pub fn redeem(&self, item_id: &str, code: Option<&str>, limit: Option<u32>) -> Result<Redemption> {
        let redemption = self.session.active_store().modify_item(item_id, |item| {
            let redemption = &mut item.redemption;
            if redemption.limit.is_none() {
                redemption.limit = limit;
            }
            if let Some(limit) = redemption.limit.filter(|_| redemption.is_exhausted()) {
                return Err(Error::RedemptionLimitReached {
                    item_id: item_id.to_string(),
                    count: redemption.count,
                    limit,
                });
            }

            redemption.count = redemption.count.saturating_add(1);
            redemption.redeemed_at = Some(crate::now_millis());
            redemption.is_redeemed = true;
            if let Some(code) = code {
                redemption.last_code = Some(code.to_string());
            }
            item.pending = false;
            Ok(item.redemption.clone())
        })?;

        info!(
            "Redeemed drop {} ({}{})",
            item_id,
            redemption.count,
            redemption
                .limit
                .map(|limit| format!("/{}", limit))
                .unwrap_or_default()
        );
        Ok(redemption)
    }

    /// Mark a collected drop as opened.
    pub fn mark_opened(&self, item_id: &str) -> Result<()> {
        self.session.active_store().modify_item(item_id, |item| {
            item.pending = false;
            Ok(())
        })
    }

    /// Inventory of the active user (or the anonymous one).
    pub fn current_inventory(&self) -> InventoryRecord {
        self.session.active_store().snapshot()
    }

    /// Follow an identity change.
    pub async fn on_identity_changed(&self, user_id: Option<&str>) -> Result<()> {
        self.session.on_identity_changed(user_id).await
    }

    /// Signed-in user, if any.
    pub fn active_user(&self) -> Option<String> {
        self.session.active_user()
    }

    /// Reconciler state.
    pub fn reconciler_state(&self) -> ReconcilerState {
        self.reconciler.state()
    }

    /// Reconciler handle, for waiting on state or reading stats.
    pub fn reconciler(&self) -> &InventoryReconciler {
        &self.reconciler
    }

    /// Reconciler counters.
    pub fn sync_stats(&self) -> SyncStats {
        self.reconciler.stats()
    }

    /// Stop background sync.
    pub async fn shutdown(&self) {
        self.reconciler.stop().await;
    }
}
