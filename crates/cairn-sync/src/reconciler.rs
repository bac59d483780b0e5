//! Two-way sync between the device inventory and the remote inventory.
//!
//! One worker task per signed-in session owns every merge decision:
//!
//! ```text
//!   Idle ──start──▶ Initializing ──▶ (Migrating) ──▶ Syncing
//!    ▲                                                  │
//!    └──────────────────────── stop ◀───────────────────┘
//! ```
//!
//! While syncing, remote snapshots replace the local record (tagged REMOTE)
//! and local-origin changes push the current local record upstream.
//! REMOTE-tagged local changes are never pushed back.
//!
//! If the first remote read fails, local changes keep retrying it. A retry
//! that succeeds folds the local-only entries into the remote record instead
//! of dropping them.

use crate::error::Error;
use crate::local::{ChangeOrigin, InventoryChange, LocalInventoryStore};
use crate::models::InventoryRecord;
use crate::remote::{InventoryEvent, InventoryFeed, RemoteInventoryStore};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle state of the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilerState {
    /// No session
    Idle,
    /// Reading both sides for the first merge
    Initializing,
    /// Uploading a local inventory the remote has never seen
    Migrating,
    /// Following changes on both sides
    Syncing,
}

impl std::fmt::Display for ReconcilerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Initializing => write!(f, "initializing"),
            Self::Migrating => write!(f, "migrating"),
            Self::Syncing => write!(f, "syncing"),
        }
    }
}

/// Counters over the lifetime of a reconciler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Local records written to the remote store
    pub pushes: u64,
    /// Remote snapshots that changed the local record
    pub pulls_applied: u64,
    /// Remote snapshots recognized as echoes of our own pushes
    pub echoes_skipped: u64,
    /// Failed fetches, pushes and local writes
    pub failures: u64,
}

struct Session {
    user_id: String,
    handle: JoinHandle<()>,
}

/// Session-scoped inventory reconciler.
pub struct InventoryReconciler {
    remote: RemoteInventoryStore,
    echo_window: usize,
    state: Arc<watch::Sender<ReconcilerState>>,
    established: Arc<watch::Sender<bool>>,
    stats: Arc<Mutex<SyncStats>>,
    session: tokio::sync::Mutex<Option<Session>>,
}

impl InventoryReconciler {
    /// Create an idle reconciler that remembers up to `echo_window` pushes.
    pub fn new(remote: RemoteInventoryStore, echo_window: usize) -> Self {
        let (state, _) = watch::channel(ReconcilerState::Idle);
        let (established, _) = watch::channel(false);
        Self {
            remote,
            echo_window,
            state: Arc::new(state),
            established: Arc::new(established),
            stats: Arc::new(Mutex::new(SyncStats::default())),
            session: tokio::sync::Mutex::new(None),
        }
    }

    /// Start syncing `user_id`'s inventory, stopping any previous session.
    pub async fn start(&self, user_id: &str, local: Arc<LocalInventoryStore>) {
        let mut session = self.session.lock().await;
        if let Some(previous) = session.take() {
            shutdown(previous).await;
        }

        // Subscribe before the first read so no local change falls between
        let local_rx = local.subscribe();
        self.state.send_replace(ReconcilerState::Initializing);
        self.established.send_replace(false);
        info!("Starting inventory sync for {}", user_id);

        let worker = Worker {
            user_id: user_id.to_string(),
            local,
            remote: self.remote.clone(),
            state: Arc::clone(&self.state),
            stats: Arc::clone(&self.stats),
            established: Arc::clone(&self.established),
            pushed: VecDeque::new(),
            echo_window: self.echo_window,
            last_remote: None,
        };

        *session = Some(Session {
            user_id: user_id.to_string(),
            handle: tokio::spawn(worker.run(local_rx)),
        });
    }

    /// Stop the current session and wait for its worker to finish.
    ///
    /// Idempotent. Once this returns, nothing from the old session touches
    /// either store.
    pub async fn stop(&self) {
        let mut session = self.session.lock().await;
        if let Some(previous) = session.take() {
            shutdown(previous).await;
        }
        self.state.send_replace(ReconcilerState::Idle);
        self.established.send_replace(false);
    }

    /// User whose session is running.
    pub async fn user(&self) -> Option<String> {
        self.session.lock().await.as_ref().map(|s| s.user_id.clone())
    }

    /// Current state.
    pub fn state(&self) -> ReconcilerState {
        *self.state.borrow()
    }

    /// Follow state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ReconcilerState> {
        self.state.subscribe()
    }

    /// Wait until the reconciler reaches `target`. Returns false on timeout.
    pub async fn wait_for(&self, target: ReconcilerState, timeout: Duration) -> bool {
        let mut rx = self.subscribe_state();
        let reached = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|state| *state == target)).await,
            Ok(Ok(_))
        );
        reached
    }

    /// Whether the current session has read or written the remote record.
    pub fn is_established(&self) -> bool {
        *self.established.borrow()
    }

    /// Follow the established flag of the current session.
    ///
    /// Resets to false whenever a session starts or stops.
    pub fn subscribe_established(&self) -> watch::Receiver<bool> {
        self.established.subscribe()
    }

    /// Counters so far.
    pub fn stats(&self) -> SyncStats {
        *self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn shutdown(session: Session) {
    session.handle.abort();
    if let Err(e) = session.handle.await {
        if e.is_panic() {
            warn!("Inventory sync for {} panicked", session.user_id);
        }
    }
    info!("Stopped inventory sync for {}", session.user_id);
}

struct Worker {
    user_id: String,
    local: Arc<LocalInventoryStore>,
    remote: RemoteInventoryStore,
    state: Arc<watch::Sender<ReconcilerState>>,
    stats: Arc<Mutex<SyncStats>>,
    /// Set once a remote read or migration succeeded this session
    established: Arc<watch::Sender<bool>>,
    /// Fingerprints of pushes whose echo has not arrived yet, oldest first
    pushed: VecDeque<String>,
    echo_window: usize,
    last_remote: Option<String>,
}

impl Worker {
    async fn run(mut self, mut local_rx: broadcast::Receiver<InventoryChange>) {
        let mut feed = None;
        self.initial_merge(&mut feed, false).await;
        self.set_state(ReconcilerState::Syncing);

        loop {
            tokio::select! {
                event = next_remote(&mut feed) => match event {
                    InventoryEvent::Changed(record) => self.on_remote(record),
                    InventoryEvent::Lagged(missed) => {
                        debug!("Remote inventory feed for {} lagged by {}", self.user_id, missed);
                        self.refetch().await;
                    }
                    InventoryEvent::Closed => {
                        warn!("Remote inventory feed for {} closed", self.user_id);
                        feed = None;
                        self.pushed.clear();
                    }
                },
                change = local_rx.recv() => match change {
                    Ok(change) if change.origin == ChangeOrigin::Remote => {}
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        drain(&mut local_rx);
                        self.on_local_change(&mut feed).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Local inventory for {} closed", self.user_id);
                        break;
                    }
                },
            }
        }
    }

    /// First merge of the session.
    ///
    /// With `fold_local` set the local record has changed since sign-in, so
    /// its entries missing remotely are kept and pushed rather than replaced.
    async fn initial_merge(&mut self, feed: &mut Option<InventoryFeed>, fold_local: bool) {
        self.ensure_watching(feed).await;

        let local = self.local.snapshot();
        let remote = match self.remote.fetch(&self.user_id).await {
            Ok(remote) => remote.unwrap_or_default(),
            Err(Error::Serialization(e)) => {
                warn!(
                    "Remote inventory of {} is undecodable, overwriting with local copy: {}",
                    self.user_id, e
                );
                self.count(|s| s.failures += 1);
                self.migrate(&local).await;
                return;
            }
            Err(e) => {
                warn!(
                    "Initial inventory fetch for {} failed, keeping local copy: {}",
                    self.user_id, e
                );
                self.count(|s| s.failures += 1);
                return;
            }
        };

        if remote.is_empty() && !local.is_empty() {
            self.migrate(&local).await;
            return;
        }

        let remote_fingerprint = remote.fingerprint();
        let mut merged = remote;
        if fold_local {
            merged.merge_missing(local);
        }
        self.last_remote = Some(remote_fingerprint.clone());
        if merged.fingerprint() == remote_fingerprint {
            self.apply(merged);
            self.mark_established();
            return;
        }

        info!("Folding local-only items for {} into remote inventory", self.user_id);
        self.apply(merged.clone());
        if self.push(&merged).await.is_ok() {
            self.mark_established();
        }
    }

    /// Upload a local record the remote cannot offer anything against.
    async fn migrate(&mut self, local: &InventoryRecord) {
        self.set_state(ReconcilerState::Migrating);
        info!(
            "Migrating {} local items for {} to remote",
            local.collected_items.len(),
            self.user_id
        );
        if self.push(local).await.is_ok() {
            self.mark_established();
        }
    }

    async fn ensure_watching(&mut self, feed: &mut Option<InventoryFeed>) {
        if feed.is_some() {
            return;
        }
        match self.remote.watch(&self.user_id).await {
            Ok(f) => {
                // Echoes of earlier pushes went out before this subscription
                self.pushed.clear();
                *feed = Some(f);
            }
            Err(e) => {
                warn!("Could not watch inventory of {}: {}", self.user_id, e);
                self.count(|s| s.failures += 1);
            }
        }
    }

    fn on_remote(&mut self, record: InventoryRecord) {
        self.mark_established();

        let fingerprint = record.fingerprint();
        self.last_remote = Some(fingerprint.clone());

        // Echoes arrive in push order; each push accounts for one of them
        if let Some(position) = self.pushed.iter().position(|p| *p == fingerprint) {
            debug!("Skipping echo of pushed inventory for {}", self.user_id);
            self.pushed.drain(..=position);
            self.count(|s| s.echoes_skipped += 1);
            return;
        }

        // Another writer moved the remote on; earlier pushes are superseded
        self.pushed.clear();
        self.apply(record);
    }

    async fn on_local_change(&mut self, feed: &mut Option<InventoryFeed>) {
        if !self.is_established() {
            debug!("Session for {} not established, re-running merge", self.user_id);
            self.initial_merge(feed, true).await;
            self.set_state(ReconcilerState::Syncing);
            return;
        }

        self.ensure_watching(feed).await;
        let record = self.local.snapshot();
        if self.last_remote.as_deref() == Some(record.fingerprint().as_str()) {
            debug!("Local inventory for {} already matches remote", self.user_id);
            return;
        }
        let _ = self.push(&record).await;
    }

    async fn refetch(&mut self) {
        match self.remote.fetch(&self.user_id).await {
            Ok(Some(record)) => self.on_remote(record),
            Ok(None) => {}
            Err(e) => {
                warn!("Inventory refetch for {} failed: {}", self.user_id, e);
                self.count(|s| s.failures += 1);
            }
        }
    }

    fn apply(&mut self, record: InventoryRecord) {
        match self.local.apply_remote(record) {
            Ok(true) => {
                debug!("Applied remote inventory for {}", self.user_id);
                self.count(|s| s.pulls_applied += 1);
            }
            Ok(false) => {}
            Err(e) => {
                warn!("Could not apply remote inventory for {}: {}", self.user_id, e);
                self.count(|s| s.failures += 1);
            }
        }
    }

    async fn push(&mut self, record: &InventoryRecord) -> Result<(), Error> {
        let fingerprint = record.fingerprint();
        match self.remote.push(&self.user_id, record).await {
            Ok(()) => {
                debug!("Pushed inventory for {}", self.user_id);
                self.remember(fingerprint.clone());
                self.last_remote = Some(fingerprint);
                self.count(|s| s.pushes += 1);
                Ok(())
            }
            Err(e) => {
                warn!("Inventory push for {} failed: {}", self.user_id, e);
                self.count(|s| s.failures += 1);
                Err(e)
            }
        }
    }

    fn remember(&mut self, fingerprint: String) {
        if self.echo_window == 0 {
            return;
        }
        if self.pushed.len() == self.echo_window {
            self.pushed.pop_front();
        }
        self.pushed.push_back(fingerprint);
    }

    fn is_established(&self) -> bool {
        *self.established.borrow()
    }

    fn mark_established(&self) {
        if !self.established.send_replace(true) {
            debug!("Inventory sync for {} established", self.user_id);
        }
    }

    fn set_state(&self, state: ReconcilerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Inventory sync for {}: {} -> {}", self.user_id, previous, state);
        }
    }

    fn count(&self, f: impl FnOnce(&mut SyncStats)) {
        f(&mut self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));
    }
}

async fn next_remote(feed: &mut Option<InventoryFeed>) -> InventoryEvent {
    match feed {
        Some(feed) => feed.next().await,
        None => std::future::pending().await,
    }
}

/// Discard queued local events; one push of the latest snapshot covers them.
fn drain(rx: &mut broadcast::Receiver<InventoryChange>) {
    loop {
        match rx.try_recv() {
            Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{KeyValueStore, MemoryKv};
    use crate::memory::MemoryDocumentStore;
    use crate::models::{CollectedItem, DropSnapshot};

    const WAIT: Duration = Duration::from_secs(5);

    struct Fixture {
        documents: Arc<MemoryDocumentStore>,
        remote: RemoteInventoryStore,
        reconciler: InventoryReconciler,
        local: Arc<LocalInventoryStore>,
    }

    fn fixture(user_id: &str) -> Fixture {
        let documents = Arc::new(MemoryDocumentStore::new());
        let remote = RemoteInventoryStore::new(documents.clone(), "inventories");
        let reconciler = InventoryReconciler::new(remote.clone(), 8);
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
        let local = Arc::new(LocalInventoryStore::open(kv, user_id, 64).unwrap());
        Fixture {
            documents,
            remote,
            reconciler,
            local,
        }
    }

    fn item(id: &str) -> CollectedItem {
        CollectedItem::new(id, DropSnapshot::text(id), 1)
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + WAIT;
        while tokio::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[tokio::test]
    async fn starts_and_stops() {
        let f = fixture("u1");
        assert_eq!(f.reconciler.state(), ReconcilerState::Idle);

        f.reconciler.start("u1", f.local.clone()).await;
        assert!(f.reconciler.wait_for(ReconcilerState::Syncing, WAIT).await);
        assert_eq!(f.reconciler.user().await.as_deref(), Some("u1"));

        f.reconciler.stop().await;
        f.reconciler.stop().await;
        assert_eq!(f.reconciler.state(), ReconcilerState::Idle);
        assert!(f.reconciler.user().await.is_none());
    }

    #[tokio::test]
    async fn local_changes_are_pushed() {
        let f = fixture("u1");
        f.reconciler.start("u1", f.local.clone()).await;
        assert!(f.reconciler.wait_for(ReconcilerState::Syncing, WAIT).await);

        f.local.upsert_collected(item("d1")).unwrap();

        let doc = f.remote.doc_ref("u1");
        assert!(eventually(|| f.documents.write_count(&doc) == 1).await);
        let pushed = f.documents.document(&doc).unwrap();
        let record = InventoryRecord::from_fields(&pushed.fields).unwrap();
        assert!(record.get("d1").is_some());
    }

    #[tokio::test]
    async fn echoes_of_pushes_are_skipped() {
        let f = fixture("u1");
        f.reconciler.start("u1", f.local.clone()).await;
        assert!(f.reconciler.wait_for(ReconcilerState::Syncing, WAIT).await);

        f.local.upsert_collected(item("d1")).unwrap();
        assert!(eventually(|| f.reconciler.stats().echoes_skipped == 1).await);

        let stats = f.reconciler.stats();
        assert_eq!(stats.pushes, 1);
        assert_eq!(stats.pulls_applied, 0);
    }

    #[tokio::test]
    async fn failed_initial_fetch_keeps_local_and_retries_on_change() {
        let f = fixture("u1");
        f.local.upsert_collected(item("d1")).unwrap();
        f.documents.set_offline(true);

        f.reconciler.start("u1", f.local.clone()).await;
        assert!(f.reconciler.wait_for(ReconcilerState::Syncing, WAIT).await);
        assert!(f.reconciler.stats().failures >= 1);
        assert!(f.local.snapshot().get("d1").is_some());

        f.documents.set_offline(false);
        f.local.upsert_collected(item("d2")).unwrap();

        let doc = f.remote.doc_ref("u1");
        assert!(eventually(|| f.documents.document(&doc).is_some()).await);
        let migrated = f.remote.fetch("u1").await.unwrap().unwrap();
        assert_eq!(migrated, f.local.snapshot());
    }

    #[tokio::test]
    async fn undecodable_remote_is_overwritten() {
        let f = fixture("u1");
        let doc = f.remote.doc_ref("u1");
        let broken: crate::document::Fields = serde_json::json!({ "collectedItems": "garbage" })
            .as_object()
            .cloned()
            .unwrap();
        f.documents.seed(&doc, broken);
        assert!(f.remote.fetch("u1").await.is_err());

        f.local.upsert_collected(item("d1")).unwrap();
        f.reconciler.start("u1", f.local.clone()).await;
        assert!(f.reconciler.wait_for(ReconcilerState::Syncing, WAIT).await);
        assert!(f.reconciler.is_established());

        let repaired = f.remote.fetch("u1").await.unwrap().unwrap();
        assert_eq!(repaired, f.local.snapshot());
        assert_eq!(f.reconciler.stats().pushes, 1);
    }

    #[tokio::test]
    async fn closed_feed_is_resubscribed_on_next_change() {
        let f = fixture("u1");
        f.reconciler.start("u1", f.local.clone()).await;
        assert!(f.reconciler.wait_for(ReconcilerState::Syncing, WAIT).await);

        f.local.upsert_collected(item("d1")).unwrap();
        assert!(eventually(|| f.reconciler.stats().echoes_skipped == 1).await);

        f.documents.close_feeds();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The push after the close is echoed on a fresh feed
        f.local.upsert_collected(item("d2")).unwrap();
        assert!(eventually(|| f.reconciler.stats().echoes_skipped == 2).await);

        let mut other_device = InventoryRecord::default();
        other_device.upsert(item("d9"));
        f.remote.push("u1", &other_device).await.unwrap();
        assert!(eventually(|| f.local.snapshot() == other_device).await);
    }

    #[tokio::test]
    async fn established_flag_follows_the_session() {
        let f = fixture("u1");
        f.documents.set_offline(true);
        f.reconciler.start("u1", f.local.clone()).await;
        assert!(f.reconciler.wait_for(ReconcilerState::Syncing, WAIT).await);
        assert!(!f.reconciler.is_established());

        f.documents.set_offline(false);
        f.local.upsert_collected(item("d1")).unwrap();
        let mut established = f.reconciler.subscribe_established();
        assert!(tokio::time::timeout(WAIT, established.wait_for(|e| *e)).await.is_ok());

        f.reconciler.stop().await;
        assert!(!f.reconciler.is_established());
    }

    #[tokio::test]
    async fn restart_replaces_session() {
        let f = fixture("u1");
        f.reconciler.start("u1", f.local.clone()).await;
        assert!(f.reconciler.wait_for(ReconcilerState::Syncing, WAIT).await);

        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
        let other = Arc::new(LocalInventoryStore::open(kv, "u2", 64).unwrap());
        f.reconciler.start("u2", other.clone()).await;
        assert!(f.reconciler.wait_for(ReconcilerState::Syncing, WAIT).await);
        assert_eq!(f.reconciler.user().await.as_deref(), Some("u2"));

        // The old session no longer pushes
        f.local.upsert_collected(item("d1")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.documents.write_count(&f.remote.doc_ref("u1")), 0);
        f.reconciler.stop().await;
    }
}
