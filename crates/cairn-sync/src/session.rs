//! Identity-driven switching of the active inventory.
//!
//! Exactly one [`LocalInventoryStore`] is active at a time: the signed-in
//! user's, or the anonymous one. Switching identity stops the reconciler
//! before anything else happens, so a previous user's session can never
//! write into the next user's inventory.

use crate::error::{Error, Result};
use crate::kv::KeyValueStore;
use crate::local::LocalInventoryStore;
use crate::reconciler::{InventoryReconciler, ReconcilerState};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Namespace of the inventory kept while nobody is signed in.
pub const ANONYMOUS_NAMESPACE: &str = "anonymous";

/// Upper bound on waiting for the first merge before adopting anonymous items.
const FIRST_MERGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Event from an identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityEvent {
    /// A user signed in
    SignedIn(String),
    /// The user signed out
    SignedOut,
}

struct Active {
    user_id: Option<String>,
    store: Arc<LocalInventoryStore>,
}

/// Tracks the signed-in user and owns the active inventory.
pub struct SessionLifecycleController {
    kv: Arc<dyn KeyValueStore>,
    reconciler: Arc<InventoryReconciler>,
    event_capacity: usize,
    active: RwLock<Active>,
    transition: tokio::sync::Mutex<()>,
    /// Clears the anonymous namespace once the adopting session is established
    handover: Mutex<Option<JoinHandle<()>>>,
}

impl SessionLifecycleController {
    /// Start signed out, with the persisted anonymous inventory active.
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        reconciler: Arc<InventoryReconciler>,
        event_capacity: usize,
    ) -> Result<Self> {
        let store = LocalInventoryStore::open(Arc::clone(&kv), ANONYMOUS_NAMESPACE, event_capacity)?;
        Ok(Self {
            kv,
            reconciler,
            event_capacity,
            active: RwLock::new(Active {
                user_id: None,
                store: Arc::new(store),
            }),
            transition: tokio::sync::Mutex::new(()),
            handover: Mutex::new(None),
        })
    }

    /// Signed-in user, if any.
    pub fn active_user(&self) -> Option<String> {
        self.read().user_id.clone()
    }

    /// Inventory currently shown to the user.
    pub fn active_store(&self) -> Arc<LocalInventoryStore> {
        Arc::clone(&self.read().store)
    }

    /// Switch to `user_id`'s inventory and start syncing it.
    ///
    /// Items collected while signed out are folded into the user's inventory
    /// once the first merge with the remote has run. The anonymous namespace
    /// is cleared when the session is established, so an offline sign-in
    /// that ends before reaching the remote leaves it in place.
    pub async fn signed_in(&self, user_id: &str) -> Result<()> {
        if user_id.trim().is_empty() || user_id == ANONYMOUS_NAMESPACE {
            return Err(Error::InvalidInput(format!("invalid user id {:?}", user_id)));
        }

        let _transition = self.transition.lock().await;
        if self.active_user().as_deref() == Some(user_id) {
            return Ok(());
        }

        self.cancel_handover().await;
        self.reconciler.stop().await;

        let previous = self.active_store();
        let anonymous = if previous.namespace() == ANONYMOUS_NAMESPACE {
            previous
        } else {
            Arc::new(LocalInventoryStore::open(
                Arc::clone(&self.kv),
                ANONYMOUS_NAMESPACE,
                self.event_capacity,
            )?)
        };

        let store = Arc::new(LocalInventoryStore::open(
            Arc::clone(&self.kv),
            user_id,
            self.event_capacity,
        )?);
        self.replace(Some(user_id.to_string()), Arc::clone(&store));
        info!("Signed in as {}", user_id);

        self.reconciler.start(user_id, Arc::clone(&store)).await;

        let pending = anonymous.snapshot();
        if !pending.is_empty() {
            if !self
                .reconciler
                .wait_for(ReconcilerState::Syncing, FIRST_MERGE_TIMEOUT)
                .await
            {
                warn!("First inventory merge for {} still running, adopting anyway", user_id);
            }
            info!(
                "Adopting {} anonymous items into {}",
                pending.collected_items.len(),
                user_id
            );
            store.adopt(pending)?;
            self.hand_over(user_id, anonymous)?;
        }

        Ok(())
    }

    /// Stop syncing and fall back to the anonymous inventory.
    ///
    /// The user's inventory stays persisted on the device.
    pub async fn signed_out(&self) -> Result<()> {
        let _transition = self.transition.lock().await;
        let Some(user_id) = self.active_user() else {
            return Ok(());
        };

        self.cancel_handover().await;
        self.reconciler.stop().await;

        let store = LocalInventoryStore::open(
            Arc::clone(&self.kv),
            ANONYMOUS_NAMESPACE,
            self.event_capacity,
        )?;
        self.replace(None, Arc::new(store));
        info!("Signed out {}", user_id);
        Ok(())
    }

    /// Follow an identity change.
    pub async fn on_identity_changed(&self, user_id: Option<&str>) -> Result<()> {
        match user_id {
            Some(user_id) => self.signed_in(user_id).await,
            None => self.signed_out().await,
        }
    }

    /// Apply identity events until the provider closes the channel.
    pub async fn run_identity_feed(&self, mut events: mpsc::Receiver<IdentityEvent>) {
        while let Some(event) = events.recv().await {
            let result = match &event {
                IdentityEvent::SignedIn(user_id) => self.signed_in(user_id).await,
                IdentityEvent::SignedOut => self.signed_out().await,
            };
            if let Err(e) = result {
                warn!("Identity change {:?} failed: {}", event, e);
            }
        }
        info!("Identity feed closed");
    }

    /// Clear the adopted anonymous items now, or once the session is
    /// established.
    fn hand_over(&self, user_id: &str, anonymous: Arc<LocalInventoryStore>) -> Result<()> {
        if self.reconciler.is_established() {
            return anonymous.clear();
        }

        info!("Keeping anonymous items until {} reaches the remote", user_id);
        let mut established = self.reconciler.subscribe_established();
        let user_id = user_id.to_string();
        let handle = tokio::spawn(async move {
            if established.wait_for(|established| *established).await.is_err() {
                return;
            }
            match anonymous.clear() {
                Ok(()) => debug!("Cleared anonymous items adopted by {}", user_id),
                Err(e) => warn!("Could not clear anonymous items adopted by {}: {}", user_id, e),
            }
        });
        *self.handover.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
        Ok(())
    }

    async fn cancel_handover(&self) {
        let pending = self
            .handover
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = pending {
            handle.abort();
            let _ = handle.await;
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Active> {
        self.active.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn replace(&self, user_id: Option<String>, store: Arc<LocalInventoryStore>) {
        let mut active = self
            .active
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *active = Active { user_id, store };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::memory::MemoryDocumentStore;
    use crate::models::{CollectedItem, DropSnapshot};
    use crate::remote::RemoteInventoryStore;

    fn controller() -> (Arc<MemoryKv>, Arc<InventoryReconciler>, SessionLifecycleController) {
        controller_over(Arc::new(MemoryDocumentStore::new()))
    }

    fn controller_over(
        documents: Arc<MemoryDocumentStore>,
    ) -> (Arc<MemoryKv>, Arc<InventoryReconciler>, SessionLifecycleController) {
        let kv = Arc::new(MemoryKv::new());
        let remote = RemoteInventoryStore::new(documents, "inventories");
        let reconciler = Arc::new(InventoryReconciler::new(remote, 8));
        let session = SessionLifecycleController::new(kv.clone(), reconciler.clone(), 64).unwrap();
        (kv, reconciler, session)
    }

    fn item(id: &str) -> CollectedItem {
        CollectedItem::new(id, DropSnapshot::text(id), 1)
    }

    #[tokio::test]
    async fn starts_anonymous() {
        let (_, reconciler, session) = controller();
        assert!(session.active_user().is_none());
        assert_eq!(session.active_store().namespace(), ANONYMOUS_NAMESPACE);
        assert_eq!(reconciler.state(), ReconcilerState::Idle);
    }

    #[tokio::test]
    async fn sign_in_adopts_anonymous_items() {
        let (kv, _, session) = controller();
        session.active_store().upsert_collected(item("d1")).unwrap();

        session.signed_in("u1").await.unwrap();
        assert_eq!(session.active_user().as_deref(), Some("u1"));
        assert!(session.active_store().snapshot().get("d1").is_some());
        assert!(kv.get("inventory:anonymous").unwrap().is_none());
    }

    #[tokio::test]
    async fn offline_sign_in_keeps_anonymous_items_until_established() {
        let documents = Arc::new(MemoryDocumentStore::new());
        let (kv, reconciler, session) = controller_over(documents.clone());
        session.active_store().upsert_collected(item("d1")).unwrap();

        documents.set_offline(true);
        session.signed_in("u1").await.unwrap();
        assert!(session.active_store().snapshot().get("d1").is_some());
        assert!(!reconciler.is_established());
        assert!(kv.get("inventory:anonymous").unwrap().is_some());

        documents.set_offline(false);
        session.active_store().upsert_collected(item("d2")).unwrap();

        let mut cleared = false;
        for _ in 0..500 {
            if kv.get("inventory:anonymous").unwrap().is_none() {
                cleared = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(cleared);
        assert!(reconciler.is_established());
        let inventory = session.active_store().snapshot();
        assert!(inventory.get("d1").is_some());
        assert!(inventory.get("d2").is_some());
    }

    #[tokio::test]
    async fn sign_out_before_established_keeps_anonymous_items() {
        let documents = Arc::new(MemoryDocumentStore::new());
        let (kv, _, session) = controller_over(documents.clone());
        session.active_store().upsert_collected(item("d1")).unwrap();

        documents.set_offline(true);
        session.signed_in("u1").await.unwrap();
        session.signed_out().await.unwrap();

        assert!(kv.get("inventory:anonymous").unwrap().is_some());
        assert!(session.active_store().snapshot().get("d1").is_some());
    }

    #[tokio::test]
    async fn same_user_is_a_noop() {
        let (_, _, session) = controller();
        session.signed_in("u1").await.unwrap();
        let store = session.active_store();
        session.signed_in("u1").await.unwrap();
        assert!(Arc::ptr_eq(&store, &session.active_store()));
    }

    #[tokio::test]
    async fn sign_out_keeps_user_data() {
        let (kv, reconciler, session) = controller();
        session.signed_in("u1").await.unwrap();
        session.active_store().upsert_collected(item("d1")).unwrap();

        session.signed_out().await.unwrap();
        assert!(session.active_user().is_none());
        assert!(session.active_store().snapshot().is_empty());
        assert_eq!(reconciler.state(), ReconcilerState::Idle);
        assert!(kv.get("inventory:u1").unwrap().is_some());
    }

    #[tokio::test]
    async fn rejects_reserved_user_id() {
        let (_, _, session) = controller();
        assert!(matches!(
            session.signed_in(ANONYMOUS_NAMESPACE).await,
            Err(Error::InvalidInput(_))
        ));
        assert!(session.signed_in("  ").await.is_err());
    }

    #[tokio::test]
    async fn identity_feed_drives_transitions() {
        let (_, _, session) = controller();
        let (tx, rx) = mpsc::channel(4);
        tx.send(IdentityEvent::SignedIn("u1".into())).await.unwrap();
        tx.send(IdentityEvent::SignedIn("u2".into())).await.unwrap();
        drop(tx);

        session.run_identity_feed(rx).await;
        assert_eq!(session.active_user().as_deref(), Some("u2"));
    }
}
