//! Cairn Sync - Engagement Ledger & Inventory Reconciliation
//!
//! Keeps a user's drop inventory consistent between the device cache and the
//! remote ledger, and applies votes to shared drop aggregates without losing
//! concurrent updates.
//!
//! # Architecture
//!
//! - **Document store**: abstract transactional remote store (`document`),
//!   with an in-process implementation (`memory`)
//! - **Device cache**: key-value contract (`kv`) backed by RocksDB (`storage`)
//! - **Inventory**: local cache with origin-tagged events (`local`) and the
//!   remote per-user documents (`remote`)
//! - **Reconciler**: session-scoped two-way sync (`reconciler`)
//! - **Session**: identity switching and anonymous adoption (`session`)
//! - **Votes**: optimistic vote transactions (`votes`)
//! - **Engine**: the facade applications use (`engine`)
//!
//! # Example
//!
//! ```no_run
//! use cairn_sync::{Engine, EngineConfig, MemoryDocumentStore};
//! use cairn_sync::models::DropSnapshot;
//! use cairn_ledger::Vote;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let documents = Arc::new(MemoryDocumentStore::new());
//!     let engine = Engine::open(EngineConfig::from_env(), documents)?;
//!
//!     engine.on_identity_changed(Some("ana")).await?;
//!     engine.collect("drop-1", DropSnapshot::text("under the bridge"))?;
//!     engine.vote("drop-1", "ana", Vote::Up).await?;
//!     Ok(())
//! }
//! ```

pub mod command;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod kv;
pub mod local;
pub mod memory;
pub mod models;
pub mod reconciler;
pub mod remote;
pub mod session;
pub mod storage;
pub mod votes;

pub use config::EngineConfig;
pub use document::{DocRef, Document, DocumentFeed, DocumentStore, FeedEvent, Fields};
pub use engine::Engine;
pub use error::{Error, Result};
pub use kv::{KeyValueStore, MemoryKv};
pub use local::{ChangeOrigin, InventoryChange, LocalInventoryStore};
pub use memory::MemoryDocumentStore;
pub use reconciler::{InventoryReconciler, ReconcilerState, SyncStats};
pub use remote::{InventoryEvent, InventoryFeed, RemoteInventoryStore};
pub use session::{IdentityEvent, SessionLifecycleController, ANONYMOUS_NAMESPACE};
pub use storage::RocksKv;
pub use votes::{OptimisticVote, VoteOutcome, VoteTransactionRunner};

/// Current wall-clock time in unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
