//! Line-delimited JSON command protocol for `cairn-node`.
//!
//! One command object per line in, one response object per line out.

use crate::document::{DocRef, Fields};
use crate::engine::Engine;
use crate::error::Result;
use crate::memory::MemoryDocumentStore;
use crate::models::{DropSnapshot, InventoryRecord, LikeStatus, Redemption};
use crate::reconciler::{ReconcilerState, SyncStats};
use cairn_ledger::{normalize_vote, Vote};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Command read from the input stream.
#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    /// Switch to a user
    SignIn { user_id: String },
    /// Switch to the anonymous inventory
    SignOut,
    /// Collect a drop
    Collect {
        item_id: String,
        #[serde(default)]
        text: Option<String>,
    },
    /// Ignore (or stop ignoring) a drop
    Ignore {
        item_id: String,
        #[serde(default = "default_true")]
        ignored: bool,
    },
    /// Press like or dislike
    Like { item_id: String, status: LikeStatus },
    /// Redeem a collected drop
    Redeem {
        item_id: String,
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        limit: Option<u32>,
    },
    /// Remove a drop from the inventory
    Discard { item_id: String },
    /// Vote on a drop; `vote` accepts any stored vote encoding
    Vote {
        item_id: String,
        #[serde(default)]
        vote: Value,
        #[serde(default)]
        user_id: Option<String>,
    },
    /// Show the active inventory
    Inventory,
    /// Create or replace a drop document in the in-process store
    SeedDrop {
        item_id: String,
        #[serde(default)]
        fields: Fields,
    },
    /// Show session and sync state
    State,
    /// Ping (health check)
    Ping,
}

fn default_true() -> bool {
    true
}

/// Response written for each command.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandResponse {
    Ok { message: String },
    Error { error: String },
    Inventory { inventory: InventoryRecord },
    Like { like_status: LikeStatus },
    Redemption { redemption: Redemption },
    Vote {
        previous_vote: Vote,
        vote: Vote,
        upvote_count: u64,
        downvote_count: u64,
    },
    State {
        user_id: Option<String>,
        reconciler: ReconcilerState,
        stats: SyncStats,
    },
    Pong,
}

impl From<crate::error::Error> for CommandResponse {
    fn from(e: crate::error::Error) -> Self {
        CommandResponse::Error {
            error: e.to_string(),
        }
    }
}

/// Executes commands against an engine backed by an in-process store.
pub struct CommandServer {
    engine: Arc<Engine>,
    documents: Arc<MemoryDocumentStore>,
}

impl CommandServer {
    /// Create a server for `engine`, seeding drops into `documents`.
    pub fn new(engine: Arc<Engine>, documents: Arc<MemoryDocumentStore>) -> Self {
        Self { engine, documents }
    }

    /// Serve commands until the input closes.
    pub async fn serve<R, W>(&self, mut reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut line = String::new();

        while reader.read_line(&mut line).await? > 0 {
            if !line.trim().is_empty() {
                let response = match serde_json::from_str::<Command>(&line) {
                    Ok(cmd) => self.execute(cmd).await,
                    Err(e) => CommandResponse::Error {
                        error: format!("Invalid command: {}", e),
                    },
                };

                let response_json = serde_json::to_string(&response)? + "\n";
                writer.write_all(response_json.as_bytes()).await?;
                writer.flush().await?;
            }
            line.clear();
        }

        Ok(())
    }

    /// Execute one command.
    pub async fn execute(&self, cmd: Command) -> CommandResponse {
        let engine = &self.engine;
        match cmd {
            Command::SignIn { user_id } => match engine.on_identity_changed(Some(&user_id)).await {
                Ok(()) => CommandResponse::Ok {
                    message: format!("Signed in as {}", user_id),
                },
                Err(e) => e.into(),
            },

            Command::SignOut => match engine.on_identity_changed(None).await {
                Ok(()) => CommandResponse::Ok {
                    message: "Signed out".to_string(),
                },
                Err(e) => e.into(),
            },

            Command::Collect { item_id, text } => {
                let snapshot = match text {
                    Some(text) => DropSnapshot::text(text),
                    None => self.snapshot_of(&item_id),
                };
                match engine.collect(&item_id, snapshot) {
                    Ok(_) => CommandResponse::Ok {
                        message: format!("Collected {}", item_id),
                    },
                    Err(e) => e.into(),
                }
            }

            Command::Ignore { item_id, ignored } => {
                let result = if ignored {
                    engine.ignore(&item_id)
                } else {
                    engine.unignore(&item_id)
                };
                match result {
                    Ok(()) => CommandResponse::Ok {
                        message: format!(
                            "{} {}",
                            if ignored { "Ignored" } else { "Unignored" },
                            item_id
                        ),
                    },
                    Err(e) => e.into(),
                }
            }

            Command::Like { item_id, status } => match engine.toggle_like(&item_id, status) {
                Ok(like_status) => CommandResponse::Like { like_status },
                Err(e) => e.into(),
            },

            Command::Redeem {
                item_id,
                code,
                limit,
            } => match engine.redeem(&item_id, code.as_deref(), limit) {
                Ok(redemption) => CommandResponse::Redemption { redemption },
                Err(e) => e.into(),
            },

            Command::Discard { item_id } => match engine.discard(&item_id) {
                Ok(_) => CommandResponse::Ok {
                    message: format!("Discarded {}", item_id),
                },
                Err(e) => e.into(),
            },

            Command::Vote {
                item_id,
                vote,
                user_id,
            } => {
                let desired = normalize_vote(&vote);
                let result = match user_id {
                    Some(user_id) => engine.vote(&item_id, &user_id, desired).await,
                    None => engine.vote_as_active(&item_id, desired).await,
                };
                match result {
                    Ok(outcome) => CommandResponse::Vote {
                        previous_vote: outcome.previous_vote,
                        vote: outcome.vote,
                        upvote_count: outcome.aggregate.upvote_count,
                        downvote_count: outcome.aggregate.downvote_count,
                    },
                    Err(e) => e.into(),
                }
            }

            Command::Inventory => CommandResponse::Inventory {
                inventory: engine.current_inventory(),
            },

            Command::SeedDrop { item_id, fields } => {
                let doc = DocRef::new(engine.config().drops_collection.clone(), item_id);
                let seeded = self.documents.seed(&doc, fields);
                tracing::info!("Seeded drop {} (version {})", doc, seeded.version);
                CommandResponse::Ok {
                    message: format!("Seeded {}", doc),
                }
            }

            Command::State => CommandResponse::State {
                user_id: engine.active_user(),
                reconciler: engine.reconciler_state(),
                stats: engine.sync_stats(),
            },

            Command::Ping => CommandResponse::Pong,
        }
    }

    /// Snapshot of a seeded drop's current content.
    fn snapshot_of(&self, item_id: &str) -> DropSnapshot {
        let doc = DocRef::new(self.engine.config().drops_collection.clone(), item_id);
        self.documents
            .document(&doc)
            .and_then(|d| serde_json::from_value(Value::Object(d.fields)).ok())
            .unwrap_or_default()
    }
}
