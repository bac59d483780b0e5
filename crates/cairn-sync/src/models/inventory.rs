//! Per-user inventory of collected and ignored drops.

use super::snapshot::DropSnapshot;
use crate::document::Fields;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A user's like/dislike on a collected drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LikeStatus {
    #[default]
    None,
    Liked,
    Disliked,
}

impl LikeStatus {
    /// Status after the user presses `pressed`: pressing the active button
    /// clears it.
    pub fn toggled(self, pressed: LikeStatus) -> LikeStatus {
        if self == pressed {
            LikeStatus::None
        } else {
            pressed
        }
    }
}

/// Redemption state of a collected drop (coupons, one-off codes).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Redemption {
    /// Times redeemed
    #[serde(default)]
    pub count: u32,

    /// Maximum redemptions, unlimited when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,

    /// Last redemption time (unix millis)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redeemed_at: Option<u64>,

    /// Whether the drop counts as redeemed
    #[serde(default)]
    pub is_redeemed: bool,

    /// Code used for the last redemption
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_code: Option<String>,
}

impl Redemption {
    /// Redemptions left, `None` when unlimited.
    pub fn remaining(&self) -> Option<u32> {
        self.limit.map(|limit| limit.saturating_sub(self.count))
    }

    /// Whether the limit has been reached.
    pub fn is_exhausted(&self) -> bool {
        self.remaining() == Some(0)
    }
}

/// A drop in a user's inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectedItem {
    /// Drop id
    pub item_id: String,

    /// Content at collection time
    #[serde(default)]
    pub snapshot: DropSnapshot,

    /// Collection time (unix millis)
    #[serde(default)]
    pub collected_at: u64,

    /// Like/dislike
    #[serde(default)]
    pub like_status: LikeStatus,

    /// Redemption state
    #[serde(default)]
    pub redemption: Redemption,

    /// Collected but not yet opened
    #[serde(default)]
    pub pending: bool,
}

impl CollectedItem {
    /// A freshly collected drop.
    pub fn new(item_id: impl Into<String>, snapshot: DropSnapshot, collected_at: u64) -> Self {
        Self {
            item_id: item_id.into(),
            snapshot,
            collected_at,
            like_status: LikeStatus::None,
            redemption: Redemption::default(),
            pending: true,
        }
    }
}

/// A user's inventory: collected drops (most recent first) and ignored ids.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryRecord {
    /// Collected drops, most recent first, unique by id
    #[serde(default)]
    pub collected_items: Vec<CollectedItem>,

    /// Ignored drop ids
    #[serde(default)]
    pub ignored_item_ids: BTreeSet<String>,
}

impl InventoryRecord {
    /// Whether nothing has been collected or ignored.
    pub fn is_empty(&self) -> bool {
        self.collected_items.is_empty() && self.ignored_item_ids.is_empty()
    }

    /// Collected drop by id.
    pub fn get(&self, item_id: &str) -> Option<&CollectedItem> {
        self.collected_items.iter().find(|i| i.item_id == item_id)
    }

    /// Mutable collected drop by id.
    pub fn get_mut(&mut self, item_id: &str) -> Option<&mut CollectedItem> {
        self.collected_items.iter_mut().find(|i| i.item_id == item_id)
    }

    /// Whether the drop is ignored.
    pub fn is_ignored(&self, item_id: &str) -> bool {
        self.ignored_item_ids.contains(item_id)
    }

    /// Replace an existing entry in place, or insert a new one at the head.
    /// Either way the drop stops being ignored. Returns true on insert.
    pub fn upsert(&mut self, item: CollectedItem) -> bool {
        self.ignored_item_ids.remove(&item.item_id);
        match self.get_mut(&item.item_id) {
            Some(existing) => {
                *existing = item;
                false
            }
            None => {
                self.collected_items.insert(0, item);
                true
            }
        }
    }

    /// Remove a collected drop.
    pub fn remove(&mut self, item_id: &str) -> Option<CollectedItem> {
        let index = self.collected_items.iter().position(|i| i.item_id == item_id)?;
        Some(self.collected_items.remove(index))
    }

    /// Add or remove a drop from the ignored set.
    ///
    /// Ignoring a drop that is already collected keeps it collected and only
    /// clears its pending flag.
    pub fn set_ignored(&mut self, item_id: &str, ignored: bool) {
        if ignored {
            self.ignored_item_ids.insert(item_id.to_string());
            if let Some(item) = self.get_mut(item_id) {
                item.pending = false;
            }
        } else {
            self.ignored_item_ids.remove(item_id);
        }
    }

    /// Fold in entries from another record without overriding existing ones.
    ///
    /// Used when an anonymous inventory is handed over to a signed-in user.
    pub fn merge_missing(&mut self, other: InventoryRecord) {
        for item in other.collected_items {
            if self.get(&item.item_id).is_none() {
                self.ignored_item_ids.remove(&item.item_id);
                self.collected_items.push(item);
            }
        }
        for item_id in other.ignored_item_ids {
            if self.get(&item_id).is_none() {
                self.ignored_item_ids.insert(item_id);
            }
        }
        self.collected_items
            .sort_by(|a, b| b.collected_at.cmp(&a.collected_at));
    }

    /// Content fingerprint (blake3, hex).
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(blake3::hash(&bytes).as_bytes())
    }

    /// Remote document fields for this record.
    pub fn to_fields(&self) -> Result<Fields> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(fields) => Ok(fields),
            other => Err(crate::error::Error::InvalidInput(format!(
                "inventory serialized to non-object: {}",
                other
            ))),
        }
    }

    /// Decode a record from remote document fields. Unrelated fields are ignored.
    pub fn from_fields(fields: &Fields) -> Result<Self> {
        Ok(serde_json::from_value(serde_json::Value::Object(
            fields.clone(),
        ))?)
    }
}
