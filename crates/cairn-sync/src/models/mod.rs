//! Inventory models.
//!
//! # Core Types
//!
//! - [`InventoryRecord`] - one user's collected and ignored drops
//! - [`CollectedItem`] - a collected drop with its engagement state
//!
//! # Supporting Types
//!
//! - [`DropSnapshot`] - content captured at collection time
//! - [`LikeStatus`] - like/dislike
//! - [`Redemption`] - redemption count, limit and last code

mod inventory;
mod snapshot;

pub use inventory::{CollectedItem, InventoryRecord, LikeStatus, Redemption};
pub use snapshot::{DropSnapshot, MediaKind, MediaRef};
