//! The canonical tri-state vote.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A user's vote on a single drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vote {
    /// No vote recorded
    #[default]
    None,
    /// Upvote
    Up,
    /// Downvote
    Down,
}

impl Vote {
    /// All votes, in declaration order.
    pub const ALL: [Vote; 3] = [Vote::None, Vote::Up, Vote::Down];

    /// The value written to `votesByUser` for this vote.
    ///
    /// `None` has no stored representation: the user's entry is removed.
    pub fn canonical(self) -> Option<Value> {
        match self {
            Self::None => None,
            Self::Up => Some(Value::String("up".to_string())),
            Self::Down => Some(Value::String("down".to_string())),
        }
    }

    /// Whether `raw` is exactly the canonical representation of some vote.
    pub fn is_canonical(raw: &Value) -> bool {
        matches!(raw, Value::String(s) if s == "up" || s == "down")
    }

    /// Contribution of this vote to the (upvote, downvote) counters.
    pub fn counters(self) -> (u64, u64) {
        match self {
            Self::None => (0, 0),
            Self::Up => (1, 0),
            Self::Down => (0, 1),
        }
    }
}

impl std::fmt::Display for Vote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}
