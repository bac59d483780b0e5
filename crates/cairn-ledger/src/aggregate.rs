//! Vote aggregates and counter transactions.

use crate::normalize::normalize_vote;
use crate::vote::Vote;
use crate::{DOWNVOTE_COUNT_FIELD, UPVOTE_COUNT_FIELD, VOTES_BY_USER_FIELD};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Shared vote tally for one drop.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteAggregate {
    /// Number of users whose vote resolves to [`Vote::Up`]
    #[serde(default)]
    pub upvote_count: u64,

    /// Number of users whose vote resolves to [`Vote::Down`]
    #[serde(default)]
    pub downvote_count: u64,

    /// Raw stored vote per user id, in whatever shape the writer used
    #[serde(default)]
    pub votes_by_user: Map<String, Value>,
}

impl VoteAggregate {
    /// Create an aggregate with the given counters and no per-user entries.
    pub fn new(upvote_count: u64, downvote_count: u64) -> Self {
        Self {
            upvote_count,
            downvote_count,
            votes_by_user: Map::new(),
        }
    }

    /// Read an aggregate out of a stored document's fields.
    ///
    /// Never fails: missing or malformed counters read as 0 and a malformed
    /// vote map reads as empty.
    pub fn from_fields(fields: &Map<String, Value>) -> Self {
        let votes_by_user = match fields.get(VOTES_BY_USER_FIELD) {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };

        Self {
            upvote_count: read_counter(fields.get(UPVOTE_COUNT_FIELD)),
            downvote_count: read_counter(fields.get(DOWNVOTE_COUNT_FIELD)),
            votes_by_user,
        }
    }

    /// Write the aggregate into a document's fields, leaving other fields alone.
    pub fn write_into(&self, fields: &mut Map<String, Value>) {
        fields.insert(UPVOTE_COUNT_FIELD.to_string(), Value::from(self.upvote_count));
        fields.insert(
            DOWNVOTE_COUNT_FIELD.to_string(),
            Value::from(self.downvote_count),
        );
        fields.insert(
            VOTES_BY_USER_FIELD.to_string(),
            Value::Object(self.votes_by_user.clone()),
        );
    }

    /// The normalized vote currently stored for `user_id`.
    pub fn vote_of(&self, user_id: &str) -> Vote {
        self.votes_by_user
            .get(user_id)
            .map(normalize_vote)
            .unwrap_or(Vote::None)
    }

    /// Apply a computed transaction for `user_id`.
    pub fn apply(&mut self, user_id: &str, tx: &VoteTransaction) {
        self.upvote_count = tx.new_upvote_count;
        self.downvote_count = tx.new_downvote_count;
        match &tx.new_raw_value {
            Some(raw) => {
                self.votes_by_user.insert(user_id.to_string(), raw.clone());
            }
            None => {
                self.votes_by_user.remove(user_id);
            }
        }
    }

    /// The aggregate as it would look after `user_id` votes `desired`.
    pub fn preview(&self, user_id: &str, desired: Vote) -> (VoteTransaction, VoteAggregate) {
        let tx = compute_transaction(self, user_id, desired);
        let mut next = self.clone();
        next.apply(user_id, &tx);
        (tx, next)
    }

    /// Counters derived from the per-user map alone.
    ///
    /// Differs from the stored counters when legacy writers skipped an
    /// increment or a decrement was clamped.
    pub fn recount(&self) -> (u64, u64) {
        self.votes_by_user
            .values()
            .map(|raw| normalize_vote(raw).counters())
            .fold((0, 0), |(up, down), (u, d)| (up + u, down + d))
    }

    /// Whether the stored counters agree with [`recount`](Self::recount).
    pub fn is_consistent(&self) -> bool {
        self.recount() == (self.upvote_count, self.downvote_count)
    }
}

fn read_counter(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| {
                n.as_f64()
                    .filter(|f| f.is_finite() && *f > 0.0)
                    .map(|f| f as u64)
            })
            .unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// Result of moving one user from their stored vote to a desired vote.
#[derive(Debug, Clone, PartialEq)]
pub struct VoteTransaction {
    /// Vote the user had before, after normalization
    pub previous_vote: Vote,
    /// Vote the user asked for
    pub desired_vote: Vote,
    /// Upvote counter after the transaction
    pub new_upvote_count: u64,
    /// Downvote counter after the transaction
    pub new_downvote_count: u64,
    /// Canonical value to store for the user, `None` to remove the entry
    pub new_raw_value: Option<Value>,
}

impl VoteTransaction {
    /// True when the vote is unchanged and no counter moves.
    pub fn is_noop(&self) -> bool {
        self.previous_vote == self.desired_vote
    }
}

/// Compute the counters and stored value for `user_id` voting `desired`.
///
/// Decrements saturate at zero, so an aggregate that is already
/// inconsistent (a stray downvote with `downvote_count == 0`) never goes
/// negative.
pub fn compute_transaction(
    aggregate: &VoteAggregate,
    user_id: &str,
    desired: Vote,
) -> VoteTransaction {
    let previous = aggregate.vote_of(user_id);
    let mut up = aggregate.upvote_count;
    let mut down = aggregate.downvote_count;

    if previous != desired {
        match previous {
            Vote::Up => up = up.saturating_sub(1),
            Vote::Down => down = down.saturating_sub(1),
            Vote::None => {}
        }
        match desired {
            Vote::Up => up = up.saturating_add(1),
            Vote::Down => down = down.saturating_add(1),
            Vote::None => {}
        }
    }

    VoteTransaction {
        previous_vote: previous,
        desired_vote: desired,
        new_upvote_count: up,
        new_downvote_count: down,
        new_raw_value: desired.canonical(),
    }
}
