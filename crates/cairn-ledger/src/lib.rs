//! Cairn Ledger - vote normalization and counter arithmetic
//!
//! Every drop carries a shared vote aggregate: two counters plus a map from
//! user id to whatever value that user's client last stored. Several client
//! generations have written that map, so the stored values come in many
//! shapes (booleans, strings, signed integers, nested objects).
//!
//! This crate is pure. It performs no I/O and is safe to call from inside a
//! store transaction closure, which may run more than once.
//!
//! # Pieces
//!
//! - [`normalize_vote`] - total mapping from any stored value to a [`Vote`]
//! - [`compute_transaction`] - counter deltas for moving a user from their
//!   stored vote to a desired vote
//! - [`check_vote_write`] - the write contract the remote store enforces on
//!   aggregate documents
//!
//! # Example
//!
//! ```
//! use cairn_ledger::{compute_transaction, Vote, VoteAggregate};
//! use serde_json::json;
//!
//! let mut aggregate = VoteAggregate::new(5, 2);
//! aggregate.votes_by_user.insert("ana".into(), json!("  ThUmBs_Up  "));
//!
//! let tx = compute_transaction(&aggregate, "ana", Vote::Down);
//! assert_eq!(tx.previous_vote, Vote::Up);
//! assert_eq!((tx.new_upvote_count, tx.new_downvote_count), (4, 3));
//! ```

mod aggregate;
mod normalize;
mod rules;
mod vote;

pub use aggregate::{compute_transaction, VoteAggregate, VoteTransaction};
pub use normalize::normalize_vote;
pub use rules::{check_vote_write, RuleViolation};
pub use vote::Vote;

/// Stored field holding the upvote counter.
pub const UPVOTE_COUNT_FIELD: &str = "upvoteCount";

/// Stored field holding the downvote counter.
pub const DOWNVOTE_COUNT_FIELD: &str = "downvoteCount";

/// Stored field holding the per-user raw vote map.
pub const VOTES_BY_USER_FIELD: &str = "votesByUser";

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn legacy_upvote_flipped_to_down() {
        let mut aggregate = VoteAggregate::new(5, 2);
        aggregate
            .votes_by_user
            .insert("u1".into(), json!("  ThUmBs_Up  "));

        let tx = compute_transaction(&aggregate, "u1", Vote::Down);
        assert_eq!(tx.previous_vote, Vote::Up);
        assert_eq!(tx.new_upvote_count, 4);
        assert_eq!(tx.new_downvote_count, 3);
        assert_eq!(tx.new_raw_value, Some(json!("down")));
    }

    #[test]
    fn clearing_a_missing_vote_is_a_noop() {
        let aggregate = VoteAggregate::new(5, 2);

        let tx = compute_transaction(&aggregate, "u1", Vote::None);
        assert_eq!(tx.previous_vote, Vote::None);
        assert!(tx.is_noop());
        assert_eq!((tx.new_upvote_count, tx.new_downvote_count), (5, 2));
        assert_eq!(tx.new_raw_value, None);
    }
}
