//! Write rules for aggregate documents.
//!
//! The remote store only accepts an aggregate write when it is exactly what
//! [`compute_transaction`] would have produced for the writing user. A flip
//! that bumps one counter without the other, or a write touching another
//! user's entry, is rejected.

use crate::aggregate::{compute_transaction, VoteAggregate};
use crate::normalize::normalize_vote;
use crate::vote::Vote;
use thiserror::Error;

/// Reasons an aggregate write is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleViolation {
    /// The write changed a vote entry belonging to someone else.
    #[error("write by {writer} modified the vote entry of {owner}")]
    ForeignEntry { writer: String, owner: String },

    /// The writer stored a value that is not a canonical vote.
    #[error("vote entry for {user} is not canonical: {value}")]
    NonCanonicalEntry { user: String, value: String },

    /// A counter did not move by the amount the vote change implies.
    #[error("{counter} moved from {before} to {after}, expected {expected}")]
    CounterMismatch {
        counter: &'static str,
        before: u64,
        after: u64,
        expected: u64,
    },
}

/// Check that `after` is a valid successor of `before` for a write by `user_id`.
pub fn check_vote_write(
    before: &VoteAggregate,
    after: &VoteAggregate,
    user_id: &str,
) -> Result<(), RuleViolation> {
    let owners = before
        .votes_by_user
        .keys()
        .chain(after.votes_by_user.keys())
        .filter(|owner| owner.as_str() != user_id);
    for owner in owners {
        if before.votes_by_user.get(owner) != after.votes_by_user.get(owner) {
            return Err(RuleViolation::ForeignEntry {
                writer: user_id.to_string(),
                owner: owner.clone(),
            });
        }
    }

    let before_entry = before.votes_by_user.get(user_id);
    let after_entry = after.votes_by_user.get(user_id);
    if let Some(value) = after_entry {
        if before_entry != Some(value) && !Vote::is_canonical(value) {
            return Err(RuleViolation::NonCanonicalEntry {
                user: user_id.to_string(),
                value: value.to_string(),
            });
        }
    }

    let desired = after_entry.map(normalize_vote).unwrap_or(Vote::None);
    let expected = compute_transaction(before, user_id, desired);
    check_counter(
        "upvoteCount",
        before.upvote_count,
        after.upvote_count,
        expected.new_upvote_count,
    )?;
    check_counter(
        "downvoteCount",
        before.downvote_count,
        after.downvote_count,
        expected.new_downvote_count,
    )
}

fn check_counter(
    counter: &'static str,
    before: u64,
    after: u64,
    expected: u64,
) -> Result<(), RuleViolation> {
    if after == expected {
        Ok(())
    } else {
        Err(RuleViolation::CounterMismatch {
            counter,
            before,
            after,
            expected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> VoteAggregate {
        let mut aggregate = VoteAggregate::new(5, 2);
        aggregate.votes_by_user.insert("writer".into(), json!("up"));
        aggregate.votes_by_user.insert("other".into(), json!(-1));
        aggregate
    }

    #[test]
    fn computed_transactions_pass() {
        let before = base();
        for desired in Vote::ALL {
            let (_, after) = before.preview("writer", desired);
            assert_eq!(check_vote_write(&before, &after, "writer"), Ok(()));
        }
    }

    #[test]
    fn single_counter_flip_is_rejected() {
        let before = base();
        let mut after = before.clone();
        after.votes_by_user.insert("writer".into(), json!("down"));
        after.downvote_count += 1;

        let err = check_vote_write(&before, &after, "writer").unwrap_err();
        assert_eq!(
            err,
            RuleViolation::CounterMismatch {
                counter: "upvoteCount",
                before: 5,
                after: 5,
                expected: 4,
            }
        );
    }

    #[test]
    fn touching_another_users_entry_is_rejected() {
        let before = base();
        let mut after = before.clone();
        after.votes_by_user.remove("other");
        after.downvote_count -= 1;

        assert!(matches!(
            check_vote_write(&before, &after, "writer"),
            Err(RuleViolation::ForeignEntry { .. })
        ));
    }

    #[test]
    fn non_canonical_write_is_rejected() {
        let before = VoteAggregate::new(0, 0);
        let mut after = before.clone();
        after.votes_by_user.insert("writer".into(), json!(true));
        after.upvote_count = 1;

        assert!(matches!(
            check_vote_write(&before, &after, "writer"),
            Err(RuleViolation::NonCanonicalEntry { .. })
        ));
    }

    #[test]
    fn clamped_decrement_is_accepted() {
        let mut before = VoteAggregate::new(0, 0);
        before.votes_by_user.insert("writer".into(), json!("down"));
        let (_, after) = before.preview("writer", Vote::None);

        assert_eq!(after.downvote_count, 0);
        assert_eq!(check_vote_write(&before, &after, "writer"), Ok(()));
        assert!(after.votes_by_user.get("writer").is_none());
    }
}
