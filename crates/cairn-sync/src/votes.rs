//! Vote transactions against shared drop aggregates.
//!
//! Counters are only ever written from inside the document store's
//! transaction, so two users voting on the same drop at once cannot lose an
//! increment: the loser of the race re-reads and recomputes.

use crate::document::{DocRef, Document, DocumentStore};
use crate::error::{Error, Result};
use cairn_ledger::{compute_transaction, Vote, VoteAggregate};
use std::sync::Arc;
use tracing::{debug, info};

/// Drop documents carrying this flag no longer accept votes.
pub const DELETED_FIELD: &str = "deleted";

/// Result of a committed vote.
#[derive(Debug, Clone, PartialEq)]
pub struct VoteOutcome {
    /// Vote the user had before, after normalization
    pub previous_vote: Vote,
    /// Vote now stored
    pub vote: Vote,
    /// Aggregate as committed
    pub aggregate: VoteAggregate,
}

/// Runs vote transactions on drop documents.
#[derive(Clone)]
pub struct VoteTransactionRunner {
    documents: Arc<dyn DocumentStore>,
    collection: String,
}

impl VoteTransactionRunner {
    /// Votes on drops in `collection`.
    pub fn new(documents: Arc<dyn DocumentStore>, collection: impl Into<String>) -> Self {
        Self {
            documents,
            collection: collection.into(),
        }
    }

    /// Move `user_id`'s vote on `item_id` to `desired`.
    pub async fn vote(&self, item_id: &str, user_id: &str, desired: Vote) -> Result<VoteOutcome> {
        let doc = DocRef::new(self.collection.clone(), item_id);
        let mut previous = Vote::None;

        let committed = self
            .documents
            .run_transaction(&doc, &mut |current: Option<&Document>| {
                let current = match current {
                    Some(d) if !d.flag(DELETED_FIELD) => d,
                    _ => return Err(Error::ItemUnavailable(item_id.to_string())),
                };

                let aggregate = VoteAggregate::from_fields(&current.fields);
                let tx = compute_transaction(&aggregate, user_id, desired);
                previous = tx.previous_vote;

                let mut next = aggregate;
                next.apply(user_id, &tx);

                let mut fields = current.fields.clone();
                next.write_into(&mut fields);
                Ok(fields)
            })
            .await?;

        let aggregate = VoteAggregate::from_fields(&committed.fields);
        if previous == desired {
            debug!("Vote by {} on {} unchanged ({})", user_id, item_id, desired);
        } else {
            info!(
                "Vote by {} on {}: {} -> {} (up {}, down {})",
                user_id,
                item_id,
                previous,
                desired,
                aggregate.upvote_count,
                aggregate.downvote_count
            );
        }

        Ok(VoteOutcome {
            previous_vote: previous,
            vote: desired,
            aggregate,
        })
    }

    /// Current aggregate of a drop.
    pub async fn fetch_aggregate(&self, item_id: &str) -> Result<VoteAggregate> {
        let doc = DocRef::new(self.collection.clone(), item_id);
        match self.documents.get(&doc).await? {
            Some(d) if !d.flag(DELETED_FIELD) => Ok(VoteAggregate::from_fields(&d.fields)),
            _ => Err(Error::ItemUnavailable(item_id.to_string())),
        }
    }
}

/// Optimistic view of a vote that has not been confirmed yet.
///
/// Shows the expected aggregate right away and keeps the pre-vote state so
/// the caller can revert if the transaction fails.
#[derive(Debug, Clone)]
pub struct OptimisticVote {
    before: VoteAggregate,
    preview: VoteAggregate,
    desired: Vote,
}

impl OptimisticVote {
    /// Start an optimistic vote from the last known aggregate.
    pub fn begin(aggregate: &VoteAggregate, user_id: &str, desired: Vote) -> Self {
        let (_, preview) = aggregate.preview(user_id, desired);
        Self {
            before: aggregate.clone(),
            preview,
            desired,
        }
    }

    /// Aggregate to display while the vote is in flight.
    pub fn preview(&self) -> &VoteAggregate {
        &self.preview
    }

    /// Vote being applied.
    pub fn desired(&self) -> Vote {
        self.desired
    }

    /// Aggregate to settle on once the transaction finished.
    pub fn settle(self, result: &Result<VoteOutcome>) -> VoteAggregate {
        match result {
            Ok(outcome) => outcome.aggregate.clone(),
            Err(_) => self.rollback(),
        }
    }

    /// Pre-vote aggregate.
    pub fn rollback(self) -> VoteAggregate {
        self.before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Fields;
    use crate::memory::MemoryDocumentStore;
    use serde_json::json;

    fn drop_fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap_or_default()
    }

    fn setup() -> (Arc<MemoryDocumentStore>, VoteTransactionRunner) {
        let documents = Arc::new(MemoryDocumentStore::new().with_vote_rules("drops"));
        let runner = VoteTransactionRunner::new(documents.clone(), "drops");
        (documents, runner)
    }

    #[tokio::test]
    async fn legacy_vote_flips_both_counters() {
        let (documents, runner) = setup();
        documents.seed(
            &DocRef::new("drops", "d1"),
            drop_fields(json!({
                "text": "hi",
                "upvoteCount": 5,
                "downvoteCount": 2,
                "votesByUser": { "u1": "  ThUmBs_Up  " }
            })),
        );

        let outcome = runner.vote("d1", "u1", Vote::Down).await.unwrap();
        assert_eq!(outcome.previous_vote, Vote::Up);
        assert_eq!(outcome.aggregate.upvote_count, 4);
        assert_eq!(outcome.aggregate.downvote_count, 3);
        assert_eq!(outcome.aggregate.votes_by_user["u1"], json!("down"));

        let stored = documents.document(&DocRef::new("drops", "d1")).unwrap();
        assert_eq!(stored.fields["text"], json!("hi"));
    }

    #[tokio::test]
    async fn missing_or_deleted_drop_is_unavailable() {
        let (documents, runner) = setup();
        let err = runner.vote("nope", "u1", Vote::Up).await.unwrap_err();
        assert!(matches!(err, Error::ItemUnavailable(ref id) if id == "nope"));

        documents.seed(
            &DocRef::new("drops", "gone"),
            drop_fields(json!({ "deleted": true })),
        );
        let err = runner.vote("gone", "u1", Vote::Up).await.unwrap_err();
        assert!(matches!(err, Error::ItemUnavailable(_)));
        assert!(runner.fetch_aggregate("gone").await.is_err());
    }

    #[tokio::test]
    async fn retracting_a_vote_removes_the_entry() {
        let (documents, runner) = setup();
        documents.seed(
            &DocRef::new("drops", "d1"),
            drop_fields(json!({ "upvoteCount": 1, "votesByUser": { "u1": true } })),
        );

        let outcome = runner.vote("d1", "u1", Vote::None).await.unwrap();
        assert_eq!(outcome.previous_vote, Vote::Up);
        assert_eq!(outcome.aggregate.upvote_count, 0);
        assert!(outcome.aggregate.votes_by_user.get("u1").is_none());
    }

    #[tokio::test]
    async fn conflicts_are_retried() {
        let (documents, runner) = setup();
        documents.seed(&DocRef::new("drops", "d1"), Fields::new());
        documents.inject_conflicts(2);

        let outcome = runner.vote("d1", "u1", Vote::Up).await.unwrap();
        assert_eq!(outcome.aggregate.upvote_count, 1);
    }

    #[tokio::test]
    async fn optimistic_vote_rolls_back_on_failure() {
        let aggregate = VoteAggregate::new(3, 0);
        let optimistic = OptimisticVote::begin(&aggregate, "u1", Vote::Up);
        assert_eq!(optimistic.preview().upvote_count, 4);
        assert_eq!(optimistic.desired(), Vote::Up);

        let failed: Result<VoteOutcome> = Err(Error::ItemUnavailable("d1".into()));
        assert_eq!(optimistic.settle(&failed), aggregate);
    }
}
