//! Durable storage for questions, choices, vote counters and voter receipts.
//!
//! Every backend guarantees that a single increment is applied exactly once
//! under arbitrary concurrent callers, and that a receipt and its increment
//! are applied together or not at all.

use std::ops::Deref;
use std::sync::Arc;

use rocket::{
    http::Status,
    request::{self, FromRequest, Request},
};

use crate::error::{Error, Result};
use crate::model::{
    choice::{Choice, ChoiceCount, ChoiceFilter, ChoiceId},
    mongodb::Id,
    question::{NewQuestion, Question, QuestionFilter, QuestionId, QuestionPatch},
    receipt::VoterReceipt,
};

mod memory;
mod mongo;

pub use memory::MemoryStore;
pub use mongo::MongoStore;

#[rocket::async_trait]
pub trait BallotStore: Send + Sync {
    /// Insert a new question with a freshly allocated ID.
    async fn create_question(&self, question: NewQuestion) -> Result<Question>;

    /// Correct a question's metadata.
    async fn update_question(&self, id: QuestionId, patch: QuestionPatch) -> Result<Question>;

    /// Delete a question along with its choices and receipts.
    async fn delete_question(&self, id: QuestionId) -> Result<()>;

    async fn question(&self, id: QuestionId) -> Result<Option<Question>>;

    /// Questions matching the filter, newest first.
    async fn list_questions(&self, filter: &QuestionFilter) -> Result<Vec<Question>>;

    /// Add a choice to a question that has no votes yet.
    async fn add_choice(&self, question_id: QuestionId, text: String) -> Result<Choice>;

    async fn choice(&self, id: ChoiceId) -> Result<Option<Choice>>;

    /// The choices of a question in ID order.
    async fn choices(&self, question_id: QuestionId) -> Result<Vec<Choice>>;

    /// Choices matching the filter in ID order.
    async fn list_choices(&self, filter: &ChoiceFilter) -> Result<Vec<Choice>>;

    /// Atomically add one vote to the choice, returning the new count.
    async fn increment_vote(&self, id: ChoiceId) -> Result<u64>;

    /// Atomically add one vote to a choice of the given question and, if
    /// given, store the receipt. Either both happen or neither does.
    async fn record_vote(
        &self,
        question_id: QuestionId,
        choice_id: ChoiceId,
        receipt: Option<VoterReceipt>,
    ) -> Result<u64>;

    async fn has_receipt(&self, voter_id: Id, question_id: QuestionId) -> Result<bool>;

    /// A point-in-time snapshot of a question's counts, in choice ID order.
    async fn read_counts(&self, question_id: QuestionId) -> Result<Vec<ChoiceCount>>;
}

/// Shared handle on the configured store, kept in Rocket's managed state.
#[derive(Clone)]
pub struct Ballots(Arc<dyn BallotStore>);

impl Ballots {
    pub fn new(store: impl BallotStore + 'static) -> Self {
        Self(Arc::new(store))
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryStore::new())
    }
}

impl Deref for Ballots {
    type Target = dyn BallotStore;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for Ballots {
    type Error = ();

    /// Get the store from the managed state.
    async fn from_request(req: &'r Request<'_>) -> request::Outcome<Self, Self::Error> {
        match req.rocket().state::<Ballots>() {
            Some(ballots) => request::Outcome::Success(ballots.clone()),
            None => {
                error!("No ballot store in managed state");
                request::Outcome::Failure((Status::InternalServerError, ()))
            }
        }
    }
}

/// Reject blank question and choice texts.
fn require_text(text: &str, what: &str) -> Result<()> {
    if text.trim().is_empty() {
        Err(Error::BadRequest(format!("{what} text must not be empty")))
    } else {
        Ok(())
    }
}

/// Behaviour every backend must share. Each backend's test module runs these.
#[cfg(test)]
pub(crate) mod conformance {
    use chrono::{Duration, Utc};
    use rocket::futures::future::join_all;

    use super::*;

    async fn best_color(store: &Ballots) -> (Question, Choice, Choice) {
        let question = store
            .create_question(NewQuestion::example())
            .await
            .unwrap();
        let red = store
            .add_choice(question.id, "Red".to_string())
            .await
            .unwrap();
        let blue = store
            .add_choice(question.id, "Blue".to_string())
            .await
            .unwrap();
        (question, red, blue)
    }

    fn counts(counts: &[ChoiceCount]) -> Vec<(&str, u64)> {
        counts.iter().map(|c| (c.text.as_str(), c.votes)).collect()
    }

    pub async fn ids_are_allocated_in_order(store: Ballots) {
        let first = store
            .create_question(NewQuestion::example())
            .await
            .unwrap();
        let second = store
            .create_question(NewQuestion::future_example())
            .await
            .unwrap();
        assert!(second.id > first.id);

        let a = store.add_choice(first.id, "A".to_string()).await.unwrap();
        let b = store.add_choice(second.id, "B".to_string()).await.unwrap();
        assert!(b.id > a.id);
        assert_eq!(a.votes, 0);
        assert_eq!(store.question(first.id).await.unwrap(), Some(first));
    }

    pub async fn add_choice_to_unknown_question(store: Ballots) {
        let result = store.add_choice(4040, "Nobody".to_string()).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
        let result = store.add_choice(4040, "  ".to_string()).await;
        assert!(result.is_err());
    }

    pub async fn increment_then_read(store: Ballots) {
        let (question, red, _) = best_color(&store).await;
        assert_eq!(store.increment_vote(red.id).await.unwrap(), 1);
        let snapshot = store.read_counts(question.id).await.unwrap();
        assert_eq!(counts(&snapshot), vec![("Red", 1), ("Blue", 0)]);
    }

    pub async fn increment_unknown_choice(store: Ballots) {
        let result = store.increment_vote(999).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    pub async fn concurrent_increments_are_not_lost(store: Ballots) {
        const VOTERS: usize = 64;
        let (question, red, _) = best_color(&store).await;
        let (question_id, red_id) = (question.id, red.id);

        let votes = (0..VOTERS).map(|_| {
            let store = store.clone();
            let receipt = VoterReceipt::new(Id::new(), question_id, Utc::now());
            rocket::tokio::spawn(async move {
                store.record_vote(question_id, red_id, Some(receipt)).await
            })
        });
        for result in join_all(votes).await {
            result.unwrap().unwrap();
        }

        let snapshot = store.read_counts(question.id).await.unwrap();
        assert_eq!(counts(&snapshot), vec![("Red", VOTERS as u64), ("Blue", 0)]);
    }

    pub async fn contended_votes_and_repeats(store: Ballots) {
        const VOTERS: usize = 96;
        let (question, red, blue) = best_color(&store).await;
        let question_id = question.id;

        // Every voter races a second ballot against their first.
        let votes = (0..VOTERS).flat_map(|_| {
            let voter = Id::new();
            [red.id, blue.id].map(|choice_id| {
                let store = store.clone();
                let receipt = VoterReceipt::new(voter, question_id, Utc::now());
                rocket::tokio::spawn(async move {
                    store.record_vote(question_id, choice_id, Some(receipt)).await
                })
            })
        });
        let mut accepted = 0;
        let mut duplicates = 0;
        for result in join_all(votes).await {
            match result.unwrap() {
                Ok(_) => accepted += 1,
                Err(Error::DuplicateVote(id)) if id == question_id => duplicates += 1,
                Err(e) => panic!("vote failed under contention: {e}"),
            }
        }
        assert_eq!((accepted, duplicates), (VOTERS, VOTERS));

        let snapshot = store.read_counts(question_id).await.unwrap();
        let total: u64 = snapshot.iter().map(|c| c.votes).sum();
        assert_eq!(total, VOTERS as u64);
    }

    pub async fn duplicate_receipt_is_rejected(store: Ballots) {
        let (question, red, blue) = best_color(&store).await;
        let voter = Id::new();

        let receipt = VoterReceipt::new(voter, question.id, Utc::now());
        store
            .record_vote(question.id, red.id, Some(receipt.clone()))
            .await
            .unwrap();
        assert!(store.has_receipt(voter, question.id).await.unwrap());

        let result = store.record_vote(question.id, blue.id, Some(receipt)).await;
        assert!(matches!(result, Err(Error::DuplicateVote(id)) if id == question.id));

        let snapshot = store.read_counts(question.id).await.unwrap();
        assert_eq!(counts(&snapshot), vec![("Red", 1), ("Blue", 0)]);
    }

    pub async fn foreign_choice_is_rejected(store: Ballots) {
        let (question, _, _) = best_color(&store).await;
        let (other, other_red, _) = best_color(&store).await;
        let voter = Id::new();

        let receipt = VoterReceipt::new(voter, question.id, Utc::now());
        let result = store
            .record_vote(question.id, other_red.id, Some(receipt))
            .await;
        assert!(matches!(result, Err(Error::InvalidChoice(_))));

        // No receipt was left behind and nothing was counted.
        assert!(!store.has_receipt(voter, question.id).await.unwrap());
        let snapshot = store.read_counts(other.id).await.unwrap();
        assert_eq!(counts(&snapshot), vec![("Red", 0), ("Blue", 0)]);
    }

    pub async fn choices_locked_once_voted(store: Ballots) {
        let (question, red, _) = best_color(&store).await;
        store.record_vote(question.id, red.id, None).await.unwrap();
        let result = store.add_choice(question.id, "Green".to_string()).await;
        assert!(matches!(result, Err(Error::BallotLocked(_))));
        assert_eq!(store.choices(question.id).await.unwrap().len(), 2);
    }

    pub async fn delete_cascades(store: Ballots) {
        let (question, red, blue) = best_color(&store).await;
        let (survivor, _, _) = best_color(&store).await;
        let voter = Id::new();
        let receipt = VoterReceipt::new(voter, question.id, Utc::now());
        store
            .record_vote(question.id, red.id, Some(receipt))
            .await
            .unwrap();

        store.delete_question(question.id).await.unwrap();

        assert_eq!(store.question(question.id).await.unwrap(), None);
        assert_eq!(store.choice(red.id).await.unwrap(), None);
        assert_eq!(store.choice(blue.id).await.unwrap(), None);
        assert!(matches!(
            store.read_counts(question.id).await,
            Err(Error::NotFound(_))
        ));
        assert!(!store.has_receipt(voter, question.id).await.unwrap());
        assert_eq!(store.choices(survivor.id).await.unwrap().len(), 2);

        let result = store.delete_question(question.id).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    pub async fn update_and_list(store: Ballots) {
        let now = Utc::now();
        let current = store
            .create_question(NewQuestion::example())
            .await
            .unwrap();
        store
            .create_question(NewQuestion::future_example())
            .await
            .unwrap();
        let closed = store
            .create_question(NewQuestion::closed_example())
            .await
            .unwrap();

        let patch = QuestionPatch {
            text: Some("Best Colour".to_string()),
            ..Default::default()
        };
        let updated = store.update_question(current.id, patch).await.unwrap();
        assert_eq!(updated.text, "Best Colour");
        assert_eq!(updated.publish_at, current.publish_at);

        let published = store
            .list_questions(&QuestionFilter::latest_published(now))
            .await
            .unwrap();
        let ids: Vec<_> = published.iter().map(|q| q.id).collect();
        assert_eq!(ids, vec![current.id, closed.id]);

        let search = QuestionFilter {
            search: Some("colour".to_string()),
            ..Default::default()
        };
        let found = store.list_questions(&search).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, current.id);

        let result = store
            .update_question(4040, QuestionPatch::default())
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    pub async fn list_choices_filters(store: Ballots) {
        let (question, _, _) = best_color(&store).await;
        best_color(&store).await;

        let all = store.list_choices(&ChoiceFilter::default()).await.unwrap();
        assert_eq!(all.len(), 4);

        let filter = ChoiceFilter {
            question_id: Some(question.id),
            search: Some("re".to_string()),
        };
        let reds = store.list_choices(&filter).await.unwrap();
        assert_eq!(reds.len(), 1);
        assert_eq!(reds[0].text, "Red");
    }

    pub async fn latest_published_is_capped(store: Ballots) {
        let now = Utc::now();
        for hours in 1..=7 {
            let question = NewQuestion {
                text: format!("Question {hours}"),
                publish_at: now - Duration::hours(hours),
                close_at: None,
            };
            store.create_question(question).await.unwrap();
        }
        let latest = store
            .list_questions(&QuestionFilter::latest_published(now))
            .await
            .unwrap();
        let texts: Vec<_> = latest.iter().map(|q| q.text.as_str()).collect();
        assert_eq!(
            texts,
            vec!["Question 1", "Question 2", "Question 3", "Question 4", "Question 5"]
        );
    }
}
