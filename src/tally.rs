//! Read-only aggregate views of a question's votes.
//!
//! A tally is always computed from a single snapshot taken by the store, so
//! it never reflects half of a vote: a receipt and its increment are seen
//! together or not at all.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{
    choice::{ChoiceCount, ChoiceId},
    question::QuestionId,
};
use crate::store::BallotStore;

/// Aggregate counts for one question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub question_id: QuestionId,
    /// Per-choice counts in choice ID order.
    pub counts: Vec<ChoiceCount>,
    pub total_votes: u64,
    /// The choice(s) with the most votes. Empty until a vote is cast; every
    /// tied choice is listed.
    pub leading: Vec<ChoiceId>,
}

impl Tally {
    /// Read a consistent tally. Fails with `NotFound` for an unknown question.
    pub async fn read(store: &dyn BallotStore, question_id: QuestionId) -> Result<Self> {
        let counts = store.read_counts(question_id).await?;
        Ok(Self::from_counts(question_id, counts))
    }

    pub fn from_counts(question_id: QuestionId, counts: Vec<ChoiceCount>) -> Self {
        let total_votes = counts.iter().map(|count| count.votes).sum();
        let max = counts.iter().map(|count| count.votes).max().unwrap_or(0);
        let leading = if max == 0 {
            Vec::new()
        } else {
            counts
                .iter()
                .filter(|count| count.votes == max)
                .map(|count| count.choice_id)
                .collect()
        };
        Self {
            question_id,
            counts,
            total_votes,
            leading,
        }
    }

    /// The ordered `(choice text, count)` pairs shown on the results page.
    pub fn pairs(&self) -> Vec<(&str, u64)> {
        self.counts
            .iter()
            .map(|count| (count.text.as_str(), count.votes))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::model::question::NewQuestion;
    use crate::store::Ballots;

    fn count(choice_id: ChoiceId, text: &str, votes: u64) -> ChoiceCount {
        ChoiceCount {
            choice_id,
            text: text.to_string(),
            votes,
        }
    }

    #[test]
    fn no_votes_has_no_leader() {
        let tally = Tally::from_counts(1, vec![count(1, "Red", 0), count(2, "Blue", 0)]);
        assert_eq!(tally.total_votes, 0);
        assert!(tally.leading.is_empty());
    }

    #[test]
    fn ties_list_every_leader() {
        let tally = Tally::from_counts(
            1,
            vec![count(1, "Red", 3), count(2, "Blue", 1), count(3, "Green", 3)],
        );
        assert_eq!(tally.total_votes, 7);
        assert_eq!(tally.leading, vec![1, 3]);
        assert_eq!(tally.pairs(), vec![("Red", 3), ("Blue", 1), ("Green", 3)]);
    }

    #[test]
    fn question_without_choices() {
        let tally = Tally::from_counts(1, Vec::new());
        assert_eq!(tally.total_votes, 0);
        assert!(tally.leading.is_empty());
    }

    #[rocket::async_test]
    async fn read_from_store() {
        let store = Ballots::in_memory();
        let question = store
            .create_question(NewQuestion::example())
            .await
            .unwrap();
        let red = store.add_choice(question.id, "Red".into()).await.unwrap();
        store.add_choice(question.id, "Blue".into()).await.unwrap();
        store.increment_vote(red.id).await.unwrap();

        let tally = Tally::read(&*store, question.id).await.unwrap();
        assert_eq!(tally.pairs(), vec![("Red", 1), ("Blue", 0)]);
        assert_eq!(tally.leading, vec![red.id]);

        let missing = Tally::read(&*store, question.id + 1).await;
        assert!(matches!(missing, Err(Error::NotFound(_))));
    }
}
