//! The vote admission gate: every counter mutation caused by a voter passes
//! through here.

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::model::{
    choice::ChoiceId, mongodb::Id, question::QuestionId, receipt::VoterReceipt,
};
use crate::store::BallotStore;

/// Message shown when the vote form is submitted without a selection.
pub const NO_CHOICE_SELECTED: &str = "You didn't select a choice.";

/// A single attempt to vote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteRequest {
    pub question_id: QuestionId,
    /// `None` if the voter submitted without selecting anything.
    pub choice_id: Option<ChoiceId>,
    /// The voter's identity, if their session supplied one.
    pub voter_id: Option<Id>,
}

/// Acknowledgement of an accepted vote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteAccepted {
    pub question_id: QuestionId,
    pub choice_id: ChoiceId,
    /// The choice's count immediately after this vote.
    pub votes: u64,
}

/// Decides whether a vote may be counted, then counts it.
pub struct AdmissionGate<'a> {
    store: &'a dyn BallotStore,
    voter_tracking: bool,
}

impl<'a> AdmissionGate<'a> {
    /// With `voter_tracking`, every vote needs a voter identity and at most one
    /// vote per voter per question is accepted.
    pub fn new(store: &'a dyn BallotStore, voter_tracking: bool) -> Self {
        Self {
            store,
            voter_tracking,
        }
    }

    /// Admit the vote at the given instant. Every rejection leaves the store untouched.
    pub async fn admit(&self, request: VoteRequest, now: DateTime<Utc>) -> Result<VoteAccepted> {
        let VoteRequest {
            question_id,
            choice_id,
            voter_id,
        } = request;

        let question = self
            .store
            .question(question_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("Question {question_id}")))?;
        if !question.is_open(now) {
            return Err(Error::ElectionClosed(question_id));
        }

        let choice_id =
            choice_id.ok_or_else(|| Error::InvalidChoice(NO_CHOICE_SELECTED.to_string()))?;
        match self.store.choice(choice_id).await? {
            Some(choice) if choice.question_id == question_id => {}
            _ => {
                return Err(Error::InvalidChoice(format!(
                    "Choice {choice_id} is not an option for question {question_id}"
                )))
            }
        }

        let receipt = if self.voter_tracking {
            let voter_id = voter_id.ok_or_else(|| {
                Error::Unauthorized("a voter session is required to vote".to_string())
            })?;
            Some(VoterReceipt::new(voter_id, question_id, now))
        } else {
            None
        };

        let votes = self
            .store
            .record_vote(question_id, choice_id, receipt)
            .await?;
        debug!("Recorded vote for choice {choice_id} of question {question_id}, now {votes}");
        Ok(VoteAccepted {
            question_id,
            choice_id,
            votes,
        })
    }
}
