use chrono::{DateTime, Utc};
use mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime;
use serde::{Deserialize, Serialize};

use crate::model::{mongodb::Id, question::QuestionId};

/// Proof that a voter has already voted on a question.
/// Deliberately records nothing about which choice they picked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoterReceipt {
    pub voter_id: Id,
    pub question_id: QuestionId,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub cast_at: DateTime<Utc>,
}

impl VoterReceipt {
    pub fn new(voter_id: Id, question_id: QuestionId, cast_at: DateTime<Utc>) -> Self {
        Self {
            voter_id,
            question_id,
            cast_at,
        }
    }

    /// The uniqueness key.
    pub fn key(&self) -> (Id, QuestionId) {
        (self.voter_id, self.question_id)
    }
}
