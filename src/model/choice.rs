use serde::{Deserialize, Serialize};

use crate::model::question::QuestionId;

pub type ChoiceId = u32;

/// A selectable option under a question, carrying its vote counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    #[serde(rename = "_id")]
    pub id: ChoiceId,
    /// Foreign Key question ID.
    pub question_id: QuestionId,
    pub text: String,
    /// Only ever incremented, and only by the store.
    pub votes: u64,
}

impl Choice {
    /// A fresh choice with no votes.
    pub fn new(id: ChoiceId, question_id: QuestionId, text: String) -> Self {
        Self {
            id,
            question_id,
            text,
            votes: 0,
        }
    }
}

/// One row of a tally snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoiceCount {
    pub choice_id: ChoiceId,
    pub text: String,
    pub votes: u64,
}

impl From<Choice> for ChoiceCount {
    fn from(choice: Choice) -> Self {
        Self {
            choice_id: choice.id,
            text: choice.text,
            votes: choice.votes,
        }
    }
}

/// Admin listing filter.
#[derive(Debug, Clone, Default)]
pub struct ChoiceFilter {
    pub question_id: Option<QuestionId>,
    /// Case-insensitive substring of the choice text.
    pub search: Option<String>,
}

impl ChoiceFilter {
    pub fn matches(&self, choice: &Choice) -> bool {
        self.question_id.map_or(true, |id| choice.question_id == id)
            && self.search.as_ref().map_or(true, |search| {
                choice.text.to_lowercase().contains(&search.to_lowercase())
            })
    }
}
