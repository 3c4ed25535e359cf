use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{
    choice::{Choice, ChoiceId},
    question::{Question, QuestionId},
};
use crate::tally::Tally;

/// A question as listed on the voter index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionSummary {
    pub id: QuestionId,
    pub text: String,
    pub publish_at: DateTime<Utc>,
    pub close_at: Option<DateTime<Utc>>,
    /// Whether votes are currently accepted.
    pub is_open: bool,
}

impl QuestionSummary {
    pub fn new(question: Question, now: DateTime<Utc>) -> Self {
        Self {
            is_open: question.is_open(now),
            id: question.id,
            text: question.text,
            publish_at: question.publish_at,
            close_at: question.close_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoiceView {
    pub id: ChoiceId,
    pub text: String,
    pub votes: u64,
}

impl From<Choice> for ChoiceView {
    fn from(choice: Choice) -> Self {
        Self {
            id: choice.id,
            text: choice.text,
            votes: choice.votes,
        }
    }
}

/// The detail view of a question, with its choices.
///
/// Re-sent with `error_message` set when a vote is rejected for its choice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionDetail {
    #[serde(flatten)]
    pub question: QuestionSummary,
    pub choices: Vec<ChoiceView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl QuestionDetail {
    pub fn new(question: Question, choices: Vec<Choice>, now: DateTime<Utc>) -> Self {
        Self {
            question: QuestionSummary::new(question, now),
            choices: choices.into_iter().map(ChoiceView::from).collect(),
            error_message: None,
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

/// The results view of a question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionResults {
    pub question: QuestionSummary,
    pub tally: Tally,
}

/// The vote form. The choice is kept raw so a malformed value can be
/// treated as no selection rather than rejected by the form parser.
#[derive(Debug, FromForm)]
pub struct VoteForm {
    pub choice: Option<String>,
}

impl VoteForm {
    /// The selected choice, if a well-formed one was submitted.
    pub fn choice_id(&self) -> Option<ChoiceId> {
        self.choice.as_deref()?.trim().parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vote_form_choice_id() {
        let form = |choice: Option<&str>| VoteForm {
            choice: choice.map(str::to_string),
        };
        assert_eq!(form(None).choice_id(), None);
        assert_eq!(form(Some("")).choice_id(), None);
        assert_eq!(form(Some(" 12 ")).choice_id(), Some(12));
        assert_eq!(form(Some("red")).choice_id(), None);
        assert_eq!(form(Some("-1")).choice_id(), None);
    }
}
