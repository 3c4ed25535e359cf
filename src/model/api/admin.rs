use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{
    choice::{Choice, ChoiceId},
    question::{NewQuestion, Question, QuestionId},
};

/// Raw admin credentials, received from a user. These are never stored,
/// since the password is in plaintext.
#[derive(Clone, Deserialize, Serialize)]
pub struct AdminCredentials {
    pub username: String,
    pub password: String,
}

/// A question to create, optionally with its initial choices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionSpec {
    pub text: String,
    pub publish_at: DateTime<Utc>,
    #[serde(default)]
    pub close_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub choices: Vec<String>,
}

impl QuestionSpec {
    /// Split into the question itself and the texts of its choices.
    pub fn into_parts(self) -> (NewQuestion, Vec<String>) {
        let question = NewQuestion {
            text: self.text,
            publish_at: self.publish_at,
            close_at: self.close_at,
        };
        (question, self.choices)
    }
}

/// A choice to add to an existing question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoiceSpec {
    pub text: String,
}

/// A question as listed for administrators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminQuestion {
    pub id: QuestionId,
    pub text: String,
    pub publish_at: DateTime<Utc>,
    pub close_at: Option<DateTime<Utc>>,
    pub was_published_recently: bool,
    pub choice_count: usize,
}

impl AdminQuestion {
    pub fn new(question: Question, choice_count: usize, now: DateTime<Utc>) -> Self {
        Self {
            was_published_recently: question.was_published_recently(now),
            id: question.id,
            text: question.text,
            publish_at: question.publish_at,
            close_at: question.close_at,
            choice_count,
        }
    }
}

/// A choice as listed for administrators, with its count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminChoice {
    pub id: ChoiceId,
    pub question_id: QuestionId,
    pub text: String,
    pub votes: u64,
}

impl From<Choice> for AdminChoice {
    fn from(choice: Choice) -> Self {
        Self {
            id: choice.id,
            question_id: choice.question_id,
            text: choice.text,
            votes: choice.votes,
        }
    }
}

/// Example data for tests.
#[cfg(test)]
mod examples {
    use chrono::Duration;

    use super::*;

    impl AdminCredentials {
        pub fn example() -> Self {
            Self {
                username: "returning-officer".into(),
                password: "ballotbox4lyfe".into(),
            }
        }

        pub fn empty() -> Self {
            Self {
                username: "".into(),
                password: "".into(),
            }
        }
    }

    impl QuestionSpec {
        /// "Best Color", published an hour ago, with two choices.
        pub fn example() -> Self {
            Self {
                text: "Best Color".into(),
                publish_at: Utc::now() - Duration::hours(1),
                close_at: None,
                choices: vec!["Red".into(), "Blue".into()],
            }
        }

        /// Voting finished yesterday.
        pub fn closed_example() -> Self {
            Self {
                text: "Best Season".into(),
                publish_at: Utc::now() - Duration::days(30),
                close_at: Some(Utc::now() - Duration::days(1)),
                choices: vec!["Summer".into(), "Winter".into()],
            }
        }

        /// Not yet published.
        pub fn future_example() -> Self {
            Self {
                text: "Best Planet".into(),
                publish_at: Utc::now() + Duration::days(1),
                close_at: None,
                choices: vec!["Earth".into(), "Mars".into()],
            }
        }
    }
}
