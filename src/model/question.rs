use chrono::{DateTime, Duration, Utc};
use mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime;
use serde::{Deserialize, Serialize};

use crate::model::mongodb::optional_datetime;

pub type QuestionId = u32;

/// How long after publication a question still counts as recent.
pub fn recent_window() -> Duration {
    Duration::days(1)
}

/// A single ballot item, as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    #[serde(rename = "_id")]
    pub id: QuestionId,
    /// The question text shown to voters.
    pub text: String,
    /// When the question becomes visible and voting opens.
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub publish_at: DateTime<Utc>,
    /// When voting closes. Open indefinitely if absent.
    #[serde(default, with = "optional_datetime")]
    pub close_at: Option<DateTime<Utc>>,
}

impl Question {
    /// Is this question visible to voters at `now`?
    pub fn is_published(&self, now: DateTime<Utc>) -> bool {
        self.publish_at <= now
    }

    /// Is voting allowed at `now`?
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.is_published(now) && self.close_at.map_or(true, |close_at| now < close_at)
    }

    /// Was this question published within the last day? Future questions are not recent.
    pub fn was_published_recently(&self, now: DateTime<Utc>) -> bool {
        now - recent_window() <= self.publish_at && self.publish_at <= now
    }

    /// Apply an administrator's metadata correction.
    pub fn apply(&mut self, patch: QuestionPatch) {
        if let Some(text) = patch.text {
            self.text = text;
        }
        if let Some(publish_at) = patch.publish_at {
            self.publish_at = publish_at;
        }
        if let Some(close_at) = patch.close_at {
            self.close_at = close_at;
        }
    }
}

/// The data needed to create a question; the store assigns the ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewQuestion {
    pub text: String,
    pub publish_at: DateTime<Utc>,
    #[serde(default)]
    pub close_at: Option<DateTime<Utc>>,
}

impl NewQuestion {
    pub fn with_id(self, id: QuestionId) -> Question {
        Question {
            id,
            text: self.text,
            publish_at: self.publish_at,
            close_at: self.close_at,
        }
    }
}

/// A metadata correction. Absent fields are left unchanged; `close_at: Some(None)`
/// reopens the question indefinitely.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionPatch {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub publish_at: Option<DateTime<Utc>>,
    #[serde(default, with = "double_option")]
    pub close_at: Option<Option<DateTime<Utc>>>,
}

/// Distinguish a missing field from an explicit `null`.
mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<T: Serialize, S: Serializer>(
        value: &Option<Option<T>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, T: Deserialize<'de>, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Option<T>>, D::Error> {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

/// Admin listing filter.
#[derive(Debug, Clone, Default)]
pub struct QuestionFilter {
    /// Case-insensitive substring of the question text.
    pub search: Option<String>,
    /// Only questions published at or before this instant.
    pub published_before: Option<DateTime<Utc>>,
    /// Maximum number of results.
    pub limit: Option<usize>,
}

impl QuestionFilter {
    /// The voter-facing index: the latest five published questions.
    pub fn latest_published(now: DateTime<Utc>) -> Self {
        Self {
            search: None,
            published_before: Some(now),
            limit: Some(5),
        }
    }

    pub fn matches(&self, question: &Question) -> bool {
        let text_matches = self.search.as_ref().map_or(true, |search| {
            question.text.to_lowercase().contains(&search.to_lowercase())
        });
        let published = self
            .published_before
            .map_or(true, |before| question.publish_at <= before);
        text_matches && published
    }
}

#[cfg(test)]
mod examples {
    use super::*;

    impl NewQuestion {
        /// A question that opened an hour ago and never closes.
        pub fn example() -> Self {
            Self {
                text: "Best Color".to_string(),
                publish_at: Utc::now() - Duration::hours(1),
                close_at: None,
            }
        }

        /// A question that opens tomorrow.
        pub fn future_example() -> Self {
            Self {
                text: "Next Term's Council President".to_string(),
                publish_at: Utc::now() + Duration::days(1),
                close_at: None,
            }
        }

        /// A question whose voting window has passed.
        pub fn closed_example() -> Self {
            Self {
                text: "Last Year's Mascot".to_string(),
                publish_at: Utc::now() - Duration::days(30),
                close_at: Some(Utc::now() - Duration::days(1)),
            }
        }
    }
}
