use mongodb::{
    bson::doc,
    error::Error as DbError,
    options::{FindOneAndUpdateOptions, ReturnDocument, UpdateOptions},
};
use rocket::http::Status;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::mongodb::Coll;

/// ID of the counter that allocates question IDs.
pub const QUESTION_ID_COUNTER_ID: &str = "question_id";

/// ID of the counter that allocates choice IDs.
pub const CHOICE_ID_COUNTER_ID: &str = "choice_id";

/// A counter object used to implement auto-increment fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Counter {
    #[serde(rename = "_id")]
    pub id: String,
    pub next: u32,
}

impl Counter {
    /// Atomically retrieve the next value of the counter with the given ID.
    pub async fn next(counters: &Coll<Counter>, id: &str) -> Result<u32> {
        let update = doc! {
            "$inc": { "next": 1 }
        };
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::Before)
            .build();
        let counter = counters
            .find_one_and_update(doc! { "_id": id }, update, options)
            .await?;
        Self::value_or_missing(counter, id)
    }

    fn value_or_missing(counter: Option<Counter>, id: &str) -> Result<u32> {
        counter.map(|c| c.next).ok_or_else(|| {
            Error::Status(
                Status::InternalServerError,
                format!("Failed to find counter with ID {}", id),
            )
        })
    }
}

/// Ensure the ID counters exist, starting at 1.
///
/// This operation is idempotent and never resets an existing counter.
pub async fn ensure_id_counters_exist(counters: &Coll<Counter>) -> std::result::Result<(), DbError> {
    let upsert = UpdateOptions::builder().upsert(true).build();
    for id in [QUESTION_ID_COUNTER_ID, CHOICE_ID_COUNTER_ID] {
        let update = doc! {
            "$setOnInsert": { "next": 1 }
        };
        counters
            .update_one(doc! { "_id": id }, update, upsert.clone())
            .await?;
    }
    Ok(())
}
