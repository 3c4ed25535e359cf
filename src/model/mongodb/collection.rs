use std::ops::Deref;

use mongodb::{
    bson::doc, error::Error as DbError, options::IndexOptions, Collection, Database, IndexModel,
};

use crate::model::{choice::Choice, question::Question, receipt::VoterReceipt};

use super::counter::Counter;

/// A type that can be directly inserted/read to/from the database.
pub trait MongoCollection {
    /// The name of the collection.
    const NAME: &'static str;
}

/// A database collection of the given type.
pub struct Coll<T>(Collection<T>);

impl<T> Coll<T>
where
    T: MongoCollection,
{
    /// Get a handle on this collection in the given database.
    pub fn from_db(db: &Database) -> Self {
        Self(db.collection(T::NAME))
    }
}

// `Derive(Clone)` would only derive if `T: Clone`, but we don't need that bound.
impl<T> Clone for Coll<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Deref for Coll<T> {
    type Target = Collection<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl MongoCollection for Question {
    const NAME: &'static str = "questions";
}

impl MongoCollection for Choice {
    const NAME: &'static str = "choices";
}

impl MongoCollection for VoterReceipt {
    const NAME: &'static str = "receipts";
}

impl MongoCollection for Counter {
    const NAME: &'static str = "counters";
}

/// Ensure that all the required indexes exist on the given database.
///
/// This operation is idempotent.
pub async fn ensure_indexes_exist(db: &Database) -> Result<(), DbError> {
    debug!("Ensuring collection indexes exist");

    // At most one receipt per voter per question.
    let receipt_index = IndexModel::builder()
        .keys(doc! {"voter_id": 1, "question_id": 1})
        .options(IndexOptions::builder().unique(true).build())
        .build();
    Coll::<VoterReceipt>::from_db(db)
        .create_index(receipt_index, None)
        .await?;

    // Choices are always fetched by their owning question.
    let choice_index = IndexModel::builder()
        .keys(doc! {"question_id": 1})
        .build();
    Coll::<Choice>::from_db(db)
        .create_index(choice_index, None)
        .await?;

    // Listings are newest first.
    let question_index = IndexModel::builder()
        .keys(doc! {"publish_at": -1})
        .build();
    Coll::<Question>::from_db(db)
        .create_index(question_index, None)
        .await?;

    Ok(())
}
