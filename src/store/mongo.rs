use mongodb::{
    bson::{doc, Bson, DateTime as BsonDateTime, Document},
    error::Error as DbError,
    options::{FindOneAndUpdateOptions, FindOptions, ReturnDocument, SessionOptions},
    Client, ClientSession, Database,
};
use std::time::{Duration, Instant};

use rand::Rng;
use rocket::{
    futures::{
        future::{BoxFuture, FutureExt},
        TryStreamExt,
    },
    tokio::time::sleep,
};

use crate::error::{Error, Result};
use crate::model::{
    choice::{Choice, ChoiceCount, ChoiceFilter, ChoiceId},
    mongodb::{
        ensure_id_counters_exist, ensure_indexes_exist, is_duplicate_key_error,
        is_transient_transaction_error, is_unknown_commit_result, u32_id_filter, Coll, Counter,
        Id, CHOICE_ID_COUNTER_ID, QUESTION_ID_COUNTER_ID,
    },
    question::{NewQuestion, Question, QuestionFilter, QuestionId, QuestionPatch},
    receipt::VoterReceipt,
};

use super::{require_text, BallotStore};

/// How long a transaction keeps retrying transient failures before giving up.
/// Matches the driver's own convenient-transaction limit.
const TRANSACTION_TIME_LIMIT: Duration = Duration::from_secs(120);

/// Upper bound on the random delay between transaction attempts.
const MAX_BACKOFF: Duration = Duration::from_millis(500);

/// A MongoDB-backed store. Needs a replica set, since votes with receipts
/// and cascading deletes run as multi-document transactions.
pub struct MongoStore {
    client: Client,
    questions: Coll<Question>,
    choices: Coll<Choice>,
    receipts: Coll<VoterReceipt>,
    counters: Coll<Counter>,
}

impl MongoStore {
    /// Wrap the given database. Call [`MongoStore::prepare`] first.
    pub fn new(client: Client, db: &Database) -> Self {
        Self {
            client,
            questions: Coll::from_db(db),
            choices: Coll::from_db(db),
            receipts: Coll::from_db(db),
            counters: Coll::from_db(db),
        }
    }

    /// Ensure the indexes and ID counters exist.
    ///
    /// This operation is idempotent.
    pub async fn prepare(db: &Database) -> std::result::Result<(), DbError> {
        ensure_indexes_exist(db).await?;
        ensure_id_counters_exist(&Coll::from_db(db)).await
    }

    /// Run `body` inside a transaction, retrying the whole transaction on
    /// transient errors until [`TRANSACTION_TIME_LIMIT`] has passed. Errors from
    /// `body` other than database errors abort the transaction and are returned as-is.
    async fn with_transaction<T, F>(&self, mut body: F) -> Result<T>
    where
        F: for<'s> FnMut(&'s mut ClientSession) -> BoxFuture<'s, Result<T>> + Send,
        T: Send,
    {
        let started = Instant::now();
        let mut session = self.client.start_session(None).await?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            session.start_transaction(None).await?;
            let err = match body(&mut session).await {
                Ok(value) => match commit(&mut session, started).await {
                    Ok(()) => return Ok(value),
                    Err(e) => e,
                },
                Err(Error::Db(e)) => {
                    abort(&mut session).await;
                    e
                }
                Err(e) => {
                    abort(&mut session).await;
                    return Err(e);
                }
            };
            if is_transient_transaction_error(&err) && started.elapsed() < TRANSACTION_TIME_LIMIT {
                // Contended votes on one choice conflict in bursts; spread the retries out.
                let delay = backoff(attempt);
                warn!("Transient transaction failure (attempt {attempt}), retrying in {delay:?}: {err}");
                sleep(delay).await;
                continue;
            }
            error!("Transaction failed after {attempt} attempts: {err}");
            return Err(err.into());
        }
    }

    async fn require_question(&self, id: QuestionId) -> Result<Question> {
        self.questions
            .find_one(u32_id_filter(id), None)
            .await?
            .ok_or_else(|| Error::not_found(format!("Question {id}")))
    }

    /// Insert the receipt, then count the vote. Runs inside a transaction.
    async fn vote_with_receipt(
        questions: Coll<Question>,
        choices: Coll<Choice>,
        receipts: Coll<VoterReceipt>,
        receipt: VoterReceipt,
        choice_id: ChoiceId,
        session: &mut ClientSession,
    ) -> Result<u64> {
        let question_id = receipt.question_id;
        questions
            .find_one_with_session(u32_id_filter(question_id), None, session)
            .await?
            .ok_or_else(|| Error::not_found(format!("Question {question_id}")))?;

        // The receipt goes first, so a duplicate fails before anything is counted.
        if let Err(e) = receipts
            .insert_one_with_session(&receipt, None, session)
            .await
        {
            return Err(if is_duplicate_key_error(&e) {
                Error::DuplicateVote(question_id)
            } else {
                e.into()
            });
        }

        choices
            .find_one_and_update_with_session(
                doc! { "_id": choice_id, "question_id": question_id },
                doc! { "$inc": { "votes": 1 } },
                return_updated(),
                session,
            )
            .await?
            .map(|choice| choice.votes)
            .ok_or_else(|| foreign_choice(choice_id, question_id))
    }
}

/// A random delay before the given retry, doubling its range with each attempt.
fn backoff(attempt: u32) -> Duration {
    let ceiling = Duration::from_millis(5)
        .saturating_mul(1 << attempt.min(16))
        .min(MAX_BACKOFF);
    let millis = ceiling.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
}

/// Commit, retrying the commit alone while its result is unknown.
async fn commit(
    session: &mut ClientSession,
    started: Instant,
) -> std::result::Result<(), DbError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match session.commit_transaction().await {
            Err(e)
                if is_unknown_commit_result(&e) && started.elapsed() < TRANSACTION_TIME_LIMIT =>
            {
                warn!("Unknown commit result (attempt {attempt}), retrying commit: {e}");
            }
            result => return result,
        }
    }
}

async fn abort(session: &mut ClientSession) {
    if let Err(e) = session.abort_transaction().await {
        debug!("Transaction abort failed, server will time it out: {e}");
    }
}

fn return_updated() -> FindOneAndUpdateOptions {
    FindOneAndUpdateOptions::builder()
        .return_document(ReturnDocument::After)
        .build()
}

fn foreign_choice(choice_id: ChoiceId, question_id: QuestionId) -> Error {
    Error::InvalidChoice(format!(
        "Choice {choice_id} does not belong to question {question_id}"
    ))
}

/// Case-insensitive substring match.
fn contains(search: &str) -> Document {
    doc! {
        "$regex": escape_regex(search),
        "$options": "i",
    }
}

fn escape_regex(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if "\\.^$|?*+()[]{}".contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn question_filter(filter: &QuestionFilter) -> Document {
    let mut query = Document::new();
    if let Some(ref search) = filter.search {
        query.insert("text", contains(search));
    }
    if let Some(before) = filter.published_before {
        query.insert(
            "publish_at",
            doc! { "$lte": BsonDateTime::from_chrono(before) },
        );
    }
    query
}

fn choice_filter(filter: &ChoiceFilter) -> Document {
    let mut query = Document::new();
    if let Some(question_id) = filter.question_id {
        query.insert("question_id", question_id);
    }
    if let Some(ref search) = filter.search {
        query.insert("text", contains(search));
    }
    query
}

fn patch_update(patch: QuestionPatch) -> Document {
    let mut set = Document::new();
    if let Some(text) = patch.text {
        set.insert("text", text);
    }
    if let Some(publish_at) = patch.publish_at {
        set.insert("publish_at", BsonDateTime::from_chrono(publish_at));
    }
    match patch.close_at {
        Some(Some(close_at)) => {
            set.insert("close_at", BsonDateTime::from_chrono(close_at));
        }
        Some(None) => {
            set.insert("close_at", Bson::Null);
        }
        None => {}
    }
    set
}

#[rocket::async_trait]
impl BallotStore for MongoStore {
    async fn create_question(&self, question: NewQuestion) -> Result<Question> {
        require_text(&question.text, "Question")?;
        let id = Counter::next(&self.counters, QUESTION_ID_COUNTER_ID).await?;
        let question = question.with_id(id);
        self.questions.insert_one(&question, None).await?;
        Ok(question)
    }

    async fn update_question(&self, id: QuestionId, patch: QuestionPatch) -> Result<Question> {
        if let Some(ref text) = patch.text {
            require_text(text, "Question")?;
        }
        let set = patch_update(patch);
        if set.is_empty() {
            return self.require_question(id).await;
        }
        self.questions
            .find_one_and_update(u32_id_filter(id), doc! { "$set": set }, return_updated())
            .await?
            .ok_or_else(|| Error::not_found(format!("Question {id}")))
    }

    async fn delete_question(&self, id: QuestionId) -> Result<()> {
        let (questions, choices, receipts) = (
            self.questions.clone(),
            self.choices.clone(),
            self.receipts.clone(),
        );
        self.with_transaction(move |session| {
            let (questions, choices, receipts) =
                (questions.clone(), choices.clone(), receipts.clone());
            async move {
                let result = questions
                    .delete_one_with_session(u32_id_filter(id), None, session)
                    .await?;
                if result.deleted_count == 0 {
                    return Err(Error::not_found(format!("Question {id}")));
                }
                let owned = doc! { "question_id": id };
                let deleted = choices
                    .delete_many_with_session(owned.clone(), None, session)
                    .await?;
                receipts
                    .delete_many_with_session(owned, None, session)
                    .await?;
                debug!(
                    "Deleting question {id} along with {} choices",
                    deleted.deleted_count
                );
                Ok(())
            }
            .boxed()
        })
        .await
    }

    async fn question(&self, id: QuestionId) -> Result<Option<Question>> {
        Ok(self.questions.find_one(u32_id_filter(id), None).await?)
    }

    async fn list_questions(&self, filter: &QuestionFilter) -> Result<Vec<Question>> {
        let options = FindOptions::builder()
            .sort(doc! { "publish_at": -1, "_id": 1 })
            .limit(filter.limit.and_then(|limit| i64::try_from(limit).ok()))
            .build();
        Ok(self
            .questions
            .find(question_filter(filter), options)
            .await?
            .try_collect()
            .await?)
    }

    async fn add_choice(&self, question_id: QuestionId, text: String) -> Result<Choice> {
        require_text(&text, "Choice")?;
        self.require_question(question_id).await?;
        let id = Counter::next(&self.counters, CHOICE_ID_COUNTER_ID).await?;
        let choice = Choice::new(id, question_id, text);

        let choices = self.choices.clone();
        self.with_transaction(move |session| {
            let (choices, choice) = (choices.clone(), choice.clone());
            async move {
                // Writing every sibling makes a vote that commits after our
                // snapshot conflict with this transaction instead of slipping past the check.
                let siblings = doc! { "question_id": question_id };
                choices
                    .update_many_with_session(
                        siblings,
                        doc! { "$inc": { "revision": 1 } },
                        None,
                        session,
                    )
                    .await?;
                let voted = doc! { "question_id": question_id, "votes": { "$gt": 0 } };
                if choices
                    .count_documents_with_session(voted, None, session)
                    .await?
                    > 0
                {
                    return Err(Error::BallotLocked(question_id));
                }
                choices
                    .insert_one_with_session(&choice, None, session)
                    .await?;
                Ok(choice)
            }
            .boxed()
        })
        .await
    }

    async fn choice(&self, id: ChoiceId) -> Result<Option<Choice>> {
        Ok(self.choices.find_one(u32_id_filter(id), None).await?)
    }

    async fn choices(&self, question_id: QuestionId) -> Result<Vec<Choice>> {
        let filter = ChoiceFilter {
            question_id: Some(question_id),
            search: None,
        };
        self.list_choices(&filter).await
    }

    async fn list_choices(&self, filter: &ChoiceFilter) -> Result<Vec<Choice>> {
        let options = FindOptions::builder().sort(doc! { "_id": 1 }).build();
        Ok(self
            .choices
            .find(choice_filter(filter), options)
            .await?
            .try_collect()
            .await?)
    }

    async fn increment_vote(&self, id: ChoiceId) -> Result<u64> {
        self.choices
            .find_one_and_update(
                u32_id_filter(id),
                doc! { "$inc": { "votes": 1 } },
                return_updated(),
            )
            .await?
            .map(|choice| choice.votes)
            .ok_or_else(|| Error::not_found(format!("Choice {id}")))
    }

    async fn record_vote(
        &self,
        question_id: QuestionId,
        choice_id: ChoiceId,
        receipt: Option<VoterReceipt>,
    ) -> Result<u64> {
        let receipt = match receipt {
            Some(receipt) => receipt,
            None => {
                // A single-document `$inc` is atomic on its own.
                let updated = self
                    .choices
                    .find_one_and_update(
                        doc! { "_id": choice_id, "question_id": question_id },
                        doc! { "$inc": { "votes": 1 } },
                        return_updated(),
                    )
                    .await?;
                return match updated {
                    Some(choice) => Ok(choice.votes),
                    None => {
                        self.require_question(question_id).await?;
                        Err(foreign_choice(choice_id, question_id))
                    }
                };
            }
        };
        if receipt.question_id != question_id {
            return Err(Error::BadRequest(format!(
                "Receipt is for question {}, not {question_id}",
                receipt.question_id
            )));
        }

        let (questions, choices, receipts) = (
            self.questions.clone(),
            self.choices.clone(),
            self.receipts.clone(),
        );
        self.with_transaction(move |session| {
            Self::vote_with_receipt(
                questions.clone(),
                choices.clone(),
                receipts.clone(),
                receipt.clone(),
                choice_id,
                session,
            )
            .boxed()
        })
        .await
    }

    async fn has_receipt(&self, voter_id: Id, question_id: QuestionId) -> Result<bool> {
        let filter = doc! { "voter_id": voter_id, "question_id": question_id };
        Ok(self.receipts.count_documents(filter, None).await? > 0)
    }

    async fn read_counts(&self, question_id: QuestionId) -> Result<Vec<ChoiceCount>> {
        // Read the question and its counts from one snapshot.
        let session_options = SessionOptions::builder().snapshot(true).build();
        let mut session = self.client.start_session(Some(session_options)).await?;

        self.questions
            .find_one_with_session(u32_id_filter(question_id), None, &mut session)
            .await?
            .ok_or_else(|| Error::not_found(format!("Question {question_id}")))?;

        let options = FindOptions::builder().sort(doc! { "_id": 1 }).build();
        let mut cursor = self
            .choices
            .find_with_session(doc! { "question_id": question_id }, options, &mut session)
            .await?;
        let mut counts = Vec::new();
        while let Some(choice) = cursor.next(&mut session).await {
            counts.push(ChoiceCount::from(choice?));
        }
        Ok(counts)
    }
}
