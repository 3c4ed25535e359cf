use std::collections::{BTreeMap, HashMap};

use rocket::tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::model::{
    choice::{Choice, ChoiceCount, ChoiceFilter, ChoiceId},
    mongodb::Id,
    question::{NewQuestion, Question, QuestionFilter, QuestionId, QuestionPatch},
    receipt::VoterReceipt,
};

use super::{require_text, BallotStore};

/// Everything the store holds. Guarded as a whole, so every operation sees
/// and leaves a consistent state.
#[derive(Default)]
struct Tables {
    questions: BTreeMap<QuestionId, Question>,
    choices: BTreeMap<ChoiceId, Choice>,
    receipts: HashMap<(Id, QuestionId), VoterReceipt>,
    last_question_id: QuestionId,
    last_choice_id: ChoiceId,
}

impl Tables {
    fn question_exists(&self, id: QuestionId) -> Result<()> {
        if self.questions.contains_key(&id) {
            Ok(())
        } else {
            Err(Error::not_found(format!("Question {id}")))
        }
    }
}

/// An in-process store. Writers are serialized by a single lock that is
/// never held across an `await` on anything but itself.
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[rocket::async_trait]
impl BallotStore for MemoryStore {
    async fn create_question(&self, question: NewQuestion) -> Result<Question> {
        require_text(&question.text, "Question")?;
        let mut tables = self.tables.write().await;
        tables.last_question_id += 1;
        let question = question.with_id(tables.last_question_id);
        tables.questions.insert(question.id, question.clone());
        Ok(question)
    }

    async fn update_question(&self, id: QuestionId, patch: QuestionPatch) -> Result<Question> {
        if let Some(ref text) = patch.text {
            require_text(text, "Question")?;
        }
        let mut tables = self.tables.write().await;
        let question = tables
            .questions
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("Question {id}")))?;
        question.apply(patch);
        Ok(question.clone())
    }

    async fn delete_question(&self, id: QuestionId) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables
            .questions
            .remove(&id)
            .ok_or_else(|| Error::not_found(format!("Question {id}")))?;
        tables.choices.retain(|_, choice| choice.question_id != id);
        tables.receipts.retain(|(_, question_id), _| *question_id != id);
        Ok(())
    }

    async fn question(&self, id: QuestionId) -> Result<Option<Question>> {
        Ok(self.tables.read().await.questions.get(&id).cloned())
    }

    async fn list_questions(&self, filter: &QuestionFilter) -> Result<Vec<Question>> {
        let mut questions: Vec<_> = self
            .tables
            .read()
            .await
            .questions
            .values()
            .filter(|question| filter.matches(question))
            .cloned()
            .collect();
        questions.sort_by(|a, b| b.publish_at.cmp(&a.publish_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            questions.truncate(limit);
        }
        Ok(questions)
    }

    async fn add_choice(&self, question_id: QuestionId, text: String) -> Result<Choice> {
        require_text(&text, "Choice")?;
        let mut tables = self.tables.write().await;
        tables.question_exists(question_id)?;
        let voted = tables
            .choices
            .values()
            .any(|choice| choice.question_id == question_id && choice.votes > 0);
        if voted {
            return Err(Error::BallotLocked(question_id));
        }
        tables.last_choice_id += 1;
        let choice = Choice::new(tables.last_choice_id, question_id, text);
        tables.choices.insert(choice.id, choice.clone());
        Ok(choice)
    }

    async fn choice(&self, id: ChoiceId) -> Result<Option<Choice>> {
        Ok(self.tables.read().await.choices.get(&id).cloned())
    }

    async fn choices(&self, question_id: QuestionId) -> Result<Vec<Choice>> {
        let filter = ChoiceFilter {
            question_id: Some(question_id),
            search: None,
        };
        self.list_choices(&filter).await
    }

    async fn list_choices(&self, filter: &ChoiceFilter) -> Result<Vec<Choice>> {
        Ok(self
            .tables
            .read()
            .await
            .choices
            .values()
            .filter(|choice| filter.matches(choice))
            .cloned()
            .collect())
    }

    async fn increment_vote(&self, id: ChoiceId) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let choice = tables
            .choices
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("Choice {id}")))?;
        choice.votes += 1;
        Ok(choice.votes)
    }

    async fn record_vote(
        &self,
        question_id: QuestionId,
        choice_id: ChoiceId,
        receipt: Option<VoterReceipt>,
    ) -> Result<u64> {
        let mut guard = self.tables.write().await;
        guard.question_exists(question_id)?;
        let Tables {
            choices, receipts, ..
        } = &mut *guard;

        // All checks happen before anything is mutated.
        let choice = choices
            .get_mut(&choice_id)
            .filter(|choice| choice.question_id == question_id)
            .ok_or_else(|| {
                Error::InvalidChoice(format!(
                    "Choice {choice_id} does not belong to question {question_id}"
                ))
            })?;
        if let Some(receipt) = receipt {
            if receipt.question_id != question_id {
                return Err(Error::BadRequest(format!(
                    "Receipt is for question {}, not {question_id}",
                    receipt.question_id
                )));
            }
            if receipts.contains_key(&receipt.key()) {
                return Err(Error::DuplicateVote(question_id));
            }
            receipts.insert(receipt.key(), receipt);
        }
        choice.votes += 1;
        Ok(choice.votes)
    }

    async fn has_receipt(&self, voter_id: Id, question_id: QuestionId) -> Result<bool> {
        Ok(self
            .tables
            .read()
            .await
            .receipts
            .contains_key(&(voter_id, question_id)))
    }

    async fn read_counts(&self, question_id: QuestionId) -> Result<Vec<ChoiceCount>> {
        let tables = self.tables.read().await;
        tables.question_exists(question_id)?;
        Ok(tables
            .choices
            .values()
            .filter(|choice| choice.question_id == question_id)
            .cloned()
            .map(ChoiceCount::from)
            .collect())
    }
}
