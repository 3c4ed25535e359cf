use std::collections::HashMap;

use chrono::Utc;
use rocket::{serde::json::Json, Route};

use crate::{
    error::{Error, Result},
    model::{
        api::{
            admin::{AdminChoice, AdminQuestion, ChoiceSpec, QuestionSpec},
            question::QuestionDetail,
        },
        auth::{Admin, AuthToken},
        choice::ChoiceFilter,
        question::{QuestionFilter, QuestionId, QuestionPatch},
    },
    store::Ballots,
};

pub fn routes() -> Vec<Route> {
    routes![
        list_questions,
        create_question,
        update_question,
        delete_question,
        add_choice,
        list_choices,
    ]
}

#[get("/admin/questions?<search>")]
async fn list_questions(
    _token: AuthToken<Admin>,
    search: Option<String>,
    ballots: Ballots,
) -> Result<Json<Vec<AdminQuestion>>> {
    let now = Utc::now();
    let filter = QuestionFilter {
        search,
        ..Default::default()
    };
    let questions = ballots.list_questions(&filter).await?;

    let mut choice_counts: HashMap<QuestionId, usize> = HashMap::new();
    for choice in ballots.list_choices(&ChoiceFilter::default()).await? {
        *choice_counts.entry(choice.question_id).or_default() += 1;
    }

    let questions = questions
        .into_iter()
        .map(|question| {
            let choice_count = choice_counts.get(&question.id).copied().unwrap_or(0);
            AdminQuestion::new(question, choice_count, now)
        })
        .collect();
    Ok(Json(questions))
}

#[post("/admin/questions", data = "<spec>", format = "json")]
async fn create_question(
    _token: AuthToken<Admin>,
    spec: Json<QuestionSpec>,
    ballots: Ballots,
) -> Result<Json<QuestionDetail>> {
    let (question, choice_texts) = spec.0.into_parts();
    // Reject bad choices before anything is written.
    if choice_texts.iter().any(|text| text.trim().is_empty()) {
        return Err(Error::BadRequest("Choice text must not be empty".to_string()));
    }

    let question = ballots.create_question(question).await?;
    let mut choices = Vec::with_capacity(choice_texts.len());
    for text in choice_texts {
        match ballots.add_choice(question.id, text).await {
            Ok(choice) => choices.push(choice),
            Err(err) => {
                // Take the partial question back down with it.
                if let Err(cleanup) = ballots.delete_question(question.id).await {
                    error!("Half-built question {} left behind: {cleanup}", question.id);
                }
                return Err(err);
            }
        }
    }
    info!(
        "Created question {} with {} choices",
        question.id,
        choices.len()
    );
    Ok(Json(QuestionDetail::new(question, choices, Utc::now())))
}

#[put("/admin/questions/<question_id>", data = "<patch>", format = "json")]
async fn update_question(
    _token: AuthToken<Admin>,
    question_id: QuestionId,
    patch: Json<QuestionPatch>,
    ballots: Ballots,
) -> Result<Json<AdminQuestion>> {
    let question = ballots.update_question(question_id, patch.0).await?;
    let choice_count = ballots.choices(question_id).await?.len();
    Ok(Json(AdminQuestion::new(question, choice_count, Utc::now())))
}

#[delete("/admin/questions/<question_id>")]
async fn delete_question(
    _token: AuthToken<Admin>,
    question_id: QuestionId,
    ballots: Ballots,
) -> Result<()> {
    ballots.delete_question(question_id).await?;
    info!("Deleted question {question_id}");
    Ok(())
}

#[post("/admin/questions/<question_id>/choices", data = "<spec>", format = "json")]
async fn add_choice(
    _token: AuthToken<Admin>,
    question_id: QuestionId,
    spec: Json<ChoiceSpec>,
    ballots: Ballots,
) -> Result<Json<AdminChoice>> {
    let choice = ballots.add_choice(question_id, spec.0.text).await?;
    Ok(Json(choice.into()))
}

#[get("/admin/choices?<question>&<search>")]
async fn list_choices(
    _token: AuthToken<Admin>,
    question: Option<QuestionId>,
    search: Option<String>,
    ballots: Ballots,
) -> Result<Json<Vec<AdminChoice>>> {
    let filter = ChoiceFilter {
        question_id: question,
        search,
    };
    let choices = ballots
        .list_choices(&filter)
        .await?
        .into_iter()
        .map(AdminChoice::from)
        .collect();
    Ok(Json(choices))
}
