use chrono::{DateTime, Utc};
use rocket::{form::Form, response::Redirect, serde::json::Json, Route, State};

use crate::{
    config::Config,
    error::{Error, Result},
    gate::{AdmissionGate, VoteRequest},
    logging::RequestId,
    model::{
        api::question::{QuestionDetail, QuestionResults, QuestionSummary, VoteForm},
        auth::{AuthToken, Voter},
        question::{Question, QuestionFilter, QuestionId},
    },
    store::Ballots,
    tally::Tally,
};

pub fn routes() -> Vec<Route> {
    routes![index, detail, vote, results]
}

/// The latest published questions.
#[get("/questions")]
async fn index(ballots: Ballots) -> Result<Json<Vec<QuestionSummary>>> {
    let now = Utc::now();
    let questions = ballots
        .list_questions(&QuestionFilter::latest_published(now))
        .await?
        .into_iter()
        .map(|question| QuestionSummary::new(question, now))
        .collect();
    Ok(Json(questions))
}

#[get("/questions/<question_id>")]
async fn detail(question_id: QuestionId, ballots: Ballots) -> Result<Json<QuestionDetail>> {
    let now = Utc::now();
    let question = published_question(&ballots, question_id, now).await?;
    let choices = ballots.choices(question_id).await?;
    Ok(Json(QuestionDetail::new(question, choices, now)))
}

#[derive(Responder)]
enum VoteResponse {
    /// The vote was counted; go to the results.
    Counted(Redirect),
    /// The choice was missing or invalid; show the question again.
    Rejected(Json<QuestionDetail>),
}

#[post("/questions/<question_id>/vote", data = "<form>")]
async fn vote(
    question_id: QuestionId,
    form: Form<VoteForm>,
    voter: Option<AuthToken<Voter>>,
    ballots: Ballots,
    config: &State<Config>,
    request_id: &RequestId,
) -> Result<VoteResponse> {
    let request = VoteRequest {
        question_id,
        choice_id: form.choice_id(),
        voter_id: voter.map(|token| token.id),
    };
    if request.choice_id.is_none() && form.choice.is_some() {
        debug!(
            "{request_id} malformed choice {:?} treated as no selection",
            form.choice
        );
    }

    let gate = AdmissionGate::new(&*ballots, config.voter_tracking());
    match gate.admit(request, Utc::now()).await {
        Ok(accepted) => {
            info!(
                "{request_id} vote counted for choice {} of question {question_id}",
                accepted.choice_id
            );
            Ok(VoteResponse::Counted(Redirect::to(uri!(results(question_id)))))
        }
        Err(Error::InvalidChoice(message)) => {
            info!("{request_id} vote on question {question_id} re-displayed: {message}");
            let now = Utc::now();
            let question = published_question(&ballots, question_id, now).await?;
            let choices = ballots.choices(question_id).await?;
            let detail = QuestionDetail::new(question, choices, now).with_error(message);
            Ok(VoteResponse::Rejected(Json(detail)))
        }
        Err(err) => {
            info!("{request_id} vote on question {question_id} refused: {err}");
            Err(err)
        }
    }
}

#[get("/questions/<question_id>/results")]
async fn results(question_id: QuestionId, ballots: Ballots) -> Result<Json<QuestionResults>> {
    let now = Utc::now();
    let question = published_question(&ballots, question_id, now).await?;
    let tally = Tally::read(&*ballots, question_id).await?;
    Ok(Json(QuestionResults {
        question: QuestionSummary::new(question, now),
        tally,
    }))
}

/// Get a question that voters are allowed to see.
async fn published_question(
    ballots: &Ballots,
    question_id: QuestionId,
    now: DateTime<Utc>,
) -> Result<Question> {
    ballots
        .question(question_id)
        .await?
        .filter(|question| question.is_published(now))
        .ok_or_else(|| Error::not_found(format!("Question {question_id}")))
}
