use argon2::Error as Argon2Error;
use jsonwebtoken::errors::{Error as JwtError, ErrorKind as JwtErrorKind};
use log::{log, Level};
use mongodb::error::Error as DbError;
use rocket::{
    http::{Status, StatusClass},
    response::Responder,
    Request,
};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Jwt(#[from] JwtError),
    #[error(transparent)]
    Argon2(#[from] Argon2Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid choice: {0}")]
    InvalidChoice(String),
    #[error("Voting on question {0} is closed")]
    ElectionClosed(u32),
    #[error("Voter has already voted on question {0}")]
    DuplicateVote(u32),
    #[error("Question {0} already has votes and cannot be restructured")]
    BallotLocked(u32),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("{1}")]
    Status(Status, String),
}

impl Error {
    /// Shorthand for a [`Error::NotFound`] describing the missing thing.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// The HTTP status this error is reported as.
    pub fn status(&self) -> Status {
        match self {
            Self::NotFound(_) => Status::NotFound,
            Self::InvalidChoice(_) => Status::UnprocessableEntity,
            Self::ElectionClosed(_) => Status::Forbidden,
            Self::DuplicateVote(_) | Self::BallotLocked(_) => Status::Conflict,
            Self::Unauthorized(_) => Status::Unauthorized,
            Self::BadRequest(_) => Status::BadRequest,
            Self::Status(status, _) => *status,
            Self::Db(_) | Self::Argon2(_) => Status::InternalServerError,
            Self::Jwt(err) => match err.kind() {
                JwtErrorKind::ExpiredSignature | JwtErrorKind::ImmatureSignature => {
                    Status::Unauthorized
                }
                // Incoming tokens are checked by the guard; anything else is a signing fault.
                _ => Status::InternalServerError,
            },
        }
    }
}

impl<'r, 'o: 'r> Responder<'r, 'o> for Error {
    fn respond_to(self, req: &'r Request<'_>) -> rocket::response::Result<'o> {
        let status = self.status();
        log!(log_level(status), "{} {}: {self}", req.method(), req.uri());
        Err(status)
    }
}

/// Server faults are errors, client faults are warnings.
pub(crate) fn log_level(status: Status) -> Level {
    match status.class() {
        StatusClass::ServerError => Level::Error,
        StatusClass::ClientError => Level::Warn,
        _ => Level::Info,
    }
}
