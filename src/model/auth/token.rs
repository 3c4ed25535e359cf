use std::marker::PhantomData;

use chrono::{serde::ts_seconds, DateTime, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, TokenData, Validation};
use rocket::{
    http::{Cookie, SameSite, Status},
    request::{FromRequest, Outcome},
    time::Duration,
    Request,
};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::mongodb::Id;

use super::user::{Rights, User};

pub const AUTH_TOKEN_COOKIE: &str = "auth_token";

/// An authentication token representing a specific session with specific rights.
#[derive(Serialize, Deserialize)]
pub struct AuthToken<U> {
    pub id: Id,
    #[serde(rename = "rgt")]
    pub rights: Rights,
    #[serde(skip)]
    phantom: PhantomData<U>,
}

impl<U> AuthToken<U> {
    /// Does this token permit the given rights?
    pub fn permits(&self, target: Rights) -> bool {
        self.rights == target
    }
}

impl<U> AuthToken<U>
where
    U: User,
{
    /// Create a new [`AuthToken`] for a fresh session, with the correct rights for the user type.
    pub fn new() -> Self {
        Self {
            id: Id::new(),
            rights: U::RIGHTS,
            phantom: PhantomData,
        }
    }

    /// Serialize this token into a cookie.
    pub fn into_cookie(self, config: &Config) -> Result<Cookie<'static>> {
        let claims = Claims {
            token: self,
            expire_at: Utc::now() + config.auth_ttl(),
        };

        let token = jsonwebtoken::encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(config.jwt_secret()),
        )?;

        Ok(Cookie::build(AUTH_TOKEN_COOKIE, token)
            .max_age(Duration::seconds(config.auth_ttl().num_seconds()))
            .http_only(true)
            .same_site(SameSite::Strict)
            .finish())
    }

    /// Deserialize a token from a cookie.
    pub fn from_cookie(cookie: &Cookie<'_>, config: &Config) -> Result<Self> {
        let token = jsonwebtoken::decode(
            cookie.value(),
            &DecodingKey::from_secret(config.jwt_secret()),
            &Validation::default(),
        )
        .map(|claims: TokenData<Claims<U>>| claims.claims.token)?;
        Ok(token)
    }
}

impl<U: User> Default for AuthToken<U> {
    fn default() -> Self {
        Self::new()
    }
}

/// Cookie claims: the token itself plus an expiry datetime.
#[derive(Serialize, Deserialize)]
struct Claims<U> {
    #[serde(flatten, bound = "")]
    token: AuthToken<U>,
    #[serde(rename = "exp", with = "ts_seconds")]
    expire_at: DateTime<Utc>,
}

#[rocket::async_trait]
impl<'r, U> FromRequest<'r> for AuthToken<U>
where
    U: User + Send,
{
    type Error = Error;

    /// Get an [`AuthToken`] from the cookie and verify that it has the correct rights for this user
    /// type. Sessions are stateless, so nothing is looked up in the store.
    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let Some(config) = req.rocket().state::<Config>() else {
            error!("No application config in managed state");
            let err = Error::Status(Status::InternalServerError, "missing config".to_string());
            return Outcome::Failure((Status::InternalServerError, err));
        };

        let Some(cookie) = req.cookies().get(AUTH_TOKEN_COOKIE) else {
            let err = Error::Unauthorized(format!("no {} session", U::RIGHTS));
            return Outcome::Failure((Status::Unauthorized, err));
        };

        let token = match Self::from_cookie(cookie, config) {
            Ok(token) => token,
            Err(err) => {
                debug!("Rejected auth token: {err}");
                return Outcome::Failure((Status::Unauthorized, err));
            }
        };

        if !token.permits(U::RIGHTS) {
            let err = Error::Unauthorized(format!("{} session required", U::RIGHTS));
            return Outcome::Failure((Status::Unauthorized, err));
        }

        Outcome::Success(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::auth::{Admin, Voter};

    #[test]
    fn cookie_carries_rights() {
        let config = Config::example();
        let token = AuthToken::<Voter>::new();
        let id = token.id;
        let cookie = token.into_cookie(&config).unwrap();
        assert_eq!(cookie.name(), AUTH_TOKEN_COOKIE);

        let decoded = AuthToken::<Voter>::from_cookie(&cookie, &config).unwrap();
        assert_eq!(decoded.id, id);
        assert!(decoded.permits(Rights::Voter));
        assert!(!decoded.permits(Rights::Admin));

        let as_admin = AuthToken::<Admin>::from_cookie(&cookie, &config).unwrap();
        assert!(!as_admin.permits(Admin::RIGHTS));
    }

    #[test]
    fn foreign_signature_is_rejected() {
        let config = Config::example();
        let cookie = AuthToken::<Admin>::new().into_cookie(&config).unwrap();
        let other = Config {
            jwt_secret: "someone else's secret".to_string(),
            ..Config::example()
        };
        assert!(AuthToken::<Admin>::from_cookie(&cookie, &other).is_err());
    }
}
