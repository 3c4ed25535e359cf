use rocket::{
    http::{Cookie, CookieJar, Status},
    serde::json::Json,
    Route, State,
};

use crate::{
    config::Config,
    error::{Error, Result},
    model::{
        api::admin::AdminCredentials,
        auth::{Admin, AuthToken, Voter, AUTH_TOKEN_COOKIE},
    },
};

pub fn routes() -> Vec<Route> {
    routes![authenticate, voter_session, logout]
}

#[post("/auth/admin", data = "<credentials>", format = "json")]
pub async fn authenticate(
    cookies: &CookieJar<'_>,
    credentials: Json<AdminCredentials>,
    config: &State<Config>,
) -> Result<()> {
    if !config.verify_admin(&credentials)? {
        return Err(Error::Status(
            Status::Unauthorized,
            "No admin found with the provided username and password combination.".to_string(),
        ));
    }

    let token = AuthToken::<Admin>::new();
    cookies.add(token.into_cookie(config)?);
    info!("Admin {} signed in", credentials.username);

    Ok(())
}

/// Start an anonymous voter session. A voter who already has a valid
/// session keeps it, so they cannot shed their identity to vote again.
#[post("/auth/voter")]
pub async fn voter_session(
    existing: Option<AuthToken<Voter>>,
    cookies: &CookieJar<'_>,
    config: &State<Config>,
) -> Result<()> {
    if existing.is_none() {
        let token = AuthToken::<Voter>::new();
        debug!("New voter session {}", token.id);
        cookies.add(token.into_cookie(config)?);
    }
    Ok(())
}

#[delete("/auth")]
pub fn logout(cookies: &CookieJar) -> Status {
    cookies.remove(Cookie::named(AUTH_TOKEN_COOKIE));
    Status::Ok
}

#[cfg(test)]
mod tests {
    use rocket::{http::ContentType, local::asynchronous::Client, serde::json::serde_json::json};

    use super::*;

    #[backend_test]
    async fn admin_authenticate_valid(client: Client) {
        let response = client
            .post(uri!(authenticate))
            .header(ContentType::JSON)
            .body(json!(AdminCredentials::example()).to_string())
            .dispatch()
            .await;

        assert_eq!(Status::Ok, response.status());
        let cookie = client.cookies().get(AUTH_TOKEN_COOKIE).cloned().unwrap();
        let config = client.rocket().state::<Config>().unwrap();
        let token = AuthToken::<Admin>::from_cookie(&cookie, config).unwrap();
        assert!(token.permits(crate::model::auth::Rights::Admin));
    }

    #[backend_test]
    async fn admin_authenticate_invalid(client: Client) {
        // Use invalid username to attempt admin login
        let response = client
            .post(uri!(authenticate))
            .header(ContentType::JSON)
            .body(json!(AdminCredentials::empty()).to_string())
            .dispatch()
            .await;

        assert_eq!(Status::Unauthorized, response.status());
        assert_eq!(None, client.cookies().get(AUTH_TOKEN_COOKIE));

        // Use invalid password to attempt admin login
        let response = client
            .post(uri!(authenticate))
            .header(ContentType::JSON)
            .body(
                json!({
                    "username": AdminCredentials::example().username,
                    "password": "",
                })
                .to_string(),
            )
            .dispatch()
            .await;

        assert_eq!(Status::Unauthorized, response.status());
        assert_eq!(None, client.cookies().get(AUTH_TOKEN_COOKIE));
    }

    #[backend_test]
    async fn voter_session_is_kept(client: Client) {
        let response = client.post(uri!(voter_session)).dispatch().await;
        assert_eq!(Status::Ok, response.status());
        let first = client.cookies().get(AUTH_TOKEN_COOKIE).cloned().unwrap();

        let response = client.post(uri!(voter_session)).dispatch().await;
        assert_eq!(Status::Ok, response.status());
        let second = client.cookies().get(AUTH_TOKEN_COOKIE).cloned().unwrap();

        let config = client.rocket().state::<Config>().unwrap();
        let first = AuthToken::<Voter>::from_cookie(&first, config).unwrap();
        let second = AuthToken::<Voter>::from_cookie(&second, config).unwrap();
        assert_eq!(first.id, second.id);
    }

    /// Anonymous sessions only tie votes to a cookie: logging out and back in
    /// yields a fresh voter.
    #[backend_test(voter)]
    async fn new_session_after_logout_is_a_new_voter(client: Client) {
        let config = client.rocket().state::<Config>().unwrap();
        let cookie = client.cookies().get(AUTH_TOKEN_COOKIE).cloned().unwrap();
        let first = AuthToken::<Voter>::from_cookie(&cookie, config).unwrap();

        client.delete(uri!(logout)).dispatch().await;
        let response = client.post(uri!(voter_session)).dispatch().await;
        assert_eq!(Status::Ok, response.status());

        let cookie = client.cookies().get(AUTH_TOKEN_COOKIE).cloned().unwrap();
        let second = AuthToken::<Voter>::from_cookie(&cookie, config).unwrap();
        assert_ne!(first.id, second.id);
    }

    #[backend_test(admin)]
    async fn logout_admin(client: Client) {
        let response = client.delete(uri!(logout)).dispatch().await;

        assert_eq!(Status::Ok, response.status());
        assert_eq!(None, client.cookies().get(AUTH_TOKEN_COOKIE));
    }

    #[backend_test(voter)]
    async fn logout_voter(client: Client) {
        assert!(client.cookies().get(AUTH_TOKEN_COOKIE).is_some());

        let response = client.delete(uri!(logout)).dispatch().await;

        assert_eq!(Status::Ok, response.status());
        assert_eq!(None, client.cookies().get(AUTH_TOKEN_COOKIE));
    }
}
