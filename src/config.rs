use chrono::Duration;
use mongodb::Client as MongoClient;
use rocket::{
    fairing::{Fairing, Info, Kind},
    Build, Rocket,
};
use serde::Deserialize;

use crate::error::Result;
use crate::model::api::admin::AdminCredentials;
use crate::store::{Ballots, MongoStore};

/// Application configuration, derived from `Rocket.toml` and `ROCKET_*`
/// environment variables. This struct becomes managed state and can be
/// inspected by any endpoint.
#[derive(Deserialize)]
pub struct Config {
    // non-secrets
    #[serde(default)]
    pub(crate) voter_tracking: bool,
    pub(crate) auth_ttl: u32,
    pub(crate) admin_username: String,
    // secrets
    pub(crate) admin_password_hash: String,
    pub(crate) jwt_secret: String,
}

impl Config {
    /// Whether each voter may vote at most once per question.
    /// Votes then require a voter session.
    pub fn voter_tracking(&self) -> bool {
        self.voter_tracking
    }

    /// Valid lifetime of auth token cookies in seconds.
    pub fn auth_ttl(&self) -> Duration {
        Duration::seconds(self.auth_ttl.into())
    }

    /// Secret key used to encrypt JWTs.
    pub fn jwt_secret(&self) -> &[u8] {
        self.jwt_secret.as_bytes()
    }

    /// Check the given credentials against the configured administrator.
    pub fn verify_admin(&self, credentials: &AdminCredentials) -> Result<bool> {
        if credentials.username != self.admin_username {
            return Ok(false);
        }
        let verified = argon2::verify_encoded(
            &self.admin_password_hash,
            credentials.password.as_bytes(),
        )?;
        Ok(verified)
    }
}

/// A fairing that loads the application config and puts it in managed state.
/// This could easily be achieved using `AdHoc::config`, but is written out
/// explicitly for symmetry with the store fairing and control over error
/// messages.
pub struct ConfigFairing;

#[rocket::async_trait]
impl Fairing for ConfigFairing {
    fn info(&self) -> Info {
        Info {
            name: "Config",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        // Load the config.
        let config = match rocket.figment().extract::<Config>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load application config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };
        info!(
            "Voter tracking is {}",
            if config.voter_tracking() { "on" } else { "off" }
        );

        // Manage the state.
        rocket = rocket.manage(config);
        Ok(rocket)
    }
}

/// Where ballots are kept.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Storage {
    /// In-process; lost on shutdown.
    #[default]
    Memory,
    /// A MongoDB replica set.
    Mongodb,
}

/// Configuration for the ballot store.
#[derive(Deserialize)]
struct StoreConfig {
    // non-secrets
    #[serde(default)]
    storage: Storage,
    #[serde(default = "default_db_name")]
    db_name: String,
    // secrets
    db_uri: Option<String>,
}

fn default_db_name() -> String {
    "ballotbox".to_string()
}

/// A fairing that loads the store config, connects to the database if
/// there is one, performs any setup necessary, and places the [`Ballots`]
/// handle into managed state.
pub struct StoreFairing;

#[rocket::async_trait]
impl Fairing for StoreFairing {
    fn info(&self) -> Info {
        Info {
            name: "Ballot store",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, rocket: Rocket<Build>) -> rocket::fairing::Result {
        // Load the config.
        let config = match rocket.figment().extract::<StoreConfig>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load store config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };

        let ballots = match config.storage {
            Storage::Memory => {
                warn!("Using in-memory ballot store, votes will not survive a restart");
                Ballots::in_memory()
            }
            Storage::Mongodb => {
                let Some(db_uri) = config.db_uri else {
                    error!("`db_uri` must be set to use MongoDB storage");
                    return Err(rocket);
                };
                info!("Loaded database config, connecting...");
                // Construct the connection.
                let client = match MongoClient::with_uri_str(db_uri).await {
                    Ok(client) => client,
                    Err(e) => {
                        error!("Failed to connect to database: {e}");
                        return Err(rocket);
                    }
                };
                let db = client.database(&config.db_name);

                // Ensure the required indexes and ID counters exist.
                if let Err(e) = MongoStore::prepare(&db).await {
                    error!("Failed to prepare database: {e}");
                    return Err(rocket);
                }
                info!("...database connection online!");
                Ballots::new(MongoStore::new(client, &db))
            }
        };

        // Manage the state.
        Ok(rocket.manage(ballots))
    }
}
