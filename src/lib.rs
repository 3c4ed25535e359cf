#[macro_use]
extern crate rocket;

#[cfg(test)]
#[macro_use]
extern crate backend_test;

use rocket::{Build, Rocket};

use crate::config::{Config, ConfigFairing, StoreFairing};
use crate::logging::LoggerFairing;
use crate::store::Ballots;

pub mod api;
pub mod config;
pub mod error;
pub mod gate;
pub mod logging;
pub mod model;
pub mod store;
pub mod tally;

/// Build the server, taking its config and store from the figment at ignition.
pub fn build() -> Rocket<Build> {
    rocket::build()
        .mount("/", api::routes())
        .attach(ConfigFairing)
        .attach(StoreFairing)
        .attach(LoggerFairing)
}

/// Build the server over an existing store and config.
pub fn rocket_for_store(ballots: Ballots, config: Config) -> Rocket<Build> {
    rocket::build()
        .mount("/", api::routes())
        .attach(LoggerFairing)
        .manage(ballots)
        .manage(config)
}
