//! Types received from and sent to API clients.

pub mod admin;
pub mod question;
