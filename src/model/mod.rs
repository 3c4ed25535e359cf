pub mod api;
pub mod auth;
pub mod choice;
pub mod mongodb;
pub mod question;
pub mod receipt;
