//! Data layer module
//!
//! SQLite persistence for users, federation hosts, federated users,
//! follow edges, the activity log and repository stars.

mod database;
mod models;

pub use database::Database;
pub use models::*;
