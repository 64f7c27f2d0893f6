//! Engine State Module
//!
//! SQLite-backed persistent history. Terminal modifications land here
//! and are never mutated by the pipeline again.

mod database;
mod schema;

pub use database::Database;
pub use schema::{CREATE_TABLES, SCHEMA_VERSION};
