//! Helpers that are not tied to the database.

pub mod lock;
pub mod retention;
