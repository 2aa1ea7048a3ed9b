//! Library to back up a [MySQL][mysql] database with full dumps and incremental
//! binary log exports.
//!
//! A run is driven by the [`orchestrator::Orchestrator`]: it decides between a full and an
//! incremental backup, streams the output of `mysqldump` or `mysqlbinlog` into an
//! artifact, compresses it, advances the persisted [`cursor::LogCursor`] and finally
//! deletes artifacts that exceeded their retention window.
//!
//! [mysql]: https://dev.mysql.com/doc/refman/8.0/en/backup-methods.html

#![forbid(unsafe_code)]

pub mod artifact;
pub mod cli;
pub mod config;
pub mod cursor;
pub mod error;
pub mod executor;
pub mod fs;
pub mod mysql;
pub mod orchestrator;
pub mod util;
