//! Classification of everything that can go wrong during a backup run.
//!
//! Components return their own error enums. The [Orchestrator](crate::orchestrator::Orchestrator)
//! folds them into [BackupError], whose [kind](BackupError::kind) decides how the caller
//! has to react.

use derive_more::{Display, Error, From};

use crate::artifact::compress::CompressError;
use crate::config::ConfigError;
use crate::cursor::store::CursorError;
use crate::cursor::tracker::TrackerError;
use crate::executor::ExecError;
use crate::util::lock::LockError;

/// Coarse error classes reported with every failed or degraded run.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Fatal, no retry: missing settings or a server precondition is not met.
    #[display("configuration")]
    Configuration,
    /// The database could not be reached. The caller may retry.
    #[display("connectivity")]
    Connectivity,
    /// The dump or export tool failed. The partial artifact was removed.
    #[display("execution")]
    Execution,
    /// Compression failed, the artifact is kept uncompressed.
    #[display("compression")]
    Compression,
    /// The log cursor could not be updated durably.
    #[display("cursor-persist")]
    CursorPersist,
    /// Deleting an expired artifact failed.
    #[display("retention")]
    Retention,
    /// Another run holds the lock of the target database.
    #[display("busy")]
    Busy,
}

/// Error of a single orchestration run.
#[derive(Debug, Display, Error, From)]
pub enum BackupError {
    /// The configuration is invalid.
    #[display("Invalid configuration: {_0}")]
    Config(ConfigError),
    /// Incremental backup requested without a stored cursor to start from.
    #[display("No log cursor stored for database '{_0}', run a full backup first")]
    NoBaseline(#[error(ignore)] String),
    /// Querying or advancing the log position failed.
    #[display("Log cursor tracking failed: {_0}")]
    Tracker(TrackerError),
    /// The dump or export tool failed.
    #[display("Backup execution failed: {_0}")]
    Exec(ExecError),
    /// Compression failed.
    #[display("Compression failed: {_0}")]
    Compress(CompressError),
    /// Reading or writing the persisted cursor failed.
    #[display("Log cursor persistence failed: {_0}")]
    Cursor(CursorError),
    /// The run lock could not be acquired.
    #[display("Run lock unavailable: {_0}")]
    Lock(LockError),
    /// The full dump doesn't name the log position it was taken at.
    #[display("No binary log coordinates found in the dump {}", _0.display())]
    #[from(ignore)]
    DumpCoordinates(#[error(ignore)] std::path::PathBuf),
    /// Listing or creating the artifact directories failed.
    #[display("Artifact layout failed: {_0}")]
    Layout(#[error(source)] std::io::Error),
    /// One or more expired artifacts could not be deleted.
    #[display("{_0} expired artifact(s) could not be deleted")]
    #[from(ignore)]
    Retention(#[error(ignore)] usize),
}

impl BackupError {
    /// Classifies the error according to how the caller has to react.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) | Self::NoBaseline(_) => ErrorKind::Configuration,
            Self::Tracker(e) => e.kind(),
            Self::Exec(e) => e.kind(),
            Self::Compress(_) => ErrorKind::Compression,
            Self::Cursor(e) => e.kind(),
            Self::DumpCoordinates(_) => ErrorKind::CursorPersist,
            Self::Lock(e) => e.kind(),
            Self::Layout(_) => ErrorKind::Execution,
            Self::Retention(_) => ErrorKind::Retention,
        }
    }
}
