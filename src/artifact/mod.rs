//! Naming and placement of backup artifacts.
//!
//! Full and incremental artifacts live in separate subdirectories of the artifact root:
//!
//! ```text
//! <root>/full/2026-10-18T02-00-00Z.sql.gz
//! <root>/incremental/2026-10-19T02-00-00Z.sql.gz
//! ```
//!
//! File names start with the UTC timestamp, so sorting them lexicographically sorts them
//! by creation time.

pub mod compress;

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use derive_more::Display;

use crate::fs::Filesystem;

pub use compress::Compressor;

const FULL_DEST: &str = "full";
const INCREMENTAL_DEST: &str = "incremental";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%SZ";
const DUMP_EXTENSION: &str = "sql";

/// Class of a backup.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    /// Complete logical export of the database.
    #[display("full")]
    Full,
    /// Export of the binary log segments since the last cursor.
    #[display("incremental")]
    Incremental,
}

/// A backup file written by the [Executor](crate::executor::Executor).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupArtifact {
    pub kind: BackupKind,
    pub created: DateTime<Utc>,
    pub path: PathBuf,
    pub compressed: bool,
    pub size: u64,
}

/// Directory layout below the artifact root.
#[derive(Debug)]
pub struct ArtifactLayout {
    root: PathBuf,
    // last handed out (second, sequence number) per kind
    issued: Mutex<HashMap<BackupKind, (i64, u32)>>,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            issued: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding artifacts of the given kind.
    pub fn dir(&self, kind: BackupKind) -> PathBuf {
        match kind {
            BackupKind::Full => self.root.join(FULL_DEST),
            BackupKind::Incremental => self.root.join(INCREMENTAL_DEST),
        }
    }

    /// Returns a fresh, uncompressed artifact path for a backup taken at `timestamp`.
    ///
    /// Creates the kind's directory if needed. Two calls within the same second yield
    /// distinct paths, and names already present on disk are skipped (including their
    /// compressed variant).
    pub fn artifact_path(
        &self,
        fs: &impl Filesystem,
        kind: BackupKind,
        timestamp: DateTime<Utc>,
    ) -> io::Result<PathBuf> {
        let dir = self.dir(kind);
        fs.create_dir_all(&dir)?;

        let second = timestamp.timestamp();
        let mut issued = self.issued.lock().unwrap_or_else(PoisonError::into_inner);
        let mut sequence = match issued.get(&kind) {
            Some(&(last, seq)) if last == second => seq + 1,
            _ => 0,
        };

        let stamp = timestamp.format(TIMESTAMP_FORMAT).to_string();
        loop {
            let path = dir.join(file_name(&stamp, sequence));
            if !fs.exists(&path)? && !fs.exists(&compress::compressed_path(&path))? {
                issued.insert(kind, (second, sequence));
                log::trace!(target: "artifact", "Allocated artifact path {}", path.display());
                return Ok(path);
            }
            sequence += 1;
        }
    }
}

fn file_name(stamp: &str, sequence: u32) -> String {
    // '.' sorts before '_', keeping the first name of a second in front
    if sequence == 0 {
        format!("{stamp}.{DUMP_EXTENSION}")
    } else {
        format!("{stamp}_{sequence:02}.{DUMP_EXTENSION}")
    }
}
