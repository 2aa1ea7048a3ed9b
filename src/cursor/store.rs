//! Durable storage of the [LogCursor], one JSON record per database.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use derive_more::{Display, Error};

use crate::cursor::LogCursor;
use crate::error::ErrorKind;
use crate::fs::Filesystem;

const STATE_DEST: &str = ".state";

/// The persisted cursor.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CursorRecord {
    #[serde(flatten)]
    pub cursor: LogCursor,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Display, Error)]
pub enum CursorError {
    /// The cursor file exists but can't be read.
    #[display("Reading cursor {} failed: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    /// The cursor file doesn't contain a valid record.
    #[display("Cursor {} is corrupt: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
    /// The new cursor lies before the stored one.
    #[display("Refusing to move cursor backwards from {stored} to {attempted}")]
    Regression {
        stored: LogCursor,
        attempted: LogCursor,
    },
    /// Writing or replacing the cursor file failed.
    #[display("Writing cursor {} failed: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
}

impl CursorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Corrupt { .. } => ErrorKind::Configuration,
            Self::Read { .. } | Self::Regression { .. } | Self::Write { .. } => {
                ErrorKind::CursorPersist
            }
        }
    }
}

/// Cursor file of a single database below `<root>/.state/`.
pub struct CursorStore<'a, F: Filesystem> {
    fs: &'a F,
    path: PathBuf,
}

impl<'a, F: Filesystem> CursorStore<'a, F> {
    pub fn new(fs: &'a F, root: &Path, database: &str) -> Self {
        let path = root.join(STATE_DEST).join(format!("{database}.cursor.json"));
        Self { fs, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the stored cursor, [None] if none was stored yet.
    pub fn load(&self) -> Result<Option<CursorRecord>, CursorError> {
        let read_err = |source| CursorError::Read {
            path: self.path.clone(),
            source,
        };

        let mut reader = match self.fs.open(&self.path) {
            Ok(reader) => reader,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(read_err(e)),
        };
        let mut content = Vec::new();
        reader.read_to_end(&mut content).map_err(read_err)?;

        let record = serde_json::from_slice(&content).map_err(|source| CursorError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        Ok(Some(record))
    }

    /// Stores `cursor`, rejecting positions before the stored one.
    ///
    /// The record is written to a temporary file that then replaces the old one, so a
    /// crash leaves either the old or the new cursor behind.
    pub fn persist(
        &self,
        cursor: &LogCursor,
        now: DateTime<Utc>,
    ) -> Result<CursorRecord, CursorError> {
        if let Some(stored) = self.load()? {
            if *cursor < stored.cursor {
                return Err(CursorError::Regression {
                    stored: stored.cursor,
                    attempted: cursor.clone(),
                });
            }
        }

        let record = CursorRecord {
            cursor: cursor.clone(),
            updated_at: now,
        };
        self.write_atomic(&record).map_err(|source| CursorError::Write {
            path: self.path.clone(),
            source,
        })?;
        log::debug!(target: "cursor::store", "Persisted cursor {cursor} to {}", self.path.display());

        Ok(record)
    }

    fn write_atomic(&self, record: &CursorRecord) -> io::Result<()> {
        if let Some(dir) = self.path.parent() {
            self.fs.create_dir_all(dir)?;
        }

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        let json = serde_json::to_vec_pretty(record)?;
        let replaced = self
            .fs
            .create(&tmp)
            .and_then(|mut writer| {
                writer.write_all(&json)?;
                writer.commit()
            })
            .and_then(|()| self.fs.rename(&tmp, &self.path));
        if let Err(e) = replaced {
            let _ = self.fs.remove_file(&tmp);
            return Err(e);
        }

        // the rename survives a crash only once the directory is synced
        match self.path.parent() {
            Some(dir) => self.fs.sync_dir(dir),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeZone;
    use tempfile::TempDir;

    use crate::fs::{LocalFs, MemoryFs};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 2, 0, 0).unwrap()
    }

    #[test]
    fn missing_cursor_loads_as_none() {
        let fs = MemoryFs::default();
        let store = CursorStore::new(&fs, Path::new("/backup"), "shop");
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn persisted_cursor_is_loaded_again() {
        let tmp = TempDir::new().unwrap();
        let store = CursorStore::new(&LocalFs, tmp.path(), "shop");
        let cursor = LogCursor::new("binlog.000003", 157);

        let record = store.persist(&cursor, now()).unwrap();

        assert_eq!(store.load().unwrap(), Some(record));
        assert!(store.path().ends_with(".state/shop.cursor.json"));
        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(json["segment_id"], "binlog.000003");
        assert_eq!(json["offset"], 157);
        assert!(json["updated_at"].is_string());
        // no leftover temporary file
        assert_eq!(std::fs::read_dir(tmp.path().join(".state")).unwrap().count(), 1);
    }

    #[test]
    fn cursor_only_moves_forward() {
        let fs = MemoryFs::default();
        let store = CursorStore::new(&fs, Path::new("/backup"), "shop");

        let sequence = [
            LogCursor::new("binlog.000003", 157),
            LogCursor::new("binlog.000003", 157),
            LogCursor::new("binlog.000004", 4),
            LogCursor::new("binlog.000010", 4),
        ];
        for cursor in &sequence {
            store.persist(cursor, now()).unwrap();
        }

        let err = store
            .persist(&LogCursor::new("binlog.000009", 9000), now())
            .unwrap_err();
        assert!(matches!(err, CursorError::Regression { .. }));
        assert_eq!(err.kind(), ErrorKind::CursorPersist);
        assert_eq!(
            store.load().unwrap().unwrap().cursor,
            LogCursor::new("binlog.000010", 4)
        );
    }

    #[test]
    fn corrupt_cursor_is_a_configuration_error() {
        let fs = MemoryFs::default();
        let store = CursorStore::new(&fs, Path::new("/backup"), "shop");
        fs.put(store.path(), b"{ not json", std::time::SystemTime::now());

        let err = store.load().unwrap_err();
        assert!(matches!(err, CursorError::Corrupt { .. }));
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn failed_write_keeps_the_old_cursor() {
        let fs = MemoryFs::default();
        let store = CursorStore::new(&fs, Path::new("/backup"), "shop");
        let old = store
            .persist(&LogCursor::new("binlog.000003", 157), now())
            .unwrap();
        fs.fail_writes_to("/backup/.state/shop.cursor.json.tmp");

        let err = store
            .persist(&LogCursor::new("binlog.000004", 4), now())
            .unwrap_err();

        assert!(matches!(err, CursorError::Write { .. }));
        assert_eq!(store.load().unwrap(), Some(old));
        assert_eq!(fs.files(), [PathBuf::from("/backup/.state/shop.cursor.json")]);
    }

    #[test]
    fn state_directory_is_synced_after_the_rename() {
        let fs = MemoryFs::default();
        let store = CursorStore::new(&fs, Path::new("/backup"), "shop");

        store
            .persist(&LogCursor::new("binlog.000003", 157), now())
            .unwrap();

        assert_eq!(fs.synced_dirs(), [PathBuf::from("/backup/.state")]);
    }
}
