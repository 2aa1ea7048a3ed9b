//! Filesystem operations used by the engine.
//!
//! All components go through [Filesystem] instead of calling [std::fs] directly,
//! so they can run against an in-memory fake in tests.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// A file opened for writing.
pub trait ArtifactWriter: Write + Send {
    /// Flushes buffered data and waits until it is durably stored.
    fn commit(self: Box<Self>) -> io::Result<()>;
}

/// Type of a directory entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Other,
}

/// Directory entry together with the metadata the engine needs.
#[derive(Clone, Debug)]
pub struct FileEntry {
    pub path: PathBuf,
    pub kind: EntryKind,
    pub len: u64,
    pub modified: SystemTime,
}

impl FileEntry {
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

/// Filesystem collaborator.
pub trait Filesystem: Send + Sync {
    /// Creates `path` and all its parents. Succeeds if it already exists.
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Creates a new file, failing with [io::ErrorKind::AlreadyExists] if it exists.
    fn create_new(&self, path: &Path) -> io::Result<Box<dyn ArtifactWriter>>;

    /// Creates or truncates a file.
    fn create(&self, path: &Path) -> io::Result<Box<dyn ArtifactWriter>>;

    /// Opens a file for streaming reads.
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>>;

    /// Atomically replaces `to` by `from`.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Makes the entries of a directory durable, e.g. after a [rename](Filesystem::rename).
    fn sync_dir(&self, path: &Path) -> io::Result<()>;

    fn remove_file(&self, path: &Path) -> io::Result<()>;

    /// Lists the direct children of a directory.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<FileEntry>>;

    /// Metadata of `path`, [None] if it doesn't exist.
    fn metadata(&self, path: &Path) -> io::Result<Option<FileEntry>>;

    fn exists(&self, path: &Path) -> io::Result<bool> {
        Ok(self.metadata(path)?.is_some())
    }
}

/// The local disk.
#[derive(Copy, Clone, Debug, Default)]
pub struct LocalFs;

struct LocalWriter(BufWriter<File>);

impl Write for LocalWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl ArtifactWriter for LocalWriter {
    fn commit(self: Box<Self>) -> io::Result<()> {
        let file = self.0.into_inner().map_err(io::IntoInnerError::into_error)?;
        file.sync_all()
    }
}

impl Filesystem for LocalFs {
    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        // tolerates concurrent creation
        fs::create_dir_all(path)
    }

    fn create_new(&self, path: &Path) -> io::Result<Box<dyn ArtifactWriter>> {
        let file = File::create_new(path)?;
        Ok(Box::new(LocalWriter(BufWriter::new(file))))
    }

    fn create(&self, path: &Path) -> io::Result<Box<dyn ArtifactWriter>> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Box::new(LocalWriter(BufWriter::new(file))))
    }

    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(path)?))
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn sync_dir(&self, path: &Path) -> io::Result<()> {
        // directories can't be opened for syncing on Windows
        #[cfg(unix)]
        {
            File::open(path)?.sync_all()?;
        }
        #[cfg(not(unix))]
        {
            let _ = path;
        }
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<FileEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            // don't follow symlinks, they are reported as `Other`
            let metadata = entry.metadata()?;
            entries.push(to_entry(entry.path(), &metadata)?);
        }
        Ok(entries)
    }

    fn metadata(&self, path: &Path) -> io::Result<Option<FileEntry>> {
        match fs::symlink_metadata(path) {
            Ok(metadata) => to_entry(path.to_path_buf(), &metadata).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn to_entry(path: PathBuf, metadata: &fs::Metadata) -> io::Result<FileEntry> {
    let file_type = metadata.file_type();
    let kind = if file_type.is_file() {
        EntryKind::File
    } else if file_type.is_dir() {
        EntryKind::Dir
    } else {
        EntryKind::Other
    };

    Ok(FileEntry {
        path,
        kind,
        len: metadata.len(),
        modified: metadata.modified()?,
    })
}

#[cfg(test)]
pub use memory::MemoryFs;


#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    #[test]
    fn create_new_refuses_to_overwrite() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("dump.sql");

        let mut writer = LocalFs.create_new(&path).unwrap();
        writer.write_all(b"first").unwrap();
        writer.commit().unwrap();

        let err = LocalFs.create_new(&path).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(fs::read(&path).unwrap(), b"first");
    }

    #[test]
    fn read_dir_reports_kinds() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.sql"), b"abc").unwrap();
        fs::create_dir(tmp.path().join("nested")).unwrap();

        let mut entries = LocalFs.read_dir(tmp.path()).unwrap();
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, EntryKind::File);
        assert_eq!(entries[0].len, 3);
        assert_eq!(entries[1].kind, EntryKind::Dir);
    }

    #[test]
    fn metadata_of_missing_file_is_none() {
        let tmp = TempDir::new().unwrap();
        assert!(LocalFs.metadata(&tmp.path().join("nope")).unwrap().is_none());
        assert!(!LocalFs.exists(&tmp.path().join("nope")).unwrap());
    }
}
