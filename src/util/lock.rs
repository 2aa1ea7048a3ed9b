//! Advisory lock preventing concurrent runs against the same database.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use derive_more::{Display, Error};

use crate::error::ErrorKind;
use crate::fs::Filesystem;

#[derive(Debug, Display, Error)]
pub enum LockError {
    /// Another run holds the lock.
    #[display("{} is held by {holder}", path.display())]
    Held { path: PathBuf, holder: String },
    /// The lock file could not be written.
    #[display("Creating lock {} failed: {source}", path.display())]
    Create { path: PathBuf, source: io::Error },
}

impl LockError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Held { .. } => ErrorKind::Busy,
            Self::Create { .. } => ErrorKind::Configuration,
        }
    }
}

/// Lock file `<root>/.<database>.lock`, removed again on drop.
///
/// A lock left behind by a crashed run has to be removed by hand.
pub struct RunLock<'a, F: Filesystem> {
    fs: &'a F,
    path: PathBuf,
}

impl<'a, F: Filesystem> RunLock<'a, F> {
    pub fn path_for(root: &Path, database: &str) -> PathBuf {
        root.join(format!(".{database}.lock"))
    }

    pub fn acquire(fs: &'a F, root: &Path, database: &str) -> Result<Self, LockError> {
        let path = Self::path_for(root, database);
        let create_err = |source| LockError::Create {
            path: path.clone(),
            source,
        };

        fs.create_dir_all(root).map_err(create_err)?;
        let mut writer = match fs.create_new(&path) {
            Ok(writer) => writer,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let holder = read_holder(fs, &path);
                return Err(LockError::Held {
                    path: path.clone(),
                    holder,
                });
            }
            Err(e) => return Err(create_err(e)),
        };

        let written = writeln!(writer, "{}", std::process::id()).and_then(|()| writer.commit());
        if let Err(e) = written {
            let _ = fs.remove_file(&path);
            return Err(create_err(e));
        }
        log::debug!(target: "lock", "Acquired {}", path.display());

        Ok(Self { fs, path })
    }
}

fn read_holder(fs: &impl Filesystem, path: &Path) -> String {
    let mut holder = String::new();
    match fs.open(path).and_then(|mut r| r.read_to_string(&mut holder)) {
        Ok(_) if !holder.trim().is_empty() => format!("process {}", holder.trim()),
        _ => "an unknown process".to_string(),
    }
}

impl<F: Filesystem> Drop for RunLock<'_, F> {
    fn drop(&mut self) {
        match self.fs.remove_file(&self.path) {
            Ok(()) => log::debug!(target: "lock", "Released {}", self.path.display()),
            Err(e) => log::error!(target: "lock", "Releasing {} failed: {e}", self.path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::fs::MemoryFs;

    #[test]
    fn second_acquire_is_busy() {
        let fs = MemoryFs::default();
        let root = Path::new("/backup");

        let lock = RunLock::acquire(&fs, root, "shop").unwrap();
        let err = RunLock::acquire(&fs, root, "shop").err().unwrap();

        assert_eq!(err.kind(), ErrorKind::Busy);
        assert!(err.to_string().contains(&std::process::id().to_string()));

        // other databases are independent
        let other = RunLock::acquire(&fs, root, "crm").unwrap();
        drop(other);
        drop(lock);
    }

    #[test]
    fn lock_is_released_on_drop() {
        let fs = MemoryFs::default();
        let root = Path::new("/backup");

        drop(RunLock::acquire(&fs, root, "shop").unwrap());

        assert!(fs.files().is_empty());
        assert!(RunLock::acquire(&fs, root, "shop").is_ok());
    }
}
