use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, TimeDelta, Utc};
use derive_more::{Display, Error};

use crate::fs::Filesystem;

/// An artifact that could not be deleted, or a directory that could not be listed.
#[derive(Debug, Display, Error)]
#[display("{}: {source}", path.display())]
pub struct RetentionFailure {
    pub path: PathBuf,
    pub source: std::io::Error,
}

/// Result of a retention pass over one directory.
#[derive(Debug, Default)]
pub struct RetentionReport {
    /// Files deleted because they exceeded the retention window.
    pub deleted: Vec<PathBuf>,
    /// Files younger than the retention window.
    pub kept: Vec<PathBuf>,
    /// Deletions that failed. The pass continued after each of them.
    pub failures: Vec<RetentionFailure>,
}

impl RetentionReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Combines the reports of several directories.
    pub fn merge(mut self, other: RetentionReport) -> Self {
        self.deleted.extend(other.deleted);
        self.kept.extend(other.kept);
        self.failures.extend(other.failures);
        self
    }
}

/// Deletes the artifacts of one class once they are older than `max_age`.
#[derive(Copy, Clone, Debug)]
pub struct Retention {
    pub max_age: TimeDelta,
}

impl Retention {
    pub fn new(max_age: TimeDelta) -> Self {
        Self { max_age }
    }

    /// Returns whether a file last modified at `modified` is still to be kept at `now`.
    pub fn retain(&self, modified: SystemTime, now: DateTime<Utc>) -> bool {
        let modified = DateTime::<Utc>::from(modified);
        now.signed_duration_since(modified) <= self.max_age
    }

    /// Deletes every regular file directly in `dir` that exceeded the retention window.
    ///
    /// Subdirectories are left alone. A missing `dir` yields an empty report.
    pub fn enforce(
        &self,
        fs: &impl Filesystem,
        dir: &Path,
        now: DateTime<Utc>,
        dry_run: bool,
    ) -> RetentionReport {
        let mut report = RetentionReport::default();

        let mut entries = match fs.read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!(target: "retention", "{} doesn't exist, nothing to clean up", dir.display());
                return report;
            }
            Err(source) => {
                log::error!(target: "retention", "Listing {} failed: {source}", dir.display());
                report.failures.push(RetentionFailure {
                    path: dir.to_path_buf(),
                    source,
                });
                return report;
            }
        };
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        for entry in entries.into_iter().filter(|e| e.is_file()) {
            if self.retain(entry.modified, now) {
                report.kept.push(entry.path);
                continue;
            }

            if dry_run {
                log::info!(target: "retention", "Would delete expired {}", entry.path.display());
                report.deleted.push(entry.path);
                continue;
            }

            match fs.remove_file(&entry.path) {
                Ok(()) => {
                    log::info!(target: "retention", "Deleted expired {}", entry.path.display());
                    report.deleted.push(entry.path);
                }
                Err(source) => {
                    log::warn!(target: "retention", "Deleting {} failed: {source}", entry.path.display());
                    report.failures.push(RetentionFailure {
                        path: entry.path,
                        source,
                    });
                }
            }
        }

        log::debug!(
            target: "retention",
            "{}: {} deleted, {} kept, {} failed",
            dir.display(),
            report.deleted.len(),
            report.kept.len(),
            report.failures.len()
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs::File;
    use std::time::Duration;

    use chrono::TimeZone;
    use tempfile::TempDir;

    use crate::fs::{LocalFs, MemoryFs};

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 2, 0, 0).unwrap()
    }

    fn days_ago(days: u32) -> SystemTime {
        SystemTime::from(now()) - DAY * days
    }

    #[test]
    fn only_artifacts_older_than_the_window_are_deleted() {
        let tmp = TempDir::new().unwrap();
        for days in [1, 5, 10, 40] {
            let file = File::create(tmp.path().join(format!("{days}.sql.gz"))).unwrap();
            file.set_modified(days_ago(days)).unwrap();
        }

        let report = Retention::new(TimeDelta::days(7)).enforce(&LocalFs, tmp.path(), now(), false);

        let names = |paths: &[PathBuf]| -> Vec<String> {
            paths
                .iter()
                .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
                .collect()
        };
        assert_eq!(names(&report.deleted), ["10.sql.gz", "40.sql.gz"]);
        assert_eq!(names(&report.kept), ["1.sql.gz", "5.sql.gz"]);
        assert!(report.is_clean());
        assert!(tmp.path().join("1.sql.gz").exists());
        assert!(tmp.path().join("5.sql.gz").exists());
        assert!(!tmp.path().join("10.sql.gz").exists());
        assert!(!tmp.path().join("40.sql.gz").exists());
    }

    #[test]
    fn subdirectories_are_not_touched() {
        let tmp = TempDir::new().unwrap();
        let nested = tmp.path().join("nested");
        std::fs::create_dir(&nested).unwrap();
        File::create(nested.join("old.sql"))
            .unwrap()
            .set_modified(days_ago(100))
            .unwrap();

        let report = Retention::new(TimeDelta::days(7)).enforce(&LocalFs, tmp.path(), now(), false);

        assert!(report.deleted.is_empty());
        assert!(nested.join("old.sql").exists());
    }

    #[test]
    fn failed_deletion_does_not_stop_the_pass() {
        let fs = MemoryFs::default();
        fs.create_dir_all(Path::new("/backup/full")).unwrap();
        fs.put("/backup/full/a.sql.gz", b"a", days_ago(30));
        fs.put("/backup/full/b.sql.gz", b"b", days_ago(30));
        fs.put("/backup/full/c.sql.gz", b"c", days_ago(30));
        fs.fail_removal_of("/backup/full/a.sql.gz");

        let report = Retention::new(TimeDelta::days(7)).enforce(
            &fs,
            Path::new("/backup/full"),
            now(),
            false,
        );

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, PathBuf::from("/backup/full/a.sql.gz"));
        assert_eq!(report.deleted.len(), 2);
        assert_eq!(fs.files(), vec![PathBuf::from("/backup/full/a.sql.gz")]);
    }

    #[test]
    fn dry_run_deletes_nothing() {
        let fs = MemoryFs::default();
        fs.put("/backup/full/a.sql.gz", b"a", days_ago(30));

        let report = Retention::new(TimeDelta::days(7)).enforce(
            &fs,
            Path::new("/backup/full"),
            now(),
            true,
        );

        assert_eq!(report.deleted.len(), 1);
        assert_eq!(fs.files().len(), 1);
    }

    #[test]
    fn missing_directory_is_empty() {
        let report = Retention::new(TimeDelta::days(7)).enforce(
            &MemoryFs::default(),
            Path::new("/backup/full"),
            now(),
            false,
        );

        assert!(report.deleted.is_empty());
        assert!(report.is_clean());
    }
}
