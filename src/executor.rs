//! Runs the dump and export tools and streams their output into artifacts.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use derive_more::{Display, Error};

use crate::artifact::{BackupArtifact, BackupKind};
use crate::cursor::SegmentRange;
use crate::error::ErrorKind;
use crate::fs::{ArtifactWriter, Filesystem};
use crate::mysql::{is_connection_failure, Database, ToolInvocation};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Display, Error)]
pub enum ExecError {
    /// The tool could not be started.
    #[display("Running {tool} failed: {source}")]
    Spawn { tool: String, source: io::Error },
    /// The artifact file could not be created.
    #[display("Creating {} failed: {source}", path.display())]
    Create { path: PathBuf, source: io::Error },
    /// The tool couldn't connect to the server.
    #[display("{tool} could not reach the server: {stderr}")]
    Unreachable { tool: String, stderr: String },
    /// The tool exited unsuccessfully.
    #[display("{tool} failed with {status}: {stderr}")]
    ToolFailed {
        tool: String,
        status: ExitStatus,
        stderr: String,
    },
    /// The tool exited successfully but reported errors.
    #[display("{tool} reported errors: {stderr}")]
    ErrorOutput { tool: String, stderr: String },
    /// The tool didn't finish in time and was killed.
    #[display("{tool} timed out after {}s", after.as_secs_f32())]
    TimedOut { tool: String, after: Duration },
    /// Writing the artifact failed.
    #[display("Writing {} failed: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
    /// Waiting for the tool failed.
    #[display("Waiting for {tool} failed: {source}")]
    Wait { tool: String, source: io::Error },
}

impl ExecError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Spawn { source, .. } if source.kind() == io::ErrorKind::NotFound => {
                ErrorKind::Configuration
            }
            Self::Unreachable { .. } => ErrorKind::Connectivity,
            _ => ErrorKind::Execution,
        }
    }
}

/// Runs the tools of a [Database] as child processes.
///
/// Output goes straight into the artifact file. A failed run leaves no file behind.
pub struct Executor<'a, F: Filesystem> {
    fs: &'a F,
    timeout: Option<Duration>,
}

impl<'a, F: Filesystem> Executor<'a, F> {
    pub fn new(fs: &'a F, timeout: Option<Duration>) -> Self {
        Self { fs, timeout }
    }

    /// Full logical dump of the database into `dest`.
    pub fn full<D: Database + ?Sized>(
        &self,
        db: &D,
        record_coordinates: bool,
        dest: &Path,
        created: DateTime<Utc>,
    ) -> Result<BackupArtifact, ExecError> {
        let invocation = db.full_dump(record_coordinates);
        self.execute(BackupKind::Full, &invocation, dest, created)
    }

    /// Export of the binary log segments of `range` into `dest`.
    pub fn incremental<D: Database + ?Sized>(
        &self,
        db: &D,
        range: &SegmentRange,
        dest: &Path,
        created: DateTime<Utc>,
    ) -> Result<BackupArtifact, ExecError> {
        let invocation = db.log_export(range);
        self.execute(BackupKind::Incremental, &invocation, dest, created)
    }

    /// Runs `invocation` and writes its stdout to the new file `dest`.
    pub fn execute(
        &self,
        kind: BackupKind,
        invocation: &ToolInvocation,
        dest: &Path,
        created: DateTime<Utc>,
    ) -> Result<BackupArtifact, ExecError> {
        log::info!(target: "executor", "Creating {kind} backup at {}", dest.display());
        log::trace!(target: "executor", "Running: {invocation}");

        let writer = self.fs.create_new(dest).map_err(|source| ExecError::Create {
            path: dest.to_path_buf(),
            source,
        })?;

        match self.stream(invocation, writer, dest) {
            Ok(size) => {
                log::info!(target: "executor", "Finished {kind} backup ({size} bytes)");
                Ok(BackupArtifact {
                    kind,
                    created,
                    path: dest.to_path_buf(),
                    compressed: false,
                    size,
                })
            }
            Err(e) => {
                match self.fs.remove_file(dest) {
                    Ok(()) => {
                        log::debug!(target: "executor", "Removed partial artifact {}", dest.display())
                    }
                    Err(remove_err) if remove_err.kind() == io::ErrorKind::NotFound => {}
                    Err(remove_err) => {
                        log::error!(target: "executor", "Removing partial artifact {} failed: {remove_err}", dest.display())
                    }
                }
                Err(e)
            }
        }
    }

    fn stream(
        &self,
        invocation: &ToolInvocation,
        mut writer: Box<dyn ArtifactWriter>,
        dest: &Path,
    ) -> Result<u64, ExecError> {
        let tool = invocation.program().display().to_string();

        let mut command = invocation.command();
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // own process group, so a timeout can take down the tool's children as well
            command.process_group(0);
        }

        let mut child = command.spawn().map_err(|source| ExecError::Spawn {
            tool: tool.clone(),
            source,
        })?;

        let (Some(mut stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take())
        else {
            terminate(&mut child);
            return Err(ExecError::Wait {
                tool,
                source: io::Error::other("stdio of the child is not piped"),
            });
        };

        let (status, copied, error_output) = thread::scope(|s| {
            // pipes are drained concurrently, a full stderr pipe would block the tool otherwise
            let copy = s.spawn(move || -> io::Result<u64> {
                let size = io::copy(&mut stdout, &mut writer)?;
                writer.commit()?;
                Ok(size)
            });
            let errors = s.spawn(move || -> io::Result<Vec<u8>> {
                let mut buf = Vec::new();
                stderr.read_to_end(&mut buf)?;
                Ok(buf)
            });

            let status = self.wait(&mut child, &tool);
            let copied = copy
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("output copy thread panicked")));
            let error_output = errors.join().ok().and_then(Result::ok).unwrap_or_default();

            (status, copied, error_output)
        });

        let status = status?;
        let stderr = String::from_utf8_lossy(&error_output).trim().to_string();

        if !status.success() {
            return Err(if is_connection_failure(&stderr) {
                ExecError::Unreachable { tool, stderr }
            } else {
                ExecError::ToolFailed {
                    tool,
                    status,
                    stderr,
                }
            });
        }

        let size = copied.map_err(|source| ExecError::Write {
            path: dest.to_path_buf(),
            source,
        })?;

        if !stderr.is_empty() {
            return Err(if is_connection_failure(&stderr) {
                ExecError::Unreachable { tool, stderr }
            } else {
                ExecError::ErrorOutput { tool, stderr }
            });
        }

        Ok(size)
    }

    fn wait(&self, child: &mut Child, tool: &str) -> Result<ExitStatus, ExecError> {
        let wait_err = |source| ExecError::Wait {
            tool: tool.to_string(),
            source,
        };

        let Some(timeout) = self.timeout else {
            return child.wait().map_err(wait_err);
        };

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait().map_err(wait_err)? {
                return Ok(status);
            }

            let now = Instant::now();
            if now >= deadline {
                log::warn!(target: "executor", "{tool} exceeded the timeout of {}s, terminating", timeout.as_secs());
                terminate(child);
                if let Err(e) = child.wait() {
                    log::warn!(target: "executor", "Reaping {tool} failed: {e}");
                }
                return Err(ExecError::TimedOut {
                    tool: tool.to_string(),
                    after: timeout,
                });
            }

            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }
}

/// Kills the child together with its process group.
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        let group = format!("-{}", child.id());
        match std::process::Command::new("kill")
            .args(["-KILL", "--", &group])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) if status.success() => return,
            Ok(status) => {
                log::debug!(target: "executor", "Killing process group {group} failed with {status}")
            }
            Err(e) => log::debug!(target: "executor", "Killing process group {group} failed: {e}"),
        }
    }

    if let Err(e) = child.kill() {
        log::warn!(target: "executor", "Killing child {} failed: {e}", child.id());
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    use tempfile::TempDir;

    use crate::fs::LocalFs;

    fn sh(script: &str) -> ToolInvocation {
        ToolInvocation::new("sh").args(["-c", script])
    }

    fn files(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect()
    }

    #[test]
    fn output_is_streamed_into_the_artifact() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("dump.sql");
        let executor = Executor::new(&LocalFs, None);

        let artifact = executor
            .execute(
                BackupKind::Full,
                &sh("printf 'CREATE TABLE t (id INT);\\n'"),
                &dest,
                Utc::now(),
            )
            .unwrap();

        assert_eq!(artifact.path, dest);
        assert!(!artifact.compressed);
        assert_eq!(std::fs::read(&dest).unwrap(), b"CREATE TABLE t (id INT);\n");
        assert_eq!(artifact.size, 25);
    }

    #[test]
    fn large_output_does_not_block() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("dump.sql");
        let executor = Executor::new(&LocalFs, Some(Duration::from_secs(30)));

        let artifact = executor
            .execute(
                BackupKind::Incremental,
                &sh("head -c 4000000 /dev/zero"),
                &dest,
                Utc::now(),
            )
            .unwrap();

        assert_eq!(artifact.size, 4_000_000);
    }

    #[test]
    fn non_zero_exit_leaves_no_artifact() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("dump.sql");
        let executor = Executor::new(&LocalFs, None);

        let err = executor
            .execute(
                BackupKind::Full,
                &sh("printf 'CREATE TABLE'; echo 'mysqldump: Error 1044: Access denied' >&2; exit 2"),
                &dest,
                Utc::now(),
            )
            .unwrap_err();

        assert!(matches!(err, ExecError::ToolFailed { .. }), "{err}");
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert!(files(tmp.path()).is_empty());
    }

    #[test]
    fn error_output_fails_a_successful_exit() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("dump.sql");
        let executor = Executor::new(&LocalFs, None);

        let err = executor
            .execute(
                BackupKind::Full,
                &sh("printf 'data'; echo 'mysqldump: Couldn'\\''t execute SHOW' >&2"),
                &dest,
                Utc::now(),
            )
            .unwrap_err();

        assert!(matches!(err, ExecError::ErrorOutput { .. }), "{err}");
        assert!(files(tmp.path()).is_empty());
    }

    #[test]
    fn connection_failure_is_classified() {
        let tmp = TempDir::new().unwrap();
        let executor = Executor::new(&LocalFs, None);

        let err = executor
            .execute(
                BackupKind::Full,
                &sh("echo 'mysqldump: Got error: 2002: Cannot connect' >&2; exit 2"),
                &tmp.path().join("dump.sql"),
                Utc::now(),
            )
            .unwrap_err();

        assert!(matches!(err, ExecError::Unreachable { .. }), "{err}");
        assert_eq!(err.kind(), ErrorKind::Connectivity);
    }

    #[test]
    fn hanging_tool_is_killed_on_timeout() {
        let tmp = TempDir::new().unwrap();
        let executor = Executor::new(&LocalFs, Some(Duration::from_millis(200)));
        let started = Instant::now();

        let err = executor
            .execute(
                BackupKind::Full,
                &sh("printf 'partial'; exec sleep 30"),
                &tmp.path().join("dump.sql"),
                Utc::now(),
            )
            .unwrap_err();

        assert!(matches!(err, ExecError::TimedOut { .. }), "{err}");
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert!(started.elapsed() < Duration::from_secs(20));
        assert!(files(tmp.path()).is_empty());
    }

    #[test]
    fn missing_tool_is_a_configuration_error() {
        let tmp = TempDir::new().unwrap();
        let executor = Executor::new(&LocalFs, None);

        let err = executor
            .execute(
                BackupKind::Full,
                &ToolInvocation::new("/nonexistent/mysqldump"),
                &tmp.path().join("dump.sql"),
                Utc::now(),
            )
            .unwrap_err();

        assert!(matches!(err, ExecError::Spawn { .. }), "{err}");
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(files(tmp.path()).is_empty());
    }
}
