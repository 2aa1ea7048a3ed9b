//! Sequencing of a backup run.
//!
//! ```text
//! Idle -> DecidingKind -> Executing -> Compressing -> UpdatingCursor -> EnforcingRetention -> Done
//!                 \______________\______________\______________\__________> Failed
//! ```
//!
//! Each run produces exactly one [BackupOutcome], which is handed to the [Reporter].

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use derive_more::Display;

use crate::artifact::{ArtifactLayout, BackupArtifact, BackupKind, Compressor};
use crate::config::{BackupConfiguration, ConfigError};
use crate::cursor::tracker::TrackerError;
use crate::cursor::{CursorStore, Eligible, LogCursor, LogCursorTracker, SegmentRange};
use crate::error::{BackupError, ErrorKind};
use crate::executor::Executor;
use crate::fs::Filesystem;
use crate::mysql::{self, Database};
use crate::util::lock::RunLock;
use crate::util::retention::{Retention, RetentionReport};

/// States of a run.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, serde::Serialize)]
pub enum RunState {
    Idle,
    DecidingKind,
    Executing,
    Compressing,
    UpdatingCursor,
    EnforcingRetention,
    Done,
    Failed,
}

/// Overall result of a run.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    /// The artifact was written and the cursor updated.
    #[display("success")]
    Success,
    /// The artifact is safe but could not be compressed.
    #[display("partial")]
    Partial,
    /// No log segment was closed since the last incremental backup.
    #[display("skipped")]
    Skipped,
    #[display("failed")]
    Failed,
}

/// Result of one orchestration run.
#[derive(Debug)]
pub struct BackupOutcome {
    /// Kind of backup attempted, [None] for a cleanup-only run or if the run failed
    /// before the kind was decided.
    pub kind: Option<BackupKind>,
    pub status: OutcomeStatus,
    /// The artifact on disk. Also set if the run failed after it was written.
    pub artifact: Option<BackupArtifact>,
    /// The cursor persisted by this run.
    pub cursor: Option<LogCursor>,
    /// The error that made the run fail.
    pub error: Option<BackupError>,
    /// Non-fatal errors: failed compression or retention.
    pub warnings: Vec<BackupError>,
    pub retention: RetentionReport,
    /// States the run passed through, ending in [RunState::Done] or [RunState::Failed].
    pub states: Vec<RunState>,
    pub elapsed: Duration,
}

impl BackupOutcome {
    fn new(kind: Option<BackupKind>) -> Self {
        Self {
            kind,
            status: OutcomeStatus::Success,
            artifact: None,
            cursor: None,
            error: None,
            warnings: Vec::new(),
            retention: RetentionReport::default(),
            states: vec![RunState::Idle],
            elapsed: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status != OutcomeStatus::Failed
    }

    pub fn artifact_path(&self) -> Option<&Path> {
        self.artifact.as_ref().map(|a| a.path.as_path())
    }

    /// Class of the error that failed the run.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(BackupError::kind)
    }

    pub fn state(&self) -> RunState {
        self.states.last().copied().unwrap_or(RunState::Idle)
    }

    fn transition(&mut self, state: RunState) {
        log::debug!(target: "orchestrator", "{} -> {state}", self.state());
        self.states.push(state);
    }

    /// Flattened, serializable view for reporting.
    pub fn summary(&self) -> OutcomeSummary {
        OutcomeSummary {
            kind: self.kind,
            status: self.status,
            artifact: self.artifact.as_ref().map(|a| a.path.clone()),
            size: self.artifact.as_ref().map(|a| a.size),
            cursor: self.cursor.as_ref().map(ToString::to_string),
            error_kind: self.error_kind(),
            error: self.error.as_ref().map(ToString::to_string),
            warnings: self.warnings.iter().map(ToString::to_string).collect(),
            deleted: self.retention.deleted.clone(),
            state: self.state(),
            elapsed_secs: self.elapsed.as_secs_f64(),
        }
    }
}

/// Serializable summary of a [BackupOutcome].
#[derive(Debug, serde::Serialize)]
pub struct OutcomeSummary {
    pub kind: Option<BackupKind>,
    pub status: OutcomeStatus,
    pub artifact: Option<PathBuf>,
    pub size: Option<u64>,
    pub cursor: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    pub warnings: Vec<String>,
    pub deleted: Vec<PathBuf>,
    pub state: RunState,
    pub elapsed_secs: f64,
}

/// Receives the outcome of every run.
pub trait Reporter {
    fn report(&mut self, outcome: &BackupOutcome);
}

/// Relays outcomes to the `log` facade.
#[derive(Debug, Default)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&mut self, outcome: &BackupOutcome) {
        let kind = outcome
            .kind
            .map_or_else(|| "cleanup".to_string(), |k| format!("{k} backup"));
        let elapsed = outcome.elapsed.as_secs_f32();

        for warning in &outcome.warnings {
            log::warn!(target: "report", "{kind}: {warning}");
        }

        match (&outcome.status, &outcome.error) {
            (OutcomeStatus::Failed, Some(error)) => {
                log::error!(target: "report", "{kind} failed ({}) after {elapsed:.1}s: {error}", error.kind())
            }
            (OutcomeStatus::Skipped, _) => {
                log::info!(target: "report", "{kind} skipped, no closed log segment since the last run")
            }
            (status, _) => match &outcome.artifact {
                Some(artifact) => log::info!(
                    target: "report",
                    "{kind} {status} after {elapsed:.1}s: {} ({} bytes), {} expired artifact(s) deleted",
                    artifact.path.display(),
                    artifact.size,
                    outcome.retention.deleted.len()
                ),
                None => log::info!(
                    target: "report",
                    "{kind} {status} after {elapsed:.1}s, {} expired artifact(s) deleted",
                    outcome.retention.deleted.len()
                ),
            },
        }
    }
}

/// Writes one JSON line per outcome.
pub struct JsonReporter<W> {
    out: W,
}

impl<W: Write> JsonReporter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }
}

impl<W: Write> Reporter for JsonReporter<W> {
    fn report(&mut self, outcome: &BackupOutcome) {
        let written = serde_json::to_writer(&mut self.out, &outcome.summary())
            .map_err(std::io::Error::from)
            .and_then(|()| writeln!(self.out));
        if let Err(e) = written {
            log::error!(target: "report", "Writing the outcome failed: {e}");
        }
    }
}

/// Drives full, incremental and cleanup runs against one database.
pub struct Orchestrator<D, F, R> {
    config: BackupConfiguration,
    db: D,
    fs: F,
    reporter: R,
    layout: ArtifactLayout,
    compressor: Compressor,
    clock: fn() -> DateTime<Utc>,
    dry_run: bool,
}

impl<D: Database, F: Filesystem, R: Reporter> Orchestrator<D, F, R> {
    pub fn new(
        config: BackupConfiguration,
        db: D,
        fs: F,
        reporter: R,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let layout = ArtifactLayout::new(config.backup.root.clone());
        let compressor = Compressor::new(config.backup.compress);

        Ok(Self {
            config,
            db,
            fs,
            reporter,
            layout,
            compressor,
            clock: Utc::now,
            dry_run: false,
        })
    }

    /// Replaces the source of the current time.
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    /// In a dry run the plan is logged, but neither the server nor any file is changed.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn reporter(&self) -> &R {
        &self.reporter
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    /// Full backup, regardless of a stored cursor.
    pub fn run_full(&mut self) -> BackupOutcome {
        self.run(Some(BackupKind::Full))
    }

    /// Incremental backup from the stored cursor.
    pub fn run_incremental(&mut self) -> BackupOutcome {
        self.run(Some(BackupKind::Incremental))
    }

    /// Runs a backup of the `requested` kind.
    ///
    /// Without a request, the first run is a full backup and every later one incremental.
    pub fn run(&mut self, requested: Option<BackupKind>) -> BackupOutcome {
        let started = Instant::now();
        let mut outcome = BackupOutcome::new(requested);

        let result = self.backup(requested, &mut outcome);
        self.finish(&mut outcome, result, started);
        outcome
    }

    /// Retention of both artifact classes without a backup.
    pub fn cleanup(&mut self) -> BackupOutcome {
        let started = Instant::now();
        let mut outcome = BackupOutcome::new(None);

        outcome.transition(RunState::EnforcingRetention);
        self.enforce_retention(&mut outcome);
        self.finish(&mut outcome, Ok(()), started);
        outcome
    }

    fn finish(
        &mut self,
        outcome: &mut BackupOutcome,
        result: Result<(), BackupError>,
        started: Instant,
    ) {
        match result {
            Ok(()) => {
                outcome.transition(RunState::Done);
                let degraded = outcome
                    .warnings
                    .iter()
                    .any(|w| w.kind() == ErrorKind::Compression);
                if degraded && outcome.status == OutcomeStatus::Success {
                    outcome.status = OutcomeStatus::Partial;
                }
            }
            Err(e) => {
                outcome.transition(RunState::Failed);
                outcome.status = OutcomeStatus::Failed;
                outcome.error = Some(e);
            }
        }
        outcome.elapsed = started.elapsed();
        self.reporter.report(outcome);
    }

    fn backup(
        &self,
        requested: Option<BackupKind>,
        outcome: &mut BackupOutcome,
    ) -> Result<(), BackupError> {
        let root = self.layout.root();
        let database = self.db.name();
        let tracker = LogCursorTracker::new(&self.db);
        let store = CursorStore::new(&self.fs, root, database);

        outcome.transition(RunState::DecidingKind);
        let lock = if self.dry_run {
            None
        } else {
            Some(RunLock::acquire(&self.fs, root, database)?)
        };

        let stored = store.load()?;
        let kind = requested.unwrap_or(match stored {
            None => BackupKind::Full,
            Some(_) => BackupKind::Incremental,
        });
        outcome.kind = Some(kind);
        log::info!(target: "orchestrator", "Starting {kind} backup of database '{database}'");

        if self.dry_run {
            log::warn!(target: "orchestrator", "Dry run: would create a {kind} backup in {}", self.layout.dir(kind).display());
            if let Some(stored) = &stored {
                log::info!(target: "orchestrator", "Dry run: stored cursor is {}", stored.cursor);
            }
            outcome.transition(RunState::EnforcingRetention);
            self.enforce_retention(outcome);
            return Ok(());
        }

        // plan the export
        let (range, record_coordinates) = match kind {
            BackupKind::Full => (None, self.binary_logging(&tracker)?),
            BackupKind::Incremental => {
                let stored = stored.ok_or_else(|| BackupError::NoBaseline(database.to_string()))?;
                // fails on disabled logging before anything else happens
                tracker.current_position()?;
                tracker.advance_flush()?;
                match tracker.segments_since(&stored.cursor)? {
                    Eligible::Nothing => {
                        log::info!(target: "orchestrator", "No closed log segment since {}", stored.cursor);
                        outcome.status = OutcomeStatus::Skipped;
                        drop(lock);
                        outcome.transition(RunState::EnforcingRetention);
                        self.enforce_retention(outcome);
                        return Ok(());
                    }
                    Eligible::Segments(range) => (Some(range), false),
                }
            }
        };

        outcome.transition(RunState::Executing);
        let now = (self.clock)();
        let dest = self.layout.artifact_path(&self.fs, kind, now)?;
        let executor = Executor::new(&self.fs, self.config.timeout());
        let artifact = match &range {
            None => executor.full(&self.db, record_coordinates, &dest, now)?,
            Some(range) => executor.incremental(&self.db, range, &dest, now)?,
        };
        outcome.artifact = Some(artifact.clone());

        let stored = self.store_artifact(&store, artifact, range, record_coordinates, outcome);
        drop(lock);

        // the artifact exists, so expired ones are deleted even if the cursor is stale
        outcome.transition(RunState::EnforcingRetention);
        self.enforce_retention(outcome);

        stored
    }

    /// Compresses the artifact and moves the cursor past it.
    fn store_artifact(
        &self,
        store: &CursorStore<'_, F>,
        artifact: BackupArtifact,
        range: Option<SegmentRange>,
        record_coordinates: bool,
        outcome: &mut BackupOutcome,
    ) -> Result<(), BackupError> {
        let next_cursor = match range {
            Some(range) => Ok(Some(range.next)),
            // read while the dump is still plain text
            None if record_coordinates => self.dump_coordinates(&artifact.path).map(Some),
            None => Ok(None),
        };

        self.compress(artifact, outcome);

        if let Some(cursor) = next_cursor? {
            outcome.transition(RunState::UpdatingCursor);
            let record = store.persist(&cursor, (self.clock)())?;
            outcome.cursor = Some(record.cursor);
        }
        Ok(())
    }

    /// Whether the server writes a binary log a full backup can record its position in.
    fn binary_logging(&self, tracker: &LogCursorTracker<'_, D>) -> Result<bool, BackupError> {
        match tracker.current_position() {
            Ok(position) => {
                log::debug!(target: "orchestrator", "Binary log is at {position} before the dump");
                Ok(true)
            }
            Err(TrackerError::LoggingDisabled) => {
                log::warn!(target: "orchestrator", "Binary logging is disabled, no cursor is recorded for incremental backups");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Log position noted by `mysqldump` in the header of the plain full dump.
    fn dump_coordinates(&self, path: &Path) -> Result<LogCursor, BackupError> {
        let coordinates = self
            .fs
            .open(path)
            .and_then(mysql::dump_coordinates);
        match coordinates {
            Ok(Some(cursor)) => {
                log::debug!(target: "orchestrator", "Dump was taken at {cursor}");
                Ok(cursor)
            }
            Ok(None) => Err(BackupError::DumpCoordinates(path.to_path_buf())),
            Err(e) => {
                log::warn!(target: "orchestrator", "Reading the header of {} failed: {e}", path.display());
                Err(BackupError::DumpCoordinates(path.to_path_buf()))
            }
        }
    }

    /// Compresses the artifact, keeping the plain one if that fails.
    fn compress(&self, artifact: BackupArtifact, outcome: &mut BackupOutcome) {
        if !self.compressor.is_enabled() {
            return;
        }

        outcome.transition(RunState::Compressing);
        match self.compressor.compress(&self.fs, &artifact) {
            Ok(compressed) => outcome.artifact = Some(compressed),
            Err(e) => {
                log::warn!(target: "orchestrator", "Keeping uncompressed artifact: {e}");
                outcome.warnings.push(e.into());
            }
        }
    }

    /// Applies the retention windows of both classes independently.
    fn enforce_retention(&self, outcome: &mut BackupOutcome) {
        let now = (self.clock)();
        let windows = [
            (BackupKind::Full, self.config.full_retention()),
            (BackupKind::Incremental, self.config.incremental_retention()),
        ];

        for (kind, max_age) in windows {
            let dir = self.layout.dir(kind);
            log::debug!(target: "orchestrator", "Enforcing retention of {} days on {}", max_age.num_days(), dir.display());
            let report = Retention::new(max_age).enforce(&self.fs, &dir, now, self.dry_run);
            let report = std::mem::take(&mut outcome.retention).merge(report);
            outcome.retention = report;
        }

        if !outcome.retention.is_clean() {
            for failure in &outcome.retention.failures {
                log::warn!(target: "orchestrator", "Retention: {failure}");
            }
            outcome
                .warnings
                .push(BackupError::Retention(outcome.retention.failures.len()));
        }
    }
}
