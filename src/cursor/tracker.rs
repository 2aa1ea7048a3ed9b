//! Decides which binary log segments an incremental backup has to export.

use derive_more::{Display, Error, From};

use crate::cursor::LogCursor;
use crate::error::ErrorKind;
use crate::mysql::{Database, DbError};

#[derive(Debug, Display, Error, From)]
pub enum TrackerError {
    /// The server query failed.
    #[display("{_0}")]
    #[from]
    Db(DbError),
    /// The server doesn't write a binary log.
    #[display("Binary logging is disabled on the server")]
    LoggingDisabled,
    /// The stored cursor points to a segment the server no longer has.
    #[display("Segment '{segment}' of the stored cursor no longer exists on the server")]
    SegmentMissing { segment: String },
}

impl TrackerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Db(e) => e.kind(),
            Self::LoggingDisabled | Self::SegmentMissing { .. } => ErrorKind::Configuration,
        }
    }
}

/// Closed segments to export for one incremental backup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentRange {
    /// Segments in chronological order. The last one is the boundary.
    pub segments: Vec<String>,
    /// Offset in the first segment to start the export at.
    pub start_offset: u64,
    /// Cursor after a successful export: start of the active segment.
    pub next: LogCursor,
}

impl SegmentRange {
    /// The most recently closed segment.
    pub fn boundary(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or_default()
    }
}

/// Result of [LogCursorTracker::segments_since].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Eligible {
    /// No segment was closed since the cursor.
    Nothing,
    Segments(SegmentRange),
}

/// Reads and advances the binary log position of the server.
pub struct LogCursorTracker<'a, D: ?Sized> {
    db: &'a D,
}

impl<'a, D: Database + ?Sized> LogCursorTracker<'a, D> {
    pub fn new(db: &'a D) -> Self {
        Self { db }
    }

    /// Current write position of the server.
    ///
    /// Fails with [TrackerError::LoggingDisabled] instead of returning a made up position.
    pub fn current_position(&self) -> Result<LogCursor, TrackerError> {
        match self.db.master_status() {
            Ok(Some(cursor)) => {
                log::trace!(target: "cursor::tracker", "Current log position {cursor}");
                Ok(cursor)
            }
            Ok(None) | Err(DbError::LoggingDisabled) => Err(TrackerError::LoggingDisabled),
            Err(e) => Err(e.into()),
        }
    }

    /// Rolls the server over to a new segment so the previous one can be copied safely.
    pub fn advance_flush(&self) -> Result<(), TrackerError> {
        match self.db.flush_logs() {
            Ok(()) => {
                log::debug!(target: "cursor::tracker", "Flushed binary logs of the server");
                Ok(())
            }
            Err(DbError::LoggingDisabled) => Err(TrackerError::LoggingDisabled),
            Err(e) => Err(e.into()),
        }
    }

    /// Segments written since `previous`, up to the most recently closed one.
    ///
    /// The last listed segment is the active one and is never selected. Call
    /// [advance_flush](Self::advance_flush) first, otherwise writes since the last
    /// rotation are not covered.
    pub fn segments_since(&self, previous: &LogCursor) -> Result<Eligible, TrackerError> {
        let segments = match self.db.binary_logs() {
            Ok(segments) => segments,
            Err(DbError::LoggingDisabled) => return Err(TrackerError::LoggingDisabled),
            Err(e) => return Err(e.into()),
        };
        log::trace!(target: "cursor::tracker", "Server lists {} segment(s)", segments.len());

        let start = segments
            .iter()
            .position(|segment| *segment == previous.segment_id)
            .ok_or_else(|| TrackerError::SegmentMissing {
                segment: previous.segment_id.clone(),
            })?;

        let since = &segments[start..];
        let Some((active, closed)) = since.split_last() else {
            return Ok(Eligible::Nothing);
        };
        if closed.is_empty() {
            log::debug!(target: "cursor::tracker", "No segment closed since {previous}");
            return Ok(Eligible::Nothing);
        }

        let range = SegmentRange {
            segments: closed.to_vec(),
            start_offset: previous.offset,
            next: LogCursor::segment_start(active.clone()),
        };
        log::debug!(
            target: "cursor::tracker",
            "Selected {} segment(s) from {previous} up to {}",
            range.segments.len(),
            range.boundary()
        );
        Ok(Eligible::Segments(range))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::RefCell;

    use crate::mysql::ToolInvocation;

    /// Server whose binary log is a list of segment names.
    struct FakeServer {
        segments: RefCell<Vec<String>>,
        offset: u64,
        logging: bool,
        reachable: bool,
    }

    impl FakeServer {
        fn with_segments(segments: &[&str]) -> Self {
            Self {
                segments: RefCell::new(segments.iter().map(|s| s.to_string()).collect()),
                offset: 157,
                logging: true,
                reachable: true,
            }
        }

        fn check(&self) -> Result<(), DbError> {
            if !self.reachable {
                return Err(DbError::Unreachable {
                    stderr: "ERROR 2003 (HY000): Can't connect".into(),
                });
            }
            if !self.logging {
                return Err(DbError::LoggingDisabled);
            }
            Ok(())
        }
    }

    impl Database for FakeServer {
        fn name(&self) -> &str {
            "shop"
        }

        fn master_status(&self) -> Result<Option<LogCursor>, DbError> {
            if !self.reachable {
                self.check()?;
            }
            if !self.logging {
                return Ok(None);
            }
            let segments = self.segments.borrow();
            Ok(segments.last().map(|s| LogCursor::new(s.clone(), self.offset)))
        }

        fn binary_logs(&self) -> Result<Vec<String>, DbError> {
            self.check()?;
            Ok(self.segments.borrow().clone())
        }

        fn flush_logs(&self) -> Result<(), DbError> {
            self.check()?;
            let mut segments = self.segments.borrow_mut();
            let next = format!("binlog.{:06}", segments.len() + 1);
            segments.push(next);
            Ok(())
        }

        fn full_dump(&self, _record_coordinates: bool) -> ToolInvocation {
            ToolInvocation::new("true")
        }

        fn log_export(&self, _range: &SegmentRange) -> ToolInvocation {
            ToolInvocation::new("true")
        }
    }

    #[test]
    fn active_segment_is_never_selected() {
        let server = FakeServer::with_segments(&["a", "b", "c"]);
        let tracker = LogCursorTracker::new(&server);

        let Eligible::Segments(range) = tracker.segments_since(&LogCursor::new("b", 900)).unwrap()
        else {
            panic!("segment b should be eligible");
        };

        assert_eq!(range.boundary(), "b");
        assert_eq!(range.segments, ["b"]);
        assert_eq!(range.start_offset, 900);
        assert_eq!(range.next, LogCursor::segment_start("c"));
    }

    #[test]
    fn range_starts_at_the_cursor_segment() {
        let server = FakeServer::with_segments(&["a", "b", "c"]);
        let tracker = LogCursorTracker::new(&server);

        let Eligible::Segments(range) = tracker.segments_since(&LogCursor::new("a", 4)).unwrap()
        else {
            panic!("segments a and b should be eligible");
        };

        assert_eq!(range.segments, ["a", "b"]);
        assert_eq!(range.boundary(), "b");
    }

    #[test]
    fn nothing_eligible_without_a_closed_segment() {
        let server = FakeServer::with_segments(&["a", "b"]);
        let tracker = LogCursorTracker::new(&server);

        assert_eq!(
            tracker.segments_since(&LogCursor::new("b", 157)).unwrap(),
            Eligible::Nothing
        );
    }

    #[test]
    fn flush_closes_the_active_segment() {
        let server = FakeServer::with_segments(&["binlog.000001"]);
        let tracker = LogCursorTracker::new(&server);
        let cursor = tracker.current_position().unwrap();

        tracker.advance_flush().unwrap();
        let Eligible::Segments(range) = tracker.segments_since(&cursor).unwrap() else {
            panic!("flushed segment should be eligible");
        };

        assert_eq!(range.segments, ["binlog.000001"]);
        assert_eq!(range.next, LogCursor::segment_start("binlog.000002"));
    }

    #[test]
    fn vanished_segment_is_distinct_from_nothing_eligible() {
        let server = FakeServer::with_segments(&["binlog.000007", "binlog.000008"]);
        let tracker = LogCursorTracker::new(&server);

        let err = tracker
            .segments_since(&LogCursor::new("binlog.000002", 4))
            .unwrap_err();

        assert!(matches!(err, TrackerError::SegmentMissing { .. }));
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn disabled_logging_fails_explicitly() {
        let mut server = FakeServer::with_segments(&[]);
        server.logging = false;
        let tracker = LogCursorTracker::new(&server);

        let err = tracker.current_position().unwrap_err();
        assert!(matches!(err, TrackerError::LoggingDisabled));
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn unreachable_server_is_a_connectivity_error() {
        let mut server = FakeServer::with_segments(&["a"]);
        server.reachable = false;
        let tracker = LogCursorTracker::new(&server);

        assert_eq!(
            tracker.current_position().unwrap_err().kind(),
            ErrorKind::Connectivity
        );
    }
}
