//! Position tracking in the server's binary log.
//!
//! A [LogCursor] marks where the next incremental backup has to start. It is persisted
//! by the [CursorStore](store::CursorStore) and only ever moves forward.

pub mod store;
pub mod tracker;

use std::cmp::Ordering;
use std::fmt;

pub use store::{CursorRecord, CursorStore};
pub use tracker::{Eligible, LogCursorTracker, SegmentRange};

/// Offset of the first event in a binary log segment, right after the magic number.
pub const SEGMENT_HEADER_LEN: u64 = 4;

/// A position in the binary log: segment file name and byte offset within it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct LogCursor {
    pub segment_id: String,
    pub offset: u64,
}

impl LogCursor {
    pub fn new(segment_id: impl Into<String>, offset: u64) -> Self {
        Self {
            segment_id: segment_id.into(),
            offset,
        }
    }

    /// Start of the given segment.
    pub fn segment_start(segment_id: impl Into<String>) -> Self {
        Self::new(segment_id, SEGMENT_HEADER_LEN)
    }
}

impl fmt::Display for LogCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment_id, self.offset)
    }
}

/// Compares segment names like `binlog.000009` and `binlog.000010` by their sequence number,
/// falling back to plain string order for names without one.
fn cmp_segments(a: &str, b: &str) -> Ordering {
    fn split(name: &str) -> Option<(&str, u64)> {
        let (base, seq) = name.rsplit_once('.')?;
        Some((base, seq.parse().ok()?))
    }

    match (split(a), split(b)) {
        (Some((base_a, seq_a)), Some((base_b, seq_b))) if base_a == base_b => seq_a.cmp(&seq_b),
        _ => a.cmp(b),
    }
}

impl Ord for LogCursor {
    fn cmp(&self, other: &Self) -> Ordering {
        cmp_segments(&self.segment_id, &other.segment_id).then(self.offset.cmp(&other.offset))
    }
}

impl PartialOrd for LogCursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
