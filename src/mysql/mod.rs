//! Access to the MySQL server.
//!
//! The engine only talks to the server through the [Database] trait: a handful of
//! administrative queries around the binary log and two dump invocations that stream
//! their output to stdout. [MySql] implements it with the stock client tools.

mod client;

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::Command;
use std::sync::LazyLock;

use derive_more::{Display, Error};
use regex::Regex;

use crate::cursor::tracker::SegmentRange;
use crate::cursor::LogCursor;
use crate::error::ErrorKind;

pub use client::MySql;

/// Database collaborator of the engine.
pub trait Database {
    /// Name of the backed up schema.
    fn name(&self) -> &str;

    /// Current binary log file and offset, [None] if binary logging is disabled.
    fn master_status(&self) -> Result<Option<LogCursor>, DbError>;

    /// Binary log segments known to the server, oldest first.
    fn binary_logs(&self) -> Result<Vec<String>, DbError>;

    /// Closes the active binary log segment and opens a new one.
    fn flush_logs(&self) -> Result<(), DbError>;

    /// Logical dump of the whole schema to stdout.
    ///
    /// With `record_coordinates` the dump rolls the binary log over and notes the
    /// position of its snapshot in the header, see [dump_coordinates].
    fn full_dump(&self, record_coordinates: bool) -> ToolInvocation;

    /// Export of the given binary log segments to stdout.
    fn log_export(&self, range: &SegmentRange) -> ToolInvocation;
}

/// A child process to run, given as program and argument list.
///
/// Never passes through a shell, so configuration values can't inject commands.
#[derive(Clone, Debug)]
pub struct ToolInvocation {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl ToolInvocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_owned()));
        self
    }

    /// Sets an environment variable of the child. Not shown when displayed.
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_owned(), value.as_ref().to_owned()));
        self
    }

    pub fn program(&self) -> &std::path::Path {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).envs(self.envs.iter().map(|(k, v)| (k, v)));
        command
    }
}

impl fmt::Display for ToolInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Errors of the administrative queries.
#[derive(Debug, Display, Error)]
pub enum DbError {
    /// The client program could not be started.
    #[display("Running {} failed: {source}", program.display())]
    ClientNotRun { program: PathBuf, source: io::Error },
    /// The server could not be reached.
    #[display("Database server unreachable: {stderr}")]
    Unreachable { stderr: String },
    /// Binary logging is disabled on the server.
    #[display("Binary logging is disabled on the server")]
    LoggingDisabled,
    /// The server rejected the query.
    #[display("Query '{query}' failed: {stderr}")]
    QueryFailed { query: String, stderr: String },
    /// The query result doesn't have the expected shape.
    #[display("Unexpected output of '{query}': {output}")]
    UnexpectedOutput { query: String, output: String },
}

impl DbError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unreachable { .. } => ErrorKind::Connectivity,
            Self::ClientNotRun { .. }
            | Self::LoggingDisabled
            | Self::QueryFailed { .. }
            | Self::UnexpectedOutput { .. } => ErrorKind::Configuration,
        }
    }
}

// client-side connection errors (CR_CONNECTION_ERROR, CR_CONN_HOST_ERROR,
// CR_UNKNOWN_HOST, CR_SERVER_GONE_ERROR, CR_SERVER_LOST)
static CONNECTION_FAILURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:ERROR|Got error:?)\s+(2002|2003|2005|2006|2013)\b")
        .expect("connection failure pattern should be valid")
});

// ER_NO_BINARY_LOGGING
static LOGGING_DISABLED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"ERROR\s+1381\b").expect("logging disabled pattern should be valid")
});

// commented statement of `--source-data=2`, CHANGE MASTER before MySQL 8.0.23
static DUMP_COORDINATES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"CHANGE (?:REPLICATION SOURCE|MASTER) TO (?:SOURCE|MASTER)_LOG_FILE='([^']+)',\s*(?:SOURCE|MASTER)_LOG_POS=(\d+)",
    )
    .expect("dump coordinates pattern should be valid")
});

/// Leading bytes of a dump searched for its coordinates. They precede any table data.
const DUMP_HEADER_LEN: u64 = 64 * 1024;

/// Reads the binary log position noted in the header of a full dump.
///
/// [None] if the dump was taken without recorded coordinates.
pub fn dump_coordinates(dump: impl Read) -> io::Result<Option<LogCursor>> {
    let mut header = Vec::new();
    dump.take(DUMP_HEADER_LEN).read_to_end(&mut header)?;
    let header = String::from_utf8_lossy(&header);

    Ok(DUMP_COORDINATES.captures(&header).and_then(|captures| {
        let offset = captures[2].parse().ok()?;
        Some(LogCursor::new(&captures[1], offset))
    }))
}

/// Returns whether the stderr of a client tool reports that the server wasn't reachable.
pub fn is_connection_failure(stderr: &str) -> bool {
    CONNECTION_FAILURE.is_match(stderr)
}

fn is_logging_disabled(stderr: &str) -> bool {
    LOGGING_DISABLED.is_match(stderr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_failures_are_recognized() {
        assert!(is_connection_failure(
            "ERROR 2002 (HY000): Can't connect to local MySQL server through socket"
        ));
        assert!(is_connection_failure(
            "mysqldump: Got error: 2003: Can't connect to MySQL server on 'db' (111) when trying to connect"
        ));
        assert!(!is_connection_failure(
            "ERROR 1045 (28000): Access denied for user 'backup'@'localhost'"
        ));
    }

    #[test]
    fn coordinates_are_read_from_the_dump_header() {
        let dump = "-- MySQL dump 10.13  Distrib 8.0.36, for Linux (x86_64)\n\
            --\n\
            -- Position to start replication or point-in-time recovery from\n\
            --\n\
            \n\
            -- CHANGE REPLICATION SOURCE TO SOURCE_LOG_FILE='binlog.000007', SOURCE_LOG_POS=157;\n\
            \n\
            CREATE DATABASE `shop`;\n";

        assert_eq!(
            dump_coordinates(dump.as_bytes()).unwrap(),
            Some(LogCursor::new("binlog.000007", 157))
        );
    }

    #[test]
    fn coordinates_of_older_servers_are_read() {
        let dump = "-- CHANGE MASTER TO MASTER_LOG_FILE='mysql-bin.000012', MASTER_LOG_POS=4;\n";

        assert_eq!(
            dump_coordinates(dump.as_bytes()).unwrap(),
            Some(LogCursor::new("mysql-bin.000012", 4))
        );
    }

    #[test]
    fn dump_without_coordinates_has_none() {
        let dump = "-- MySQL dump 10.13\nCREATE DATABASE `shop`;\n";
        assert_eq!(dump_coordinates(dump.as_bytes()).unwrap(), None);
    }

    #[test]
    fn display_hides_environment() {
        let invocation = ToolInvocation::new("mysqldump")
            .arg("--host=db")
            .env("MYSQL_PWD", "hunter2");

        assert_eq!(invocation.to_string(), "mysqldump --host=db");
    }
}
