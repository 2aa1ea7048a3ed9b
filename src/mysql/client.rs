use std::path::Path;

use crate::config::{DatabaseConfig, ToolsConfig};
use crate::cursor::tracker::SegmentRange;
use crate::cursor::{LogCursor, SEGMENT_HEADER_LEN};

use super::{is_connection_failure, is_logging_disabled, Database, DbError, ToolInvocation};

const PASSWORD_ENV: &str = "MYSQL_PWD";

/// [Database] backed by the `mysql`, `mysqldump` and `mysqlbinlog` client tools.
///
/// Every query runs in its own short-lived `mysql` process, so no connection outlives
/// the call that opened it.
#[derive(Debug, Clone)]
pub struct MySql {
    connection: DatabaseConfig,
    tools: ToolsConfig,
}

impl MySql {
    pub fn new(connection: DatabaseConfig, tools: ToolsConfig) -> Self {
        Self { connection, tools }
    }

    fn invocation(&self, program: &Path) -> ToolInvocation {
        let DatabaseConfig {
            host,
            port,
            user,
            password,
            ..
        } = &self.connection;

        let invocation = ToolInvocation::new(program).args([
            format!("--host={host}"),
            format!("--port={port}"),
            format!("--user={user}"),
        ]);

        match password {
            Some(password) => invocation.env(PASSWORD_ENV, password),
            None => invocation,
        }
    }

    /// Runs `query` and returns the rows of its tab separated result.
    fn query(&self, query: &str) -> Result<Vec<Vec<String>>, DbError> {
        let invocation = self
            .invocation(&self.tools.mysql)
            .args(["--batch", "--skip-column-names", "--execute"])
            .arg(query);
        log::trace!(target: "mysql", "Running: {invocation}");

        let output = invocation
            .command()
            .output()
            .map_err(|source| DbError::ClientNotRun {
                program: self.tools.mysql.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            let stderr = stderr.trim().to_string();
            return Err(if is_connection_failure(&stderr) {
                DbError::Unreachable { stderr }
            } else if is_logging_disabled(&stderr) {
                DbError::LoggingDisabled
            } else {
                DbError::QueryFailed {
                    query: query.to_string(),
                    stderr,
                }
            });
        }

        // relay stderr
        if !stderr.trim().is_empty() {
            log::warn!(target: "mysql", "{}", stderr.trim());
        }

        Ok(parse_rows(&stdout))
    }
}

fn parse_rows(stdout: &str) -> Vec<Vec<String>> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.split('\t').map(str::to_string).collect())
        .collect()
}

fn parse_master_status(rows: &[Vec<String>]) -> Result<Option<LogCursor>, DbError> {
    let Some(row) = rows.first() else {
        return Ok(None);
    };

    let unexpected = || DbError::UnexpectedOutput {
        query: "SHOW MASTER STATUS".into(),
        output: row.join("\t"),
    };
    let (Some(segment), Some(offset)) = (row.first(), row.get(1)) else {
        return Err(unexpected());
    };
    let offset = offset.trim().parse().map_err(|_| unexpected())?;

    Ok(Some(LogCursor::new(segment.trim(), offset)))
}

impl Database for MySql {
    fn name(&self) -> &str {
        &self.connection.database
    }

    fn master_status(&self) -> Result<Option<LogCursor>, DbError> {
        let rows = self.query("SHOW MASTER STATUS")?;
        parse_master_status(&rows)
    }

    fn binary_logs(&self) -> Result<Vec<String>, DbError> {
        let rows = self.query("SHOW BINARY LOGS")?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            .map(|name| name.trim().to_string())
            .collect())
    }

    fn flush_logs(&self) -> Result<(), DbError> {
        self.query("FLUSH BINARY LOGS").map(|_| ())
    }

    fn full_dump(&self, record_coordinates: bool) -> ToolInvocation {
        let invocation = self.invocation(&self.tools.mysqldump).args([
            "--single-transaction", // one consistent snapshot
            "--routines",
            "--triggers",
            "--events",
            "--set-gtid-purged=OFF",
        ]);
        let invocation = if record_coordinates {
            // rotate under the dump's read lock and note the new position as a comment
            invocation.args(["--flush-logs", "--source-data=2"])
        } else {
            invocation
        };

        invocation.arg("--databases").arg(&self.connection.database)
    }

    fn log_export(&self, range: &SegmentRange) -> ToolInvocation {
        let invocation = self
            .invocation(&self.tools.mysqlbinlog)
            .arg("--read-from-remote-server");

        let invocation = if range.start_offset > SEGMENT_HEADER_LEN {
            invocation.arg(format!("--start-position={}", range.start_offset))
        } else {
            invocation
        };

        invocation.args(&range.segments)
    }
}
