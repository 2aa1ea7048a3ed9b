//! Per-run settings, read from a TOML file by the binary.

use std::path::PathBuf;
use std::time::Duration;

use chrono::TimeDelta;
use derive_more::{Display, Error};

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 3306;
const DEFAULT_USER: &str = "root";
const DEFAULT_ROOT: &str = "/var/backups/mysql";
const DEFAULT_FULL_RETENTION_DAYS: u32 = 7;
const DEFAULT_INCREMENTAL_RETENTION_DAYS: u32 = 15;

/// Immutable settings of a backup run.
///
/// Loaded once at process start and owned by the
/// [Orchestrator](crate::orchestrator::Orchestrator) for the lifetime of the run.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct BackupConfiguration {
    /// Connection to the backed up database.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Placement, retention and compression of artifacts.
    #[serde(default)]
    pub backup: ArtifactConfig,

    /// Locations of the MySQL client tools.
    #[serde(default)]
    pub tools: ToolsConfig,
}

/// Connection parameters of the target database.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    /// Handed to the client tools through `MYSQL_PWD`, never on the command line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Schema to back up. Also keys the persisted log cursor and the run lock.
    #[serde(default)]
    pub database: String,
}

// keep the password out of logs
impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("database", &self.database)
            .finish()
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            user: default_user(),
            password: None,
            database: String::new(),
        }
    }
}

/// Artifact handling.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ArtifactConfig {
    /// Root directory; full and incremental artifacts live in separate subdirectories.
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Days after which full backups are deleted.
    #[serde(default = "default_full_retention_days")]
    pub full_retention_days: u32,

    /// Days after which incremental backups are deleted.
    #[serde(default = "default_incremental_retention_days")]
    pub incremental_retention_days: u32,

    /// Gzip the artifacts after they were written.
    #[serde(default = "default_compress")]
    pub compress: bool,

    /// Maximum runtime of a single dump or export tool invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            full_retention_days: default_full_retention_days(),
            incremental_retention_days: default_incremental_retention_days(),
            compress: default_compress(),
            timeout_secs: None,
        }
    }
}

/// Programs invoked as child processes.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_mysql")]
    pub mysql: PathBuf,
    #[serde(default = "default_mysqldump")]
    pub mysqldump: PathBuf,
    #[serde(default = "default_mysqlbinlog")]
    pub mysqlbinlog: PathBuf,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            mysql: default_mysql(),
            mysqldump: default_mysqldump(),
            mysqlbinlog: default_mysqlbinlog(),
        }
    }
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_user() -> String {
    DEFAULT_USER.to_string()
}
fn default_root() -> PathBuf {
    PathBuf::from(DEFAULT_ROOT)
}
fn default_full_retention_days() -> u32 {
    DEFAULT_FULL_RETENTION_DAYS
}
fn default_incremental_retention_days() -> u32 {
    DEFAULT_INCREMENTAL_RETENTION_DAYS
}
fn default_compress() -> bool {
    true
}
fn default_mysql() -> PathBuf {
    PathBuf::from("mysql")
}
fn default_mysqldump() -> PathBuf {
    PathBuf::from("mysqldump")
}
fn default_mysqlbinlog() -> PathBuf {
    PathBuf::from("mysqlbinlog")
}

/// Violations of the configuration's preconditions.
#[derive(Debug, Display, Error)]
pub enum ConfigError {
    /// `database.database` is empty.
    #[display("No target database configured")]
    MissingDatabase,
    /// The database name could be taken for an option or a path.
    #[display("Invalid database name: {_0}")]
    InvalidDatabase(#[error(ignore)] String),
    /// `backup.root` is empty.
    #[display("No artifact root directory configured")]
    MissingRoot,
    /// A retention window of zero days would delete every artifact right away.
    #[display("Retention window of the {_0} backups must be at least one day")]
    ZeroRetention(#[error(ignore)] &'static str),
    /// The file could not be parsed.
    #[display("Malformed configuration: {_0}")]
    Malformed(toml::de::Error),
}

impl BackupConfiguration {
    /// Parses a TOML configuration and validates it.
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s).map_err(ConfigError::Malformed)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the settings every run depends on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.database.trim().is_empty() {
            return Err(ConfigError::MissingDatabase);
        }
        let name = &self.database.database;
        if name.starts_with('-') || name.contains(['/', '\\', '\0']) {
            return Err(ConfigError::InvalidDatabase(name.clone()));
        }
        if self.backup.root.as_os_str().is_empty() {
            return Err(ConfigError::MissingRoot);
        }
        if self.backup.full_retention_days == 0 {
            return Err(ConfigError::ZeroRetention("full"));
        }
        if self.backup.incremental_retention_days == 0 {
            return Err(ConfigError::ZeroRetention("incremental"));
        }
        if self.backup.root.is_relative() {
            log::warn!(target: "config", "Artifact root is relative: {}", self.backup.root.display());
        }

        Ok(())
    }

    /// Maximum age of full backups.
    pub fn full_retention(&self) -> TimeDelta {
        TimeDelta::days(self.backup.full_retention_days.into())
    }

    /// Maximum age of incremental backups.
    pub fn incremental_retention(&self) -> TimeDelta {
        TimeDelta::days(self.backup.incremental_retention_days.into())
    }

    /// Timeout of a single tool invocation, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.backup.timeout_secs.map(Duration::from_secs)
    }
}
