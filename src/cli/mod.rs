use std::path::PathBuf;

use chrono::Weekday;
use clap::{Args, Parser};
use log::LevelFilter;

use crate::artifact::BackupKind;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Verbosity of the command output.
    #[arg(long)]
    pub verbose: Option<LevelFilter>,

    /// Configuration file. A default one is written if it doesn't exist yet.
    #[arg(
        long,
        short = 'c',
        env = "MYSQL_BACKUP_CONFIG",
        default_value = "/etc/mysql-backup.toml"
    )]
    pub config: PathBuf,

    #[command(flatten)]
    pub mode: Mode,

    /// Take a full backup on this day when neither --full nor --incremental is given.
    #[arg(long, value_name = "DAY", conflicts_with_all = ["full", "incremental", "cleanup"])]
    pub full_weekday: Option<Weekday>,

    /// Simulative backup run.
    #[arg(long)]
    pub dry_run: bool,

    /// Print the outcome as a JSON line to stdout.
    #[arg(long)]
    pub json: bool,
}

/// What to run. Without a flag, the first run is full and every later one incremental.
#[derive(Args, Debug)]
#[group(multiple = false)]
pub struct Mode {
    /// Full backup of the database.
    #[arg(long)]
    pub full: bool,

    /// Export of the binary log since the last backup.
    #[arg(long)]
    pub incremental: bool,

    /// Only delete expired backups.
    #[arg(long)]
    pub cleanup: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Backup of the given kind, decided by the orchestrator if [None].
    Backup(Option<BackupKind>),
    Cleanup,
}

impl Cli {
    /// Resolves the requested action on `today`.
    pub fn action(&self, today: Weekday) -> Action {
        let Mode {
            full,
            incremental,
            cleanup,
        } = self.mode;

        if cleanup {
            Action::Cleanup
        } else if full || self.full_weekday == Some(today) {
            Action::Backup(Some(BackupKind::Full))
        } else if incremental {
            Action::Backup(Some(BackupKind::Incremental))
        } else {
            Action::Backup(None)
        }
    }
}
