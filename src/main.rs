use std::path::Path;
use std::process::ExitCode;

use chrono::{Datelike, Local};
use clap::Parser;

use mysql_backup_lib::cli::{Action, Cli};
use mysql_backup_lib::config::BackupConfiguration;
use mysql_backup_lib::fs::LocalFs;
use mysql_backup_lib::mysql::MySql;
use mysql_backup_lib::orchestrator::{JsonReporter, LogReporter, Orchestrator, Reporter};

fn main() -> ExitCode {
    let cli = Cli::parse();

    // init logger
    let mut env_logger = env_logger::builder();
    if let Some(level) = cli.verbose {
        env_logger.filter_level(level);
    }
    env_logger.try_init().expect("env_logger should not fail");

    let Some(config) = read_config(&cli.config) else {
        return ExitCode::FAILURE;
    };

    if cli.dry_run {
        log::warn!("Running in dry-run mode");
    }

    if cli.json {
        run(&cli, config, JsonReporter::new(std::io::stdout()))
    } else {
        run(&cli, config, LogReporter)
    }
}

fn read_config(path: &Path) -> Option<BackupConfiguration> {
    match std::fs::read_to_string(path) {
        Ok(config_str) => match toml::from_str(&config_str) {
            Ok(config) => Some(config),
            Err(e) => {
                log::error!("Reading the config file failed: {e}");
                None
            }
        },
        Err(e) => {
            if std::fs::exists(path).is_ok_and(|b| !b) {
                log::debug!(
                    "Writing default config to {} because it doesn't exist yet",
                    path.display()
                );
                let default_config = BackupConfiguration::default();
                let config_str = toml::to_string_pretty(&default_config)
                    .expect("default config should be serializable");
                if let Err(e) = std::fs::write(path, config_str) {
                    log::warn!("Writing default config to {} failed {e}", path.display());
                }

                Some(default_config)
            } else {
                log::error!("Reading the config file failed: {e}");
                None
            }
        }
    }
}

fn run<R: Reporter>(cli: &Cli, config: BackupConfiguration, reporter: R) -> ExitCode {
    let db = MySql::new(config.database.clone(), config.tools.clone());

    let mut orchestrator = match Orchestrator::new(config, db, LocalFs, reporter) {
        Ok(orchestrator) => orchestrator.with_dry_run(cli.dry_run),
        Err(e) => {
            log::error!("Invalid configuration in {}: {e}", cli.config.display());
            return ExitCode::FAILURE;
        }
    };

    let outcome = match cli.action(Local::now().weekday()) {
        Action::Backup(kind) => orchestrator.run(kind),
        Action::Cleanup => orchestrator.cleanup(),
    };

    if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
