use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info, LevelFilter};
use ojsup_core::{parse_release_version, Settings, UpgradeError};
use ojsup_engine::{
    Orchestrator, SystemPrivilegeBoundary, SystemRunner, UpgradeOptions, UpgradeOutcome,
};

#[derive(Parser, Debug)]
#[command(name = "ojsup")]
#[command(about = "Transactional upgrader for self-hosted OJS instances", long_about = None)]
struct Cli {
    /// Directory of the OJS instance to upgrade.
    folder: PathBuf,

    /// Proceed even when the chosen release is not newer than the instance.
    #[arg(long)]
    force: bool,

    /// Keep current privileges instead of dropping to the configured identity.
    #[arg(long)]
    permissive: bool,

    /// Verbose diagnostic logging.
    #[arg(long)]
    debug: bool,

    /// Only take the backup set; leave the instance untouched.
    #[arg(long)]
    backup: bool,

    /// Override the configured unprivileged owner.
    #[arg(short, long)]
    owner: Option<String>,

    /// Override the configured unprivileged group.
    #[arg(short, long)]
    group: Option<String>,

    /// Settings file.
    #[arg(long, default_value = "/etc/ojsup/settings.toml")]
    settings: PathBuf,

    /// Upgrade to this exact release instead of the newest candidate.
    #[arg(long)]
    target: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    env_logger::Builder::from_default_env()
        .filter_level(if cli.debug {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .init();
    ojsup_engine::install_termination_handler();

    match run(&cli) {
        Ok(outcome) => code(report(outcome)),
        Err(err) => {
            error!("{err}");
            code(err.exit_code())
        }
    }
}

fn run(cli: &Cli) -> Result<UpgradeOutcome, UpgradeError> {
    let mut settings = Settings::load(&cli.settings)?;
    if let Some(owner) = &cli.owner {
        settings.owner = owner.clone();
    }
    if let Some(group) = &cli.group {
        settings.group = group.clone();
    }

    let target = cli
        .target
        .as_deref()
        .map(|raw| {
            parse_release_version(raw)
                .map_err(|err| UpgradeError::ConfigInvalid(format!("--target: {err:#}")))
        })
        .transpose()?;

    let options = UpgradeOptions {
        force: cli.force,
        permissive: cli.permissive,
        target,
    };

    let runner = SystemRunner;
    let boundary = SystemPrivilegeBoundary;
    let orchestrator = Orchestrator::new(&settings, &runner, &boundary);

    if cli.backup {
        orchestrator.backup_only(&cli.folder, &options)
    } else {
        orchestrator.upgrade(&cli.folder, &options)
    }
}

/// Report the terminal outcome and return its process exit code.
fn report(outcome: UpgradeOutcome) -> i32 {
    match outcome {
        UpgradeOutcome::Verified { from, to, backup } => {
            info!("upgrade complete: {from} -> {to}");
            println!("upgraded {from} -> {to}");
            for artifact in backup.artifacts() {
                println!("backup: {}", artifact.display());
            }
            0
        }
        UpgradeOutcome::BackupOnlyComplete { backup } => {
            info!("backup set complete");
            for artifact in backup.artifacts() {
                println!("backup: {}", artifact.display());
            }
            0
        }
        UpgradeOutcome::RolledBack {
            cause,
            version,
            backup,
        } => {
            error!("upgrade failed and was rolled back to {version}: {cause}");
            for artifact in backup.artifacts() {
                println!("backup retained: {}", artifact.display());
            }
            3
        }
    }
}

fn code(value: i32) -> ExitCode {
    ExitCode::from(value.clamp(0, u8::MAX as i32) as u8)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use ojsup_core::{parse_release_version, UpgradeError};
    use ojsup_engine::{BackupSet, UpgradeOutcome};

    use super::report;

    fn backup_set() -> BackupSet {
        BackupSet {
            timestamp: "ts1".to_string(),
            db_dump: PathBuf::from("/srv/backup/db/journal-a_ts1.sql"),
            www_snapshot: PathBuf::from("/srv/backup/www/journal-a_ts1"),
            files_snapshot: None,
        }
    }

    #[test]
    fn success_outcomes_exit_zero() {
        let verified = UpgradeOutcome::Verified {
            from: parse_release_version("3.2.0").expect("must parse"),
            to: parse_release_version("3.4.0").expect("must parse"),
            backup: backup_set(),
        };
        assert_eq!(report(verified), 0);

        let backup_only = UpgradeOutcome::BackupOnlyComplete {
            backup: backup_set(),
        };
        assert_eq!(report(backup_only), 0);
    }

    #[test]
    fn rolled_back_outcome_exits_three() {
        let rolled_back = UpgradeOutcome::RolledBack {
            cause: "schema upgrade command failed".to_string(),
            version: parse_release_version("3.2.0").expect("must parse"),
            backup: backup_set(),
        };
        assert_eq!(report(rolled_back), 3);
    }

    #[test]
    fn error_exit_codes_follow_the_taxonomy() {
        let preflight = UpgradeError::LockContention {
            lock_path: PathBuf::from("/run/ojsup-journal-a.lock"),
        };
        assert_eq!(preflight.exit_code(), 2);

        let runtime = UpgradeError::SchemaUpgradeFailed("exit status 1".to_string());
        assert_eq!(runtime.exit_code(), 3);

        let terminal = UpgradeError::RollbackFailed {
            detail: "restore failed".to_string(),
            artifacts: vec![PathBuf::from("/srv/backup/db/journal-a_ts1.sql")],
        };
        assert_eq!(terminal.exit_code(), 4);
    }
}
