use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use log::{error, info};
use ojsup_core::{read_version_file, OjsInstance, Settings, UpgradeError};

use crate::backup::{write_client_option_file, BackupSet};
use crate::command::{run_checked, CommandRunner};
use crate::fs_ops::{copy_tree, remove_path_if_exists};

/// Restores a failed upgrade from its backup set. Restoration order matters:
/// the instance tree comes back first so its config file again matches the
/// database contents restored last.
pub struct RollbackCoordinator<'a> {
    settings: &'a Settings,
    runner: &'a dyn CommandRunner,
}

impl<'a> RollbackCoordinator<'a> {
    pub fn new(settings: &'a Settings, runner: &'a dyn CommandRunner) -> Self {
        Self { settings, runner }
    }

    /// Put the instance back to its pre-upgrade state. On any failure the
    /// backup artifacts are left untouched and reported for manual recovery.
    pub fn rollback(&self, instance: &OjsInstance, backup: &BackupSet) -> Result<(), UpgradeError> {
        info!(
            "rolling back {} to {} from backup {}",
            instance.name, instance.version, backup.timestamp
        );

        self.run(instance, backup).map_err(|err| {
            let mut artifacts = backup.artifacts();
            artifacts.push(instance.base_dir.clone());
            error!("rollback failed: {err:#}");
            UpgradeError::RollbackFailed {
                detail: format!("{err:#}"),
                artifacts,
            }
        })
    }

    fn run(&self, instance: &OjsInstance, backup: &BackupSet) -> Result<()> {
        self.restore_instance_tree(instance, backup)?;
        self.restore_files_tree(instance, backup)?;
        self.restore_database(instance, backup)?;
        self.verify(instance)?;
        info!("{} restored to {}", instance.name, instance.version);
        Ok(())
    }

    fn restore_instance_tree(&self, instance: &OjsInstance, backup: &BackupSet) -> Result<()> {
        info!("restoring instance tree {}", instance.base_dir.display());
        remove_path_if_exists(&instance.base_dir)?;
        copy_tree(&backup.www_snapshot, &instance.base_dir)
    }

    fn restore_files_tree(&self, instance: &OjsInstance, backup: &BackupSet) -> Result<()> {
        let (Some(snapshot), Some(files_dir)) =
            (&backup.files_snapshot, &instance.config.files_dir)
        else {
            return Ok(());
        };
        info!("restoring submission tree {}", files_dir.display());
        remove_path_if_exists(files_dir)?;
        copy_tree(snapshot, files_dir)
    }

    fn restore_database(&self, instance: &OjsInstance, backup: &BackupSet) -> Result<()> {
        let db = &instance.config.database;
        if !matches!(db.driver.as_str(), "mysql" | "mysqli") {
            return Err(anyhow!(
                "no restore facility for database driver '{}'",
                db.driver
            ));
        }
        if !backup.db_dump.exists() {
            return Err(anyhow!(
                "database dump is missing: {}",
                backup.db_dump.display()
            ));
        }

        info!("restoring database {} from {}", db.name, backup.db_dump.display());
        let program = self
            .settings
            .mysql
            .clone()
            .unwrap_or_else(|| PathBuf::from("mysql"));
        let option_file = write_client_option_file(&self.settings.temp_dir, &db.password)?;

        let base_args = |statement: String| -> Vec<OsString> {
            vec![
                OsString::from(format!("--defaults-extra-file={}", option_file.display())),
                OsString::from("--user"),
                OsString::from(&db.username),
                OsString::from("--host"),
                OsString::from(&db.host),
                OsString::from("-e"),
                OsString::from(statement),
            ]
        };

        // Recreate from scratch so tables added by a half-applied schema
        // upgrade do not survive the restore.
        let result = run_checked(
            self.runner,
            &program,
            &base_args(format!("DROP DATABASE {0}; CREATE DATABASE {0};", db.name)),
            "database recreate",
        )
        .and_then(|_| {
            run_checked(
                self.runner,
                &program,
                &base_args(format!(
                    "USE {}; SOURCE {};",
                    db.name,
                    backup.db_dump.display()
                )),
                "database restore",
            )
        });
        let _ = fs::remove_file(&option_file);
        result.map(|_| ())
    }

    fn verify(&self, instance: &OjsInstance) -> Result<()> {
        let descriptor = read_version_file(&instance.version_file_path(self.settings))?;
        if descriptor.version != instance.version {
            return Err(anyhow!(
                "restored tree reports version {} instead of {}",
                descriptor.version,
                instance.version
            ));
        }
        Ok(())
    }
}
