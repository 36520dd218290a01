use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use log::{info, warn};
use ojsup_core::{OjsInstance, Settings, UpgradeError};

use crate::command::{run_checked, CommandRunner};
use crate::fs_ops::{copy_tree, remove_path_if_exists};
use crate::term::{cleanup_on_termination, CleanupGuard};

/// The atomic triple taken before any mutation: database dump, instance tree
/// snapshot, and submission (uploaded files) tree snapshot, all sharing one
/// timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSet {
    pub timestamp: String,
    pub db_dump: PathBuf,
    pub www_snapshot: PathBuf,
    pub files_snapshot: Option<PathBuf>,
}

impl BackupSet {
    pub fn artifacts(&self) -> Vec<PathBuf> {
        let mut out = vec![self.db_dump.clone(), self.www_snapshot.clone()];
        if let Some(files) = &self.files_snapshot {
            out.push(files.clone());
        }
        out
    }
}

pub struct BackupManager<'a> {
    settings: &'a Settings,
    runner: &'a dyn CommandRunner,
}

impl<'a> BackupManager<'a> {
    pub fn new(settings: &'a Settings, runner: &'a dyn CommandRunner) -> Self {
        Self { settings, runner }
    }

    /// Produce a complete `BackupSet` or nothing: when any sub-operation
    /// fails, every artifact this set created so far is deleted before the
    /// error propagates.
    pub fn create(&self, instance: &OjsInstance) -> Result<BackupSet, UpgradeError> {
        let timestamp = Local::now()
            .format(&self.settings.timestamp_format)
            .to_string();
        self.create_with_timestamp(instance, &timestamp)
    }

    pub fn create_with_timestamp(
        &self,
        instance: &OjsInstance,
        timestamp: &str,
    ) -> Result<BackupSet, UpgradeError> {
        let mut created: Vec<PathBuf> = Vec::new();
        // In-progress artifacts are also removed if the process is
        // terminated; the guards are withdrawn once the set is complete.
        let mut guards: Vec<CleanupGuard> = Vec::new();

        info!("creating backup set for {} ({timestamp})", instance.name);

        let db_dump = step(
            &mut created,
            &mut guards,
            "database",
            self.dump_database(instance, timestamp),
        )?;

        let www_snapshot = step(
            &mut created,
            &mut guards,
            "instance tree",
            self.snapshot_instance(instance, timestamp),
        )?;

        let files_snapshot = match &instance.config.files_dir {
            Some(files_dir) => Some(step(
                &mut created,
                &mut guards,
                "submission tree",
                self.snapshot_files(instance, files_dir, timestamp),
            )?),
            None => {
                warn!(
                    "{}: no files_dir configured; skipping submission tree snapshot",
                    instance.name
                );
                None
            }
        };

        let backup = BackupSet {
            timestamp: timestamp.to_string(),
            db_dump,
            www_snapshot,
            files_snapshot,
        };
        info!("backup set complete: {:?}", backup.artifacts());
        Ok(backup)
    }

    fn dump_database(&self, instance: &OjsInstance, timestamp: &str) -> Result<PathBuf> {
        let destination = &self.settings.db_backup_dir;
        if !destination.exists() {
            return Err(anyhow!("no such folder: {}", destination.display()));
        }

        let db = &instance.config.database;
        if !matches!(db.driver.as_str(), "mysql" | "mysqli") {
            return Err(anyhow!("no dump facility for database driver '{}'", db.driver));
        }

        let program = self
            .settings
            .mysql_dump
            .clone()
            .unwrap_or_else(|| PathBuf::from("mysqldump"));
        let option_file = write_client_option_file(&self.settings.temp_dir, &db.password)?;

        // The password travels via the option file, never argv.
        let args = vec![
            OsString::from(format!("--defaults-extra-file={}", option_file.display())),
            OsString::from("--single-transaction"),
            OsString::from("--user"),
            OsString::from(&db.username),
            OsString::from("--host"),
            OsString::from(&db.host),
            OsString::from(&db.name),
        ];

        let result = run_checked(self.runner, &program, &args, "database dump");
        let _ = fs::remove_file(&option_file);
        let output = result?;

        let path = destination.join(format!("{}_{}.sql", instance.name, timestamp));
        fs::write(&path, &output.stdout)
            .with_context(|| format!("failed to write database dump: {}", path.display()))?;
        info!("database dump written to {}", path.display());
        Ok(path)
    }

    fn snapshot_instance(&self, instance: &OjsInstance, timestamp: &str) -> Result<PathBuf> {
        let destination = &self.settings.www_backup_dir;
        if !destination.exists() {
            return Err(anyhow!("no such folder: {}", destination.display()));
        }

        let path = destination.join(format!("{}_{}", instance.name, timestamp));
        if path.exists() {
            return Err(anyhow!("snapshot path already exists: {}", path.display()));
        }
        copy_tree(&instance.base_dir, &path)?;
        info!("instance tree snapshot at {}", path.display());
        Ok(path)
    }

    fn snapshot_files(
        &self,
        instance: &OjsInstance,
        files_dir: &Path,
        timestamp: &str,
    ) -> Result<PathBuf> {
        let destination = &self.settings.files_backup_dir;
        if !destination.exists() {
            return Err(anyhow!("no such folder: {}", destination.display()));
        }

        let path = destination.join(format!("{}_files_{}", instance.name, timestamp));
        if path.exists() {
            return Err(anyhow!("snapshot path already exists: {}", path.display()));
        }
        copy_tree(files_dir, &path)?;
        info!("submission tree snapshot at {}", path.display());
        Ok(path)
    }
}

/// Record a successful sub-operation's artifact, or delete every artifact the
/// set created so far and fail with `BackupIncomplete`.
fn step(
    created: &mut Vec<PathBuf>,
    guards: &mut Vec<CleanupGuard>,
    stage: &str,
    result: Result<PathBuf>,
) -> Result<PathBuf, UpgradeError> {
    match result {
        Ok(path) => {
            guards.push(cleanup_on_termination(&path));
            created.push(path.clone());
            Ok(path)
        }
        Err(err) => {
            for artifact in created.drain(..) {
                if let Err(cleanup_err) = remove_path_if_exists(&artifact) {
                    warn!(
                        "failed to clean partial backup artifact {}: {cleanup_err:#}",
                        artifact.display()
                    );
                }
            }
            Err(UpgradeError::BackupIncomplete {
                stage: stage.to_string(),
                detail: format!("{err:#}"),
            })
        }
    }
}

/// Write a short-lived mysql client option file holding the password, mode
/// 0600, under the configured temp directory.
pub(crate) fn write_client_option_file(temp_dir: &Path, password: &str) -> Result<PathBuf> {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_nanos();
    let path = temp_dir.join(format!("ojsup-client-{}-{nanos}.cnf", std::process::id()));

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(&path)
        .with_context(|| format!("failed to create client option file: {}", path.display()))?;
    file.write_all(format!("[client]\npassword={password}\n").as_bytes())
        .with_context(|| format!("failed to write client option file: {}", path.display()))?;
    Ok(path)
}
