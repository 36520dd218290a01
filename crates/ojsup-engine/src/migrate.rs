use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use ojsup_core::{read_version_file, set_installed, OjsInstance, Settings, UpgradeError};
use ojsup_resolver::ReleaseCandidate;

use crate::backup::BackupSet;
use crate::command::CommandRunner;
use crate::fs_ops::{copy_path, files_differ, move_aside, path_with_suffix, remove_path_if_exists};

/// Relative path of the application's own schema-upgrade facility.
const SCHEMA_UPGRADE_SCRIPT: &str = "tools/upgrade.php";

/// One planned overlay mutation. Planning is separated from execution so the
/// collision policy can be unit-tested without touching a live tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyAction {
    MkDir { dst: PathBuf },
    /// Plain overwrite: destination missing, or not a preserved path.
    CopyFile { src: PathBuf, dst: PathBuf },
    /// Collision with a preserved file that differs: the incoming release
    /// file lands at the suffixed destination, the old file stays put.
    CopyRenamed { src: PathBuf, dst: PathBuf },
}

/// Compute the actions that lay the release tree over the instance root.
/// Paths under `preserved` (the instance config file and the custom-file
/// rules) are never overwritten: a differing release file is redirected to
/// `<name><suffix>` instead. Identical files produce no action.
pub fn plan_overlay(
    release_root: &Path,
    instance_root: &Path,
    preserved: &[PathBuf],
    suffix: &str,
) -> Result<Vec<CopyAction>> {
    let mut actions = Vec::new();
    plan_overlay_dir(
        release_root,
        release_root,
        instance_root,
        preserved,
        suffix,
        &mut actions,
    )?;
    Ok(actions)
}

fn plan_overlay_dir(
    release_root: &Path,
    current: &Path,
    instance_root: &Path,
    preserved: &[PathBuf],
    suffix: &str,
    actions: &mut Vec<CopyAction>,
) -> Result<()> {
    for entry in
        fs::read_dir(current).with_context(|| format!("failed to read {}", current.display()))?
    {
        let entry = entry?;
        let src = entry.path();
        let rel = src
            .strip_prefix(release_root)
            .with_context(|| format!("failed to relativize {}", src.display()))?
            .to_path_buf();
        let dst = instance_root.join(&rel);
        let metadata = fs::symlink_metadata(&src)
            .with_context(|| format!("failed to stat {}", src.display()))?;

        if metadata.is_dir() && !metadata.file_type().is_symlink() {
            match fs::symlink_metadata(&dst) {
                Ok(existing) if existing.is_dir() => {}
                Ok(_) => {
                    return Err(anyhow!(
                        "release directory collides with a non-directory: {}",
                        dst.display()
                    ));
                }
                Err(_) => actions.push(CopyAction::MkDir { dst: dst.clone() }),
            }
            plan_overlay_dir(release_root, &src, instance_root, preserved, suffix, actions)?;
            continue;
        }

        if !dst.exists() && fs::symlink_metadata(&dst).is_err() {
            actions.push(CopyAction::CopyFile { src, dst });
            continue;
        }

        if !entries_differ(&src, &dst)? {
            continue;
        }

        if is_preserved(&rel, preserved) {
            actions.push(CopyAction::CopyRenamed {
                src,
                dst: path_with_suffix(&dst, suffix),
            });
        } else {
            actions.push(CopyAction::CopyFile { src, dst });
        }
    }
    Ok(())
}

pub fn apply_overlay(actions: &[CopyAction]) -> Result<()> {
    for action in actions {
        match action {
            CopyAction::MkDir { dst } => {
                fs::create_dir_all(dst)
                    .with_context(|| format!("failed to create {}", dst.display()))?;
            }
            CopyAction::CopyFile { src, dst } | CopyAction::CopyRenamed { src, dst } => {
                if fs::symlink_metadata(dst).is_ok() {
                    remove_path_if_exists(dst)?;
                }
                copy_path(src, dst)?;
            }
        }
    }
    Ok(())
}

fn is_preserved(rel: &Path, preserved: &[PathBuf]) -> bool {
    preserved.iter().any(|p| rel.starts_with(p))
}

fn entries_differ(src: &Path, dst: &Path) -> Result<bool> {
    let src_meta = fs::symlink_metadata(src)
        .with_context(|| format!("failed to stat {}", src.display()))?;
    let dst_meta = fs::symlink_metadata(dst)
        .with_context(|| format!("failed to stat {}", dst.display()))?;

    let src_link = src_meta.file_type().is_symlink();
    let dst_link = dst_meta.file_type().is_symlink();
    if src_link || dst_link {
        if !(src_link && dst_link) {
            return Ok(true);
        }
        let src_target = fs::read_link(src)?;
        let dst_target = fs::read_link(dst)?;
        return Ok(src_target != dst_target);
    }
    if src_meta.is_dir() != dst_meta.is_dir() {
        return Ok(true);
    }
    if src_meta.is_dir() {
        return Ok(false);
    }
    files_differ(src, dst)
}

/// Deep equality of two paths of any kind.
fn paths_identical(a: &Path, b: &Path) -> Result<bool> {
    let meta_a = fs::symlink_metadata(a)?;
    let meta_b = fs::symlink_metadata(b)?;

    if meta_a.file_type().is_symlink() || meta_b.file_type().is_symlink() {
        if !(meta_a.file_type().is_symlink() && meta_b.file_type().is_symlink()) {
            return Ok(false);
        }
        return Ok(fs::read_link(a)? == fs::read_link(b)?);
    }
    if meta_a.is_dir() != meta_b.is_dir() {
        return Ok(false);
    }
    if !meta_a.is_dir() {
        return Ok(!files_differ(a, b)?);
    }

    let names_a: BTreeSet<_> = fs::read_dir(a)?
        .filter_map(|e| e.ok().map(|e| e.file_name()))
        .collect();
    let names_b: BTreeSet<_> = fs::read_dir(b)?
        .filter_map(|e| e.ok().map(|e| e.file_name()))
        .collect();
    if names_a != names_b {
        return Ok(false);
    }
    for name in names_a {
        if !paths_identical(&a.join(&name), &b.join(&name))? {
            return Ok(false);
        }
    }
    Ok(true)
}

pub struct MigrationEngine<'a> {
    settings: &'a Settings,
    runner: &'a dyn CommandRunner,
}

impl<'a> MigrationEngine<'a> {
    pub fn new(settings: &'a Settings, runner: &'a dyn CommandRunner) -> Self {
        Self { settings, runner }
    }

    /// Transform the instance in place to the chosen release. Strictly
    /// ordered; the caller routes any error through the rollback
    /// coordinator with the backup set taken beforehand.
    pub fn migrate(
        &self,
        instance: &OjsInstance,
        candidate: &ReleaseCandidate,
        backup: &BackupSet,
    ) -> Result<()> {
        info!(
            "migrating {} from {} to {}",
            instance.name, instance.version, candidate.version
        );

        let mut preserved = self.settings.custom_paths_for(&instance.name);
        preserved.push(self.settings.config_file.clone());

        let actions = plan_overlay(
            &candidate.path,
            &instance.base_dir,
            &preserved,
            &self.settings.suffix_new,
        )?;
        info!("overlaying release tree: {} actions", actions.len());
        apply_overlay(&actions)?;

        self.restore_config(instance, backup)?;
        self.restore_custom_files(instance, backup)?;
        self.run_schema_upgrade(instance)?;
        self.verify(instance, candidate)?;

        info!("{} migrated to {}", instance.name, candidate.version);
        Ok(())
    }

    fn restore_config(&self, instance: &OjsInstance, backup: &BackupSet) -> Result<()> {
        let src = backup.www_snapshot.join(&self.settings.config_file);
        if !src.exists() {
            return Err(anyhow!(
                "instance config missing from snapshot: {}",
                src.display()
            ));
        }
        let dst = instance.config_path(self.settings);
        info!("restoring configuration {}", dst.display());
        restore_from_snapshot(&src, &dst, &self.settings.suffix_new)
    }

    fn restore_custom_files(&self, instance: &OjsInstance, backup: &BackupSet) -> Result<()> {
        for rel in self.settings.custom_paths_for(&instance.name) {
            let src = backup.www_snapshot.join(&rel);
            let dst = instance.base_dir.join(&rel);
            if !src.exists() && fs::symlink_metadata(&src).is_err() {
                warn!(
                    "custom path {} not found in snapshot; skipped",
                    src.display()
                );
                continue;
            }
            info!("restoring custom path {}", rel.display());
            restore_from_snapshot(&src, &dst, &self.settings.suffix_new)?;
        }
        Ok(())
    }

    fn run_schema_upgrade(&self, instance: &OjsInstance) -> Result<()> {
        let config_path = instance.config_path(self.settings);
        set_installed(&config_path, false)?;

        let php = self
            .settings
            .php_interpreter
            .clone()
            .unwrap_or_else(|| PathBuf::from("php"));
        let script = instance.base_dir.join(SCHEMA_UPGRADE_SCRIPT);
        let args = vec![OsString::from(&script), OsString::from("upgrade")];

        info!("running schema upgrade: {} {} upgrade", php.display(), script.display());
        let output = self.runner.run(&php, &args)?;
        if !output.stdout.is_empty() {
            debug!(
                "schema upgrade output:\n{}",
                String::from_utf8_lossy(&output.stdout).trim_end()
            );
        }
        if !output.success() {
            return Err(UpgradeError::SchemaUpgradeFailed(format!(
                "exit status {} stderr='{}'",
                output.status,
                output.stderr.trim()
            ))
            .into());
        }

        set_installed(&config_path, true)?;
        Ok(())
    }

    fn verify(&self, instance: &OjsInstance, candidate: &ReleaseCandidate) -> Result<()> {
        let descriptor = read_version_file(&instance.version_file_path(self.settings))?;
        if descriptor.version != candidate.version {
            return Err(UpgradeError::VerificationFailed {
                expected: candidate.version.clone(),
                found: descriptor.version,
            }
            .into());
        }
        Ok(())
    }
}

/// Bring one preserved path back from the pre-upgrade snapshot. Directories
/// merge entry by entry, so files the overlay placed beside the old ones
/// (suffixed collision copies, brand-new release files) stay where they are.
/// A live file that differs from its snapshot copy is moved aside with the
/// suffix before the snapshot version is copied back.
fn restore_from_snapshot(src: &Path, dst: &Path, suffix: &str) -> Result<()> {
    let src_meta = fs::symlink_metadata(src)
        .with_context(|| format!("failed to stat {}", src.display()))?;

    if src_meta.is_dir() && !src_meta.file_type().is_symlink() {
        match fs::symlink_metadata(dst) {
            Ok(dst_meta) if dst_meta.is_dir() && !dst_meta.file_type().is_symlink() => {
                for entry in fs::read_dir(src)
                    .with_context(|| format!("failed to read {}", src.display()))?
                {
                    let entry = entry?;
                    restore_from_snapshot(&entry.path(), &dst.join(entry.file_name()), suffix)?;
                }
                return Ok(());
            }
            Ok(_) => {
                let aside = move_aside(dst, suffix)?;
                debug!("moved {} aside to {}", dst.display(), aside.display());
            }
            Err(_) => {
                if let Some(parent) = dst.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("failed to create {}", parent.display()))?;
                }
            }
        }
        return copy_path(src, dst);
    }

    match fs::symlink_metadata(dst) {
        Ok(_) => {
            if paths_identical(src, dst)? {
                debug!("{} already matches the snapshot", dst.display());
                return Ok(());
            }
            let aside = move_aside(dst, suffix)?;
            debug!("moved {} aside to {}", dst.display(), aside.display());
        }
        Err(_) => {
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
    }
    copy_path(src, dst)
}
