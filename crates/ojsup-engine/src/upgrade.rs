use std::fmt;
use std::path::Path;

use log::{error, info, warn};
use ojsup_core::{OjsInstance, Settings, UpgradeError};
use ojsup_resolver::{check_upgrade_needed, discover_candidates, select_candidate};
use semver::Version;

use crate::audit::{audit, AuditPath, SpaceCheck};
use crate::backup::{BackupManager, BackupSet};
use crate::command::CommandRunner;
use crate::lockfile::InstanceLock;
use crate::migrate::MigrationEngine;
use crate::privileges::{apply_boundary, PrivilegeBoundary};
use crate::rollback::RollbackCoordinator;

/// Transaction state. Transitions are strictly forward; once a mutating phase
/// is entered the only exits are `Verified` or the rollback tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradePhase {
    Idle,
    Resolving,
    Auditing,
    PrivilegeDropped,
    BackingUp,
    Migrating,
    Verified,
    RollingBack,
    RolledBack,
    RollbackFailed,
    BackupOnlyComplete,
}

impl fmt::Display for UpgradePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Resolving => "resolving",
            Self::Auditing => "auditing",
            Self::PrivilegeDropped => "privilege-dropped",
            Self::BackingUp => "backing-up",
            Self::Migrating => "migrating",
            Self::Verified => "verified",
            Self::RollingBack => "rolling-back",
            Self::RolledBack => "rolled-back",
            Self::RollbackFailed => "rollback-failed",
            Self::BackupOnlyComplete => "backup-only-complete",
        };
        f.write_str(label)
    }
}

struct UpgradeTransaction {
    instance: String,
    phase: UpgradePhase,
}

impl UpgradeTransaction {
    fn new(instance: &str) -> Self {
        Self {
            instance: instance.to_string(),
            phase: UpgradePhase::Idle,
        }
    }

    fn advance(&mut self, next: UpgradePhase) {
        info!("{}: {} -> {next}", self.instance, self.phase);
        self.phase = next;
    }
}

#[derive(Debug, Clone, Default)]
pub struct UpgradeOptions {
    /// Proceed even when the chosen release is not newer than the instance.
    pub force: bool,
    /// Keep current privileges instead of dropping to the configured identity.
    pub permissive: bool,
    /// Upgrade to this exact release instead of the newest one.
    pub target: Option<Version>,
}

/// Terminal state of a completed invocation. `RolledBack` is a successful
/// transaction outcome (the instance is consistent again) even though the
/// upgrade itself did not happen; callers map it to its own exit code.
#[derive(Debug)]
pub enum UpgradeOutcome {
    Verified {
        from: Version,
        to: Version,
        backup: BackupSet,
    },
    BackupOnlyComplete {
        backup: BackupSet,
    },
    RolledBack {
        cause: String,
        version: Version,
        backup: BackupSet,
    },
}

/// Drives one instance through the full upgrade transaction.
pub struct Orchestrator<'a> {
    settings: &'a Settings,
    runner: &'a dyn CommandRunner,
    boundary: &'a dyn PrivilegeBoundary,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        settings: &'a Settings,
        runner: &'a dyn CommandRunner,
        boundary: &'a dyn PrivilegeBoundary,
    ) -> Self {
        Self {
            settings,
            runner,
            boundary,
        }
    }

    pub fn upgrade(
        &self,
        instance_dir: &Path,
        options: &UpgradeOptions,
    ) -> Result<UpgradeOutcome, UpgradeError> {
        let instance = self.open_instance(instance_dir)?;
        let _lock = InstanceLock::acquire(&self.settings.run_dir, &instance.name)?;
        let mut transaction = UpgradeTransaction::new(&instance.name);

        transaction.advance(UpgradePhase::Resolving);
        let candidates = discover_candidates(self.settings)?;
        let candidate = select_candidate(&candidates, options.target.as_ref())?.clone();
        check_upgrade_needed(&instance.version, &candidate, options.force)?;
        info!(
            "{}: upgrading {} -> {}",
            instance.name, instance.version, candidate.version
        );

        transaction.advance(UpgradePhase::Auditing);
        self.preflight(&instance, true)?;

        apply_boundary(
            self.boundary,
            &self.settings.owner,
            &self.settings.group,
            options.permissive,
        )?;
        transaction.advance(UpgradePhase::PrivilegeDropped);

        transaction.advance(UpgradePhase::BackingUp);
        let backup = BackupManager::new(self.settings, self.runner).create(&instance)?;

        transaction.advance(UpgradePhase::Migrating);
        let engine = MigrationEngine::new(self.settings, self.runner);
        match engine.migrate(&instance, &candidate, &backup) {
            Ok(()) => {
                transaction.advance(UpgradePhase::Verified);
                Ok(UpgradeOutcome::Verified {
                    from: instance.version.clone(),
                    to: candidate.version.clone(),
                    backup,
                })
            }
            Err(err) => {
                let cause = format!("{err:#}");
                warn!("{}: migration failed, rolling back: {cause}", instance.name);
                transaction.advance(UpgradePhase::RollingBack);
                let coordinator = RollbackCoordinator::new(self.settings, self.runner);
                match coordinator.rollback(&instance, &backup) {
                    Ok(()) => {
                        transaction.advance(UpgradePhase::RolledBack);
                        Ok(UpgradeOutcome::RolledBack {
                            cause,
                            version: instance.version.clone(),
                            backup,
                        })
                    }
                    Err(rollback_err) => {
                        transaction.advance(UpgradePhase::RollbackFailed);
                        Err(rollback_err)
                    }
                }
            }
        }
    }

    /// Take the backup triple without touching the instance. Shares the lock,
    /// audit, and privilege policy with the full transaction.
    pub fn backup_only(
        &self,
        instance_dir: &Path,
        options: &UpgradeOptions,
    ) -> Result<UpgradeOutcome, UpgradeError> {
        let instance = self.open_instance(instance_dir)?;
        let _lock = InstanceLock::acquire(&self.settings.run_dir, &instance.name)?;
        let mut transaction = UpgradeTransaction::new(&instance.name);

        transaction.advance(UpgradePhase::Auditing);
        self.preflight(&instance, false)?;

        apply_boundary(
            self.boundary,
            &self.settings.owner,
            &self.settings.group,
            options.permissive,
        )?;
        transaction.advance(UpgradePhase::PrivilegeDropped);

        transaction.advance(UpgradePhase::BackingUp);
        let backup = BackupManager::new(self.settings, self.runner).create(&instance)?;

        transaction.advance(UpgradePhase::BackupOnlyComplete);
        Ok(UpgradeOutcome::BackupOnlyComplete { backup })
    }

    fn open_instance(&self, dir: &Path) -> Result<OjsInstance, UpgradeError> {
        OjsInstance::open(dir, self.settings)
            .map_err(|err| UpgradeError::ConfigInvalid(format!("{err:#}")))
    }

    /// Exhaustive pre-flight audit. `mutating` adds the write requirements of
    /// the migration itself; a bare backup only reads the instance.
    fn preflight(&self, instance: &OjsInstance, mutating: bool) -> Result<(), UpgradeError> {
        let mut paths = vec![
            if mutating {
                AuditPath::read_write(&instance.base_dir)
            } else {
                AuditPath::read_only(&instance.base_dir)
            },
            AuditPath::read_write(&self.settings.backup_dir),
            AuditPath::read_write(&self.settings.db_backup_dir),
            AuditPath::read_write(&self.settings.www_backup_dir),
            AuditPath::read_write(&self.settings.files_backup_dir),
            AuditPath::read_write(&self.settings.run_dir),
            AuditPath::read_write(&self.settings.temp_dir),
        ];
        if mutating {
            paths.push(AuditPath::read_only(&self.settings.releases_dir));
        }
        if let Some(files_dir) = &instance.config.files_dir {
            paths.push(if mutating {
                AuditPath::read_write(files_dir)
            } else {
                AuditPath::read_only(files_dir)
            });
        }

        let mut space = vec![SpaceCheck {
            source_tree: instance.base_dir.clone(),
            destination: self.settings.www_backup_dir.clone(),
        }];
        if let Some(files_dir) = &instance.config.files_dir {
            space.push(SpaceCheck {
                source_tree: files_dir.clone(),
                destination: self.settings.files_backup_dir.clone(),
            });
        }

        let report = audit(&paths, &space, self.settings.disk_space_margin);
        let mut errors = report.into_errors();
        if errors.is_empty() {
            return Ok(());
        }
        // Every finding is surfaced; the first one carries the exit status.
        for extra in errors.iter().skip(1) {
            error!("{extra}");
        }
        Err(errors.remove(0))
    }
}
