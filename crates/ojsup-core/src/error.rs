use std::path::PathBuf;

use semver::Version;
use thiserror::Error;

/// Failure taxonomy for the upgrade transaction. The orchestrator and the
/// exit-code mapping match on these variants; free-form detail travels in the
/// variant payloads.
#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("invalid settings: {0}")]
    ConfigInvalid(String),

    #[error("no release candidate found under {root}")]
    NoCandidateFound { root: PathBuf },

    #[error("malformed version descriptor: {0}")]
    MalformedVersion(String),

    #[error("no upgrade needed: instance at {current}, newest release {target}")]
    NoUpgradeNeeded { current: Version, target: Version },

    #[error("insufficient permissions:\n{}", .violations.join("\n"))]
    InsufficientPermissions { violations: Vec<String> },

    #[error("insufficient disk space:\n{}", .violations.join("\n"))]
    InsufficientDiskSpace { violations: Vec<String> },

    #[error("privilege drop to {owner}:{group} failed: {detail}")]
    PrivilegeDropFailed {
        owner: String,
        group: String,
        detail: String,
    },

    #[error("backup incomplete ({stage}): {detail}")]
    BackupIncomplete { stage: String, detail: String },

    #[error("schema upgrade command failed: {0}")]
    SchemaUpgradeFailed(String),

    #[error("post-upgrade verification failed: descriptor reads {found}, expected {expected}")]
    VerificationFailed { expected: Version, found: Version },

    #[error("rollback failed: {detail}; artifacts kept for manual recovery:\n{}", .artifacts.iter().map(|p| format!("  {}", p.display())).collect::<Vec<_>>().join("\n"))]
    RollbackFailed {
        detail: String,
        artifacts: Vec<PathBuf>,
    },

    #[error("another invocation holds the lock for this instance: {lock_path}")]
    LockContention { lock_path: PathBuf },
}

impl UpgradeError {
    /// Process exit code for this failure. Pre-flight problems map to 2,
    /// runtime failures followed by a successful rollback to 3, and a failed
    /// rollback to 4.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::RollbackFailed { .. } => 4,
            Self::BackupIncomplete { .. }
            | Self::SchemaUpgradeFailed(_)
            | Self::VerificationFailed { .. } => 3,
            _ => 2,
        }
    }

    pub fn is_preflight(&self) -> bool {
        self.exit_code() == 2
    }
}
