use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::UpgradeError;

/// Reserved `custom_files` key whose paths are preserved for every instance.
pub const WILDCARD_INSTANCE: &str = "all";

const DEFAULT_DISK_SPACE_MARGIN: u64 = 1_000_000_000;

const LOCK_DIR_CANDIDATES: [&str; 6] = [
    "/run/lock",
    "/var/lock",
    "/run",
    "/var/run",
    "/tmp",
    "/dev/shm",
];

/// Immutable operator configuration. Constructed and validated once, then
/// passed by reference to every component; there is no process-wide settings
/// singleton.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub owner: String,
    pub group: String,
    /// Marker paths (relative to a directory) that identify an OJS tree.
    pub locations: Vec<PathBuf>,
    /// Version descriptor path, relative to an instance root.
    pub version_file: PathBuf,
    /// Instance configuration file, relative to an instance root.
    pub config_file: PathBuf,
    /// Root folder holding extracted release candidates.
    pub releases_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub db_backup_dir: PathBuf,
    pub www_backup_dir: PathBuf,
    pub files_backup_dir: PathBuf,
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    /// chrono format string for backup timestamps, e.g. "%Y-%m-%d_%H-%M-%S".
    pub timestamp_format: String,
    /// Suffix appended to incoming files that collide with preserved ones.
    pub suffix_new: String,
    #[serde(default)]
    pub mysql_dump: Option<PathBuf>,
    #[serde(default)]
    pub mysql: Option<PathBuf>,
    #[serde(default)]
    pub php_interpreter: Option<PathBuf>,
    #[serde(default = "default_disk_space_margin")]
    pub disk_space_margin: u64,
    /// Instance name (or the wildcard "all") to relative paths that must
    /// survive an upgrade.
    #[serde(default)]
    pub custom_files: BTreeMap<String, Vec<PathBuf>>,
}

fn default_disk_space_margin() -> u64 {
    DEFAULT_DISK_SPACE_MARGIN
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_run_dir() -> PathBuf {
    LOCK_DIR_CANDIDATES
        .iter()
        .map(PathBuf::from)
        .find(|dir| dir.exists())
        .unwrap_or_else(std::env::temp_dir)
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, UpgradeError> {
        let raw = fs::read_to_string(path).map_err(|err| {
            UpgradeError::ConfigInvalid(format!(
                "failed to read settings file {}: {err}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, UpgradeError> {
        let settings: Self = toml::from_str(raw)
            .map_err(|err| UpgradeError::ConfigInvalid(err.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), UpgradeError> {
        if self.owner.trim().is_empty() || self.group.trim().is_empty() {
            return Err(UpgradeError::ConfigInvalid(
                "owner and group must not be empty".to_string(),
            ));
        }
        if self.locations.is_empty() {
            return Err(UpgradeError::ConfigInvalid(
                "locations must list at least one instance marker path".to_string(),
            ));
        }
        if self.suffix_new.is_empty() {
            return Err(UpgradeError::ConfigInvalid(
                "suffix_new must not be empty".to_string(),
            ));
        }
        if self.timestamp_format.trim().is_empty() {
            return Err(UpgradeError::ConfigInvalid(
                "timestamp_format must not be empty".to_string(),
            ));
        }

        for (label, path) in [
            ("version_file", &self.version_file),
            ("config_file", &self.config_file),
        ] {
            if path.is_absolute() {
                return Err(UpgradeError::ConfigInvalid(format!(
                    "{label} must be relative to the instance root: {}",
                    path.display()
                )));
            }
        }

        for (instance, paths) in &self.custom_files {
            for path in paths {
                if path.is_absolute() {
                    return Err(UpgradeError::ConfigInvalid(format!(
                        "custom_files entry for '{instance}' must be relative: {}",
                        path.display()
                    )));
                }
            }
        }

        Ok(())
    }

    /// Paths to preserve for the named instance: wildcard rules first, then
    /// instance-specific ones, deduplicated in rule order.
    pub fn custom_paths_for(&self, instance_name: &str) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = Vec::new();
        for key in [WILDCARD_INSTANCE, instance_name] {
            if let Some(paths) = self.custom_files.get(key) {
                for path in paths {
                    if !out.contains(path) {
                        out.push(path.clone());
                    }
                }
            }
        }
        out
    }
}
