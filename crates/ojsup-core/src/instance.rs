use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use semver::Version;

use crate::descriptor::{read_version_file, VersionDescriptor};
use crate::Settings;

/// Database connection parameters read from an instance's config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub driver: String,
    pub host: String,
    pub username: String,
    pub password: String,
    pub name: String,
}

/// Subset of `config.inc.php` the upgrader acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceConfig {
    pub database: DatabaseConfig,
    pub files_dir: Option<PathBuf>,
    pub installed: bool,
}

/// One deployed OJS installation, identified by its directory.
#[derive(Debug, Clone)]
pub struct OjsInstance {
    pub base_dir: PathBuf,
    pub name: String,
    pub descriptor: VersionDescriptor,
    pub version: Version,
    pub config: InstanceConfig,
}

impl OjsInstance {
    /// Open a live instance: the marker check, version descriptor, and config
    /// file must all be present.
    pub fn open(dir: &Path, settings: &Settings) -> Result<Self> {
        if !is_instance(dir, &settings.locations) {
            return Err(anyhow!("not an OJS instance: {}", dir.display()));
        }
        let name = instance_name(dir)?;
        let descriptor = read_version_file(&dir.join(&settings.version_file))?;
        let config = read_instance_config(&dir.join(&settings.config_file))?;
        let version = descriptor.version.clone();
        Ok(Self {
            base_dir: dir.to_path_buf(),
            name,
            descriptor,
            version,
            config,
        })
    }

    pub fn config_path(&self, settings: &Settings) -> PathBuf {
        self.base_dir.join(&settings.config_file)
    }

    pub fn version_file_path(&self, settings: &Settings) -> PathBuf {
        self.base_dir.join(&settings.version_file)
    }
}

pub fn instance_name(dir: &Path) -> Result<String> {
    dir.file_name()
        .and_then(|name| name.to_str())
        .map(ToOwned::to_owned)
        .ok_or_else(|| anyhow!("instance directory has no usable name: {}", dir.display()))
}

/// A directory looks like an OJS tree when all configured marker paths exist.
pub fn is_instance(dir: &Path, markers: &[PathBuf]) -> bool {
    markers.iter().all(|marker| dir.join(marker).exists())
}

pub fn read_instance_config(path: &Path) -> Result<InstanceConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read instance config: {}", path.display()))?;
    parse_instance_config(&raw)
        .with_context(|| format!("failed to parse instance config: {}", path.display()))
}

pub fn parse_instance_config(raw: &str) -> Result<InstanceConfig> {
    let sections = parse_ini_sections(raw);

    let database = sections
        .get("database")
        .ok_or_else(|| anyhow!("missing [database] section"))?;
    let field = |key: &str| -> Result<String> {
        database
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("missing database setting: {key}"))
    };

    let files_dir = sections
        .get("files")
        .and_then(|files| files.get("files_dir"))
        .map(PathBuf::from);
    let installed = sections
        .get("general")
        .and_then(|general| general.get("installed"))
        .map(|value| value.eq_ignore_ascii_case("on"))
        .unwrap_or(false);

    Ok(InstanceConfig {
        database: DatabaseConfig {
            driver: field("driver")?,
            host: field("host")?,
            username: field("username")?,
            password: field("password")?,
            name: field("name")?,
        },
        files_dir,
        installed,
    })
}

/// Rewrite the `installed` flag in place, touching only that one line so the
/// operator's comments survive. Returns an error if no such line exists.
pub fn set_installed(config_path: &Path, on: bool) -> Result<()> {
    let raw = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read instance config: {}", config_path.display()))?;

    let mut found = false;
    let mut out = String::with_capacity(raw.len());
    for line in raw.lines() {
        if is_installed_line(line) {
            found = true;
            out.push_str(if on { "installed = On" } else { "installed = Off" });
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }

    if !found {
        return Err(anyhow!(
            "no 'installed' setting found in {}",
            config_path.display()
        ));
    }

    fs::write(config_path, out)
        .with_context(|| format!("failed to write instance config: {}", config_path.display()))?;
    Ok(())
}

fn is_installed_line(line: &str) -> bool {
    let trimmed = line.trim();
    let Some(rest) = trimmed.strip_prefix("installed") else {
        return false;
    };
    let rest = rest.trim_start();
    let Some(value) = rest.strip_prefix('=') else {
        return false;
    };
    let value = value.trim();
    value.eq_ignore_ascii_case("on") || value.eq_ignore_ascii_case("off")
}

fn parse_ini_sections(raw: &str) -> BTreeMap<String, BTreeMap<String, String>> {
    let mut sections: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    let mut current = String::new();

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            current = section.trim().to_string();
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();
        sections
            .entry(current.clone())
            .or_default()
            .insert(key.trim().to_string(), value);
    }

    sections
}
