use std::fs;
use std::path::PathBuf;

use log::{debug, warn};
use ojsup_core::{is_instance, read_version_file, Settings, UpgradeError};
use semver::Version;

/// An extracted, not-yet-applied OJS release found under the releases root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseCandidate {
    pub path: PathBuf,
    pub descriptor_path: PathBuf,
    pub release: String,
    pub version: Version,
}

/// Scan the configured releases root for candidate trees. A subdirectory
/// qualifies when the instance markers are present and its descriptor parses;
/// a malformed descriptor skips that candidate with a warning rather than
/// failing the scan. Returns candidates sorted by ascending version.
pub fn discover_candidates(settings: &Settings) -> Result<Vec<ReleaseCandidate>, UpgradeError> {
    let root = &settings.releases_dir;
    let entries = fs::read_dir(root).map_err(|_| UpgradeError::NoCandidateFound {
        root: root.clone(),
    })?;

    let mut candidates = Vec::new();
    for entry in entries {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if !is_instance(&path, &settings.locations) {
            debug!("skipping {} (missing instance markers)", path.display());
            continue;
        }

        let descriptor_path = path.join(&settings.version_file);
        match read_version_file(&descriptor_path) {
            Ok(descriptor) => {
                debug!("release candidate {} at {}", descriptor.release, path.display());
                candidates.push(ReleaseCandidate {
                    path,
                    descriptor_path,
                    release: descriptor.release,
                    version: descriptor.version,
                });
            }
            Err(err) => {
                warn!("skipping candidate {}: {err:#}", path.display());
            }
        }
    }

    if candidates.is_empty() {
        return Err(UpgradeError::NoCandidateFound { root: root.clone() });
    }

    candidates.sort_by(|a, b| a.version.cmp(&b.version));

    // Descriptors are expected to carry unique versions; equal neighbors mean
    // two trees claim the same release.
    for pair in candidates.windows(2) {
        if pair[0].version == pair[1].version {
            return Err(UpgradeError::MalformedVersion(format!(
                "ambiguous candidates for version {}: {} and {}",
                pair[0].version,
                pair[0].path.display(),
                pair[1].path.display()
            )));
        }
    }

    Ok(candidates)
}

/// Pick the upgrade target: the highest candidate, or the explicitly forced
/// version which must exist among the candidates.
pub fn select_candidate<'a>(
    candidates: &'a [ReleaseCandidate],
    target: Option<&Version>,
) -> Result<&'a ReleaseCandidate, UpgradeError> {
    match target {
        Some(version) => candidates
            .iter()
            .find(|candidate| &candidate.version == version)
            .ok_or_else(|| {
                UpgradeError::MalformedVersion(format!("no candidate for requested version {version}"))
            }),
        None => candidates
            .iter()
            .max_by(|a, b| a.version.cmp(&b.version))
            .ok_or_else(|| UpgradeError::MalformedVersion("empty candidate set".to_string())),
    }
}

/// Gate on strict version increase unless the operator forces the upgrade.
pub fn check_upgrade_needed(
    current: &Version,
    chosen: &ReleaseCandidate,
    force: bool,
) -> Result<(), UpgradeError> {
    if chosen.version > *current {
        return Ok(());
    }
    if force {
        warn!(
            "enforcing upgrade: instance at {current}, target {} is not newer",
            chosen.version
        );
        return Ok(());
    }
    Err(UpgradeError::NoUpgradeNeeded {
        current: current.clone(),
        target: chosen.version.clone(),
    })
}

#[cfg(test)]
mod tests;
