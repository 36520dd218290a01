use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use semver::{BuildMetadata, Version};

/// Contents of an OJS `version.xml` descriptor. Only the elements the
/// upgrader acts on are retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionDescriptor {
    pub application: Option<String>,
    pub release: String,
    pub date: Option<String>,
    pub version: Version,
}

pub fn read_version_file(path: &Path) -> Result<VersionDescriptor> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read version descriptor: {}", path.display()))?;
    parse_version_descriptor(&raw)
        .with_context(|| format!("failed to parse version descriptor: {}", path.display()))
}

pub fn parse_version_descriptor(raw: &str) -> Result<VersionDescriptor> {
    let mut application = None;
    let mut release = None;
    let mut date = None;

    for (tag, text) in scan_elements(raw)? {
        // OJS descriptors carry a <patch> element that repeats; skip it.
        if tag == "patch" {
            continue;
        }
        let slot = match tag.as_str() {
            "application" => &mut application,
            "release" => &mut release,
            "date" => &mut date,
            _ => continue,
        };
        if slot.is_some() {
            return Err(anyhow!("duplicate <{tag}> element"));
        }
        *slot = Some(text);
    }

    let release = release.ok_or_else(|| anyhow!("missing <release> element"))?;
    let version = parse_release_version(&release)?;
    Ok(VersionDescriptor {
        application,
        release,
        date,
        version,
    })
}

/// Parse an OJS release string into a semver version. OJS historically ships
/// four-component releases ("3.3.0.8"); the fourth component is folded into
/// build metadata so dotted-numeric precedence still holds for the first
/// three.
pub fn parse_release_version(release: &str) -> Result<Version> {
    let release = release.trim();
    if let Ok(version) = Version::parse(release) {
        return Ok(version);
    }

    let parts: Vec<&str> = release.split('.').collect();
    if parts.len() > 3 && parts.iter().all(|p| p.chars().all(|c| c.is_ascii_digit())) {
        let base = format!("{}.{}.{}", parts[0], parts[1], parts[2]);
        let mut version = Version::parse(&base)
            .with_context(|| format!("invalid release version: {release}"))?;
        version.build = BuildMetadata::new(&parts[3..].join("."))
            .with_context(|| format!("invalid release version: {release}"))?;
        return Ok(version);
    }

    Err(anyhow!("invalid release version: {release}"))
}

// Minimal element scanner for the flat descriptor format. A full XML
// dependency is not warranted for one fixed file shape.
fn scan_elements(raw: &str) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    let mut rest = raw;

    while let Some(start) = rest.find('<') {
        rest = &rest[start + 1..];
        if rest.starts_with('?') || rest.starts_with('!') || rest.starts_with('/') {
            match rest.find('>') {
                Some(end) => {
                    rest = &rest[end + 1..];
                    continue;
                }
                None => break,
            }
        }

        let end = rest
            .find('>')
            .ok_or_else(|| anyhow!("unterminated element tag"))?;
        let tag_body = &rest[..end];
        if tag_body.ends_with('/') {
            rest = &rest[end + 1..];
            continue;
        }
        let name = tag_body
            .split_whitespace()
            .next()
            .ok_or_else(|| anyhow!("empty element tag"))?
            .to_string();
        rest = &rest[end + 1..];

        let close = format!("</{name}>");
        let Some(close_at) = rest.find(&close) else {
            continue;
        };
        let text = rest[..close_at].trim();
        if text.contains('<') {
            // Container element (such as the root); descend into it.
            continue;
        }
        out.push((name, text.to_string()));
        rest = &rest[close_at + close.len()..];
    }

    Ok(out)
}
