use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{info, warn};
use ojsup_core::UpgradeError;

use crate::fs_ops::tree_size;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// One directory the transaction will touch, with the access it needs.
#[derive(Debug, Clone)]
pub struct AuditPath {
    pub path: PathBuf,
    pub mode: AccessMode,
}

impl AuditPath {
    pub fn read_only(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mode: AccessMode::ReadOnly,
        }
    }

    pub fn read_write(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mode: AccessMode::ReadWrite,
        }
    }
}

/// A tree about to be backed up and the destination that must hold it.
#[derive(Debug, Clone)]
pub struct SpaceCheck {
    pub source_tree: PathBuf,
    pub destination: PathBuf,
}

#[derive(Debug, Default)]
pub struct AuditReport {
    pub permission_violations: Vec<String>,
    pub disk_violations: Vec<String>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.permission_violations.is_empty() && self.disk_violations.is_empty()
    }

    /// Collapse the report into taxonomy errors, permission findings first.
    /// Each violation list stays under its own variant so the error names
    /// remain truthful; callers report every entry.
    pub fn into_errors(self) -> Vec<UpgradeError> {
        let mut out = Vec::new();
        if !self.permission_violations.is_empty() {
            out.push(UpgradeError::InsufficientPermissions {
                violations: self.permission_violations,
            });
        }
        if !self.disk_violations.is_empty() {
            out.push(UpgradeError::InsufficientDiskSpace {
                violations: self.disk_violations,
            });
        }
        out
    }
}

/// Pre-flight gate: verify every directory exists with the required access
/// and every backup destination has room for its source tree plus the safety
/// margin. Never stops at the first problem.
pub fn audit(paths: &[AuditPath], space: &[SpaceCheck], margin: u64) -> AuditReport {
    let mut report = AuditReport::default();

    for request in paths {
        let label = match request.mode {
            AccessMode::ReadOnly => "read",
            AccessMode::ReadWrite => "read+write",
        };
        if !request.path.exists() {
            warn!("audit: missing path {}", request.path.display());
            report
                .permission_violations
                .push(format!("no such path: {}", request.path.display()));
            continue;
        }
        let allowed = has_access(&request.path, request.mode);
        info!(
            "audit: {label} access to {} [{}]",
            request.path.display(),
            if allowed { "ok" } else { "denied" }
        );
        if !allowed {
            report.permission_violations.push(format!(
                "{label} access denied: {}",
                request.path.display()
            ));
        }
    }

    for check in space {
        match required_and_free(check, margin) {
            Ok((required, free)) => {
                info!(
                    "audit: {} needs {required} bytes at {} ({free} free)",
                    check.source_tree.display(),
                    check.destination.display()
                );
                if free < required {
                    report.disk_violations.push(format!(
                        "insufficient space at {}: need {required} bytes (including margin), {free} free",
                        check.destination.display()
                    ));
                }
            }
            Err(err) => {
                report
                    .disk_violations
                    .push(format!("cannot check free space: {err:#}"));
            }
        }
    }

    report
}

fn required_and_free(check: &SpaceCheck, margin: u64) -> Result<(u64, u64)> {
    let required = tree_size(&check.source_tree)?.saturating_add(margin);
    let free = free_space(&check.destination)?;
    Ok((required, free))
}

fn has_access(path: &Path, mode: AccessMode) -> bool {
    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    let amode = match mode {
        AccessMode::ReadOnly => libc::R_OK,
        AccessMode::ReadWrite => libc::R_OK | libc::W_OK,
    };
    unsafe { libc::access(c_path.as_ptr(), amode) == 0 }
}

fn free_space(path: &Path) -> Result<u64> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .with_context(|| format!("path contains a NUL byte: {}", path.display()))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("statvfs failed for {}", path.display()));
    }
    Ok(stat.f_frsize as u64 * stat.f_bavail as u64)
}
