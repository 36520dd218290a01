use std::ffi::CString;

use log::{info, warn};
use ojsup_core::UpgradeError;

/// One-way privilege transition, modeled as a seam so tests can simulate
/// pre/post-drop behavior without real identity changes.
pub trait PrivilegeBoundary {
    /// Whether the process currently holds elevated privileges.
    fn is_elevated(&self) -> bool;

    /// Permanently drop to the named user and group. Must only be called
    /// while elevated; there is no way back.
    fn drop_to(&self, owner: &str, group: &str) -> Result<(), UpgradeError>;
}

/// Real unix boundary: `setgid` before `setuid`, both resolved by name.
#[derive(Debug, Default)]
pub struct SystemPrivilegeBoundary;

impl PrivilegeBoundary for SystemPrivilegeBoundary {
    fn is_elevated(&self) -> bool {
        unsafe { libc::geteuid() == 0 }
    }

    fn drop_to(&self, owner: &str, group: &str) -> Result<(), UpgradeError> {
        let failed = |detail: String| UpgradeError::PrivilegeDropFailed {
            owner: owner.to_string(),
            group: group.to_string(),
            detail,
        };

        let gid = resolve_group(group).map_err(&failed)?;
        let uid = resolve_user(owner).map_err(&failed)?;

        // Group first: once the uid is gone, setgid is no longer permitted.
        if unsafe { libc::setgid(gid) } != 0 {
            return Err(failed(format!(
                "setgid({gid}) failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        if unsafe { libc::setuid(uid) } != 0 {
            return Err(failed(format!(
                "setuid({uid}) failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        info!("dropped privileges to {owner}:{group} (uid={uid}, gid={gid})");
        Ok(())
    }
}

/// Apply the boundary according to the configured policy. The permissive
/// override skips the drop entirely and is logged as a risk.
pub fn apply_boundary(
    boundary: &dyn PrivilegeBoundary,
    owner: &str,
    group: &str,
    permissive: bool,
) -> Result<(), UpgradeError> {
    if permissive {
        warn!("permissive mode: keeping current privileges (use with caution)");
        return Ok(());
    }
    if !boundary.is_elevated() {
        info!("process is not elevated; no privileges to drop");
        return Ok(());
    }
    boundary.drop_to(owner, group)
}

fn resolve_user(name: &str) -> Result<libc::uid_t, String> {
    let c_name =
        CString::new(name).map_err(|_| format!("user name contains a NUL byte: {name}"))?;
    let entry = unsafe { libc::getpwnam(c_name.as_ptr()) };
    if entry.is_null() {
        return Err(format!("no such user: {name}"));
    }
    Ok(unsafe { (*entry).pw_uid })
}

fn resolve_group(name: &str) -> Result<libc::gid_t, String> {
    let c_name =
        CString::new(name).map_err(|_| format!("group name contains a NUL byte: {name}"))?;
    let entry = unsafe { libc::getgrnam(c_name.as_ptr()) };
    if entry.is_null() {
        return Err(format!("no such group: {name}"));
    }
    Ok(unsafe { (*entry).gr_gid })
}
