//! Preflight checks for build validation.
//!
//! Validates that the host has the tools, privileges and pool a build needs
//! before any state is written, so a build never fails halfway for a reason
//! that was knowable up front.
//!
//! # Example
//!
//! ```rust
//! use zfs_rootfs_builder::preflight::{check_required_tools, command_exists};
//!
//! // Check a single command
//! if !command_exists("debootstrap") {
//!     println!("debootstrap not installed");
//! }
//!
//! // Check multiple tools
//! let tools = &[("zfs", "zfsutils-linux"), ("machinectl", "systemd-container")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use tracing::debug;

use crate::config::Config;
use crate::drivers::DatasetDriver;
use crate::error::{Error, MissingTool, Result};

/// Check if a command exists on the host system.
///
/// Uses `which` to locate the command in PATH.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Required host tools for building root filesystems.
///
/// Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("zfs", "zfsutils-linux"),
    ("zpool", "zfsutils-linux"),
    ("debootstrap", "debootstrap"),
    ("systemd-nspawn", "systemd-container"),
    ("machinectl", "systemd-container"),
    ("systemd-run", "systemd"),
    ("systemctl", "systemd"),
    ("cp", "coreutils"),
];

/// Needed only when a playbook is configured.
pub const PROVISION_TOOLS: &[(&str, &str)] = &[("ansible-playbook", "ansible")];

/// Check that specific tools are available.
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` listing every missing tool and its package
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<MissingTool> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .map(|(tool, package)| MissingTool {
            tool: tool.to_string(),
            package: Some(package.to_string()),
        })
        .collect();

    if !missing.is_empty() {
        return Err(Error::Dependency { missing });
    }
    Ok(())
}

/// ZFS and container management need root.
pub fn check_privileges() -> Result<()> {
    // SAFETY: geteuid has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        return Err(Error::Permission(format!(
            "running as uid {}; building requires root",
            euid
        )));
    }
    Ok(())
}

/// Tool and privilege checks for a build with `config`. A dry run only
/// needs the read-only tools, so the privilege check is skipped.
pub fn check_host(config: &Config, dry_run: bool) -> Result<()> {
    let mut tools: Vec<(&str, &str)> = REQUIRED_TOOLS.to_vec();
    if config.provision.playbook.is_some() {
        tools.extend_from_slice(PROVISION_TOOLS);
    }
    check_required_tools(&tools)?;
    if !dry_run {
        check_privileges()?;
    }
    debug!("host checks passed");
    Ok(())
}

/// The pool must exist and be `ONLINE`.
pub fn check_pool(datasets: &dyn DatasetDriver, pool: &str) -> Result<()> {
    let health = datasets.pool_health(pool)?;
    if health != "ONLINE" {
        return Err(Error::config(format!(
            "pool '{}' is {}; refusing to build on it",
            pool, health
        )));
    }
    debug!("pool {} is ONLINE", pool);
    Ok(())
}
