//! Base OS installation into a build root.
//!
//! `debootstrap` populates the root; [`write_base_config`] then writes the
//! few files a container needs before first boot. The policy-rc.d guard
//! keeps package installs from starting services until the build is
//! finalized.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tracing::info;

use crate::config::{Distribution, OsConfig};
use crate::error::{IoContext, ResourceKind, Result};
use crate::process::{Cmd, Executor};

pub const POLICY_RC_D: &str = "usr/sbin/policy-rc.d";
const POLICY_RC_D_BODY: &str = "#!/bin/sh\n# Services stay down while the image is being built.\nexit 101\n";

/// Run debootstrap for `os` into `rootfs`.
pub fn debootstrap(exec: &dyn Executor, os: &OsConfig, rootfs: &Path) -> Result<()> {
    info!(
        "installing {:?} {} ({}) into {}",
        os.distribution,
        os.release,
        os.arch,
        rootfs.display()
    );
    let mut cmd = Cmd::new("debootstrap")
        .kind(ResourceKind::Install)
        .arg(format!("--arch={}", os.arch))
        .arg("--variant=minbase")
        .arg(format!("--components={}", os.components().join(",")));
    if !os.include.is_empty() {
        cmd = cmd.arg(format!("--include={}", os.include.join(",")));
    }
    exec.run(
        &cmd.arg(&os.release)
            .arg(rootfs)
            .arg(os.mirror_url()),
    )?;
    Ok(())
}

/// Write hostname, hosts, apt sources and the policy-rc.d guard.
pub fn write_base_config(
    exec: &dyn Executor,
    os: &OsConfig,
    rootfs: &Path,
    hostname: &str,
) -> Result<()> {
    let files = [
        ("etc/hostname", format!("{}\n", hostname)),
        ("etc/hosts", render_hosts(hostname)),
        ("etc/apt/sources.list", render_sources_list(os)),
        (POLICY_RC_D, POLICY_RC_D_BODY.to_string()),
    ];

    exec.apply(
        &format!("write base configuration into {}", rootfs.display()),
        &mut || {
            for (rel, content) in &files {
                let path = rootfs.join(rel);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)
                        .io_context(|| format!("creating '{}'", parent.display()))?;
                }
                fs::write(&path, content)
                    .io_context(|| format!("writing '{}'", path.display()))?;
            }
            let guard = rootfs.join(POLICY_RC_D);
            fs::set_permissions(&guard, fs::Permissions::from_mode(0o755))
                .io_context(|| format!("setting mode on '{}'", guard.display()))?;
            Ok(())
        },
    )
}

pub fn remove_policy_rc_d(exec: &dyn Executor, rootfs: &Path) -> Result<()> {
    let guard = rootfs.join(POLICY_RC_D);
    exec.apply(&format!("remove {}", guard.display()), &mut || {
        if guard.exists() {
            fs::remove_file(&guard).io_context(|| format!("removing '{}'", guard.display()))?;
        }
        Ok(())
    })
}

pub fn render_hosts(hostname: &str) -> String {
    format!(
        "127.0.0.1\tlocalhost\n127.0.1.1\t{}\n\n::1\tlocalhost ip6-localhost ip6-loopback\nff02::1\tip6-allnodes\nff02::2\tip6-allrouters\n",
        hostname
    )
}

pub fn render_sources_list(os: &OsConfig) -> String {
    let components = os.components().join(" ");
    let mirror = os.mirror_url();
    let security = match os.distribution {
        Distribution::Ubuntu => format!(
            "deb http://security.ubuntu.com/ubuntu {}-security {}",
            os.release, components
        ),
        Distribution::Debian => format!(
            "deb http://security.debian.org/debian-security {}-security {}",
            os.release, components
        ),
    };
    format!(
        "deb {m} {r} {c}\ndeb {m} {r}-updates {c}\n{s}\n",
        m = mirror,
        r = os.release,
        c = components,
        s = security
    )
}
