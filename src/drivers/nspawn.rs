use tracing::{debug, info};

use super::{ContainerDriver, ContainerSpec, ContainerStatus, NetworkMode};
use crate::error::{ResourceKind, Result};
use crate::process::{Cmd, SharedExecutor};
use crate::wait::{poll_until, PollPolicy};

const UNIT_PREFIX: &str = "rootfs-builder-";

/// Transient systemd unit that hosts the container `name`.
pub fn unit_name(name: &str) -> String {
    format!("{}{}", UNIT_PREFIX, name)
}

/// [`ContainerDriver`] running `systemd-nspawn` under a transient
/// `systemd-run` unit, controlled through `machinectl`.
#[derive(Clone)]
pub struct Nspawn {
    exec: SharedExecutor,
    policy: PollPolicy,
}

impl Nspawn {
    /// `policy` bounds the waits for machine registration and shutdown.
    pub fn new(exec: SharedExecutor, policy: PollPolicy) -> Self {
        Self { exec, policy }
    }

    fn machinectl(&self) -> Cmd {
        Cmd::new("machinectl").kind(ResourceKind::Container)
    }

    fn boot_command(spec: &ContainerSpec) -> Cmd {
        let mut cmd = Cmd::new("systemd-run")
            .kind(ResourceKind::Container)
            .arg(format!("--unit={}", unit_name(&spec.name)))
            .arg("--collect")
            .arg("--property=KillMode=mixed")
            .arg("--property=Delegate=yes")
            .arg("--")
            .arg("systemd-nspawn")
            .args(["--quiet", "--keep-unit", "--boot"])
            .arg(format!("--machine={}", spec.name))
            .arg(format!("--directory={}", spec.rootfs.display()))
            .arg(format!("--hostname={}", spec.hostname));
        if !spec.capabilities.is_empty() {
            cmd = cmd.arg(format!("--capability={}", spec.capabilities.join(",")));
        }
        match &spec.network {
            NetworkMode::Host => cmd,
            NetworkMode::None => cmd.arg("--private-network"),
            NetworkMode::Veth => cmd.arg("--network-veth"),
            NetworkMode::Bridge(bridge) => cmd.arg(format!("--network-bridge={}", bridge)),
        }
    }
}

impl ContainerDriver for Nspawn {
    fn is_running(&self, name: &str) -> Result<bool> {
        let out = self.exec.run(
            &self
                .machinectl()
                .args(["show", name, "--property=State", "--value"])
                .read_only()
                .allow_fail(),
        )?;
        Ok(out.success() && out.stdout.trim() == "running")
    }

    fn start(&self, spec: &ContainerSpec) -> Result<()> {
        if self.is_running(&spec.name)? {
            debug!("container {} already running", spec.name);
            return Ok(());
        }

        info!("starting container {} from {}", spec.name, spec.rootfs.display());
        self.exec.run(&Self::boot_command(spec))?;
        self.exec.apply(
            &format!("wait for container {} to register", spec.name),
            &mut || {
                poll_until(&format!("container {} to register", spec.name), &self.policy, || {
                    self.is_running(&spec.name)
                })
            },
        )
    }

    fn stop(&self, name: &str, force: bool) -> Result<()> {
        if !self.is_running(name)? {
            debug!("container {} is not running", name);
            return Ok(());
        }

        info!("stopping container {}", name);
        let verb = if force { "terminate" } else { "poweroff" };
        self.exec.run(&self.machinectl().args([verb, name]))?;
        self.exec.apply(
            &format!("wait for container {} to stop", name),
            &mut || {
                poll_until(&format!("container {} to stop", name), &self.policy, || {
                    Ok(!self.is_running(name)?)
                })
            },
        )
    }

    fn destroy(&self, name: &str) -> Result<()> {
        self.stop(name, true)?;
        self.exec.run(
            &Cmd::new("systemctl")
                .kind(ResourceKind::Container)
                .arg("reset-failed")
                .arg(format!("{}.service", unit_name(name)))
                .allow_fail(),
        )?;
        Ok(())
    }

    fn run_command(&self, name: &str, command: &str) -> Result<i32> {
        debug!("running in {}: {}", name, command);
        let out = self.exec.run(
            &Cmd::new("systemd-run")
                .kind(ResourceKind::Container)
                .arg(format!("--machine={}", name))
                .args(["--wait", "--pipe", "--quiet", "--", "/bin/sh", "-c"])
                .arg(command)
                .allow_fail(),
        )?;
        if !out.stdout.trim().is_empty() {
            debug!("{}", out.stdout.trim_end());
        }
        if !out.success() && !out.stderr.trim().is_empty() {
            debug!("{}", out.stderr.trim_end());
        }
        Ok(out.code())
    }

    fn status(&self, name: &str) -> Result<ContainerStatus> {
        let out = self.exec.run(
            &self
                .machinectl()
                .args(["show", name, "--property=State", "--property=Leader", "--property=Timestamp"])
                .read_only()
                .allow_fail(),
        )?;
        if !out.success() {
            return Ok(ContainerStatus::absent(name));
        }

        let mut status = ContainerStatus::absent(name);
        for line in out.stdout.lines() {
            match line.split_once('=') {
                Some(("State", value)) => status.state = value.trim().to_string(),
                Some(("Leader", value)) => status.leader = value.trim().parse().ok(),
                Some(("Timestamp", value)) if !value.trim().is_empty() => {
                    status.since = Some(value.trim().to_string())
                }
                _ => {}
            }
        }
        Ok(status)
    }

    fn wait_until_ready(&self, name: &str, policy: &PollPolicy) -> Result<()> {
        self.exec.apply(
            &format!("wait for container {} to finish booting", name),
            &mut || {
                poll_until(&format!("container {} to boot", name), policy, || {
                    let out = self.exec.run(
                        &Cmd::new("systemctl")
                            .kind(ResourceKind::Container)
                            .arg(format!("--machine={}", name))
                            .arg("is-system-running")
                            .read_only()
                            .allow_fail(),
                    )?;
                    Ok(matches!(out.stdout.trim(), "running" | "degraded"))
                })
            },
        )
    }
}
