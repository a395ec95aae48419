//! Configuration management of a booted build.
//!
//! The orchestrator only knows the [`Provisioner`] contract. The stock
//! implementation applies an Ansible playbook to the build root and installs
//! extra packages with apt inside the running container.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::drivers::ContainerDriver;
use crate::error::{Error, ResourceKind, Result};
use crate::process::{Cmd, SharedExecutor};
use crate::validate::parse_package_list;

/// What a provisioner is pointed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionTarget {
    pub build: String,
    pub container: String,
    pub rootfs: PathBuf,
    pub hostname: String,
    pub playbook: Option<PathBuf>,
    pub extra_args: Vec<String>,
}

/// Configures a build while its container is booted.
///
/// `configure` may reach the build through the container or through
/// `target.rootfs` directly; either way the container is running when it is
/// called. Package installation always goes through the running machine.
pub trait Provisioner: Send + Sync {
    fn configure(&self, target: &ProvisionTarget) -> Result<()>;

    /// Install a comma-delimited package list inside `container`.
    fn install_packages(&self, container: &str, packages: &str) -> Result<()>;
}

/// Runs `ansible-playbook` over the `community.general.chroot` connection
/// against the build root on the host, while the container is booted on the
/// same directory. Tasks therefore see the container's filesystem but run
/// host-side, without the container's services or network namespace;
/// playbooks that need a live service should use `container_name` to reach
/// it through `machinectl`. Packages are installed with apt inside the
/// running container.
pub struct AnsibleProvisioner {
    exec: SharedExecutor,
    containers: Arc<dyn ContainerDriver>,
}

impl AnsibleProvisioner {
    pub fn new(exec: SharedExecutor, containers: Arc<dyn ContainerDriver>) -> Self {
        Self { exec, containers }
    }

    pub fn playbook_command(target: &ProvisionTarget, playbook: &std::path::Path) -> Cmd {
        Cmd::new("ansible-playbook")
            .kind(ResourceKind::Provision)
            .env("ANSIBLE_NOCOLOR", "1")
            .arg("-i")
            .arg(format!("{},", target.rootfs.display()))
            .args(["-c", "community.general.chroot"])
            .arg("-e")
            .arg(format!("build_name={}", target.build))
            .arg("-e")
            .arg(format!("container_name={}", target.container))
            .arg("-e")
            .arg(format!("target_hostname={}", target.hostname))
            .args(&target.extra_args)
            .arg(playbook)
    }

    fn in_container(&self, container: &str, command: &str) -> Result<()> {
        let code = self.containers.run_command(container, command)?;
        if code != 0 {
            return Err(Error::resource(
                ResourceKind::Provision,
                format!("`{}` in {} exited with status {}", command, container, code),
            ));
        }
        Ok(())
    }
}

impl Provisioner for AnsibleProvisioner {
    fn configure(&self, target: &ProvisionTarget) -> Result<()> {
        let Some(playbook) = &target.playbook else {
            info!("no playbook configured for {}, skipping", target.build);
            return Ok(());
        };
        if !playbook.is_file() {
            return Err(Error::config(format!(
                "playbook '{}' does not exist",
                playbook.display()
            )));
        }

        info!("applying {} to {}", playbook.display(), target.build);
        self.exec.run(&Self::playbook_command(target, playbook))?;
        Ok(())
    }

    fn install_packages(&self, container: &str, packages: &str) -> Result<()> {
        let packages = parse_package_list(packages)?;
        if packages.is_empty() {
            return Ok(());
        }

        info!("installing {} package(s) in {}", packages.len(), container);
        self.in_container(container, "DEBIAN_FRONTEND=noninteractive apt-get update -q")?;
        self.in_container(
            container,
            &format!(
                "DEBIAN_FRONTEND=noninteractive apt-get install -y -q --no-install-recommends {}",
                packages.join(" ")
            ),
        )
    }
}
