use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{BuildLayout, Orchestrator};
use crate::drivers::{ContainerSpec, CreateOptions};
use crate::error::{Error, IoContext, ResourceKind, Result};
use crate::install;
use crate::process::Cmd;
use crate::provision::ProvisionTarget;
use crate::recovery::{Action, RecoverySession};
use crate::status::BuildStatus;

const LOG_ASIDE: &str = "var/log.pre-varlog";

/// Marker operation name for `op` of `stage`.
pub(crate) fn marker(stage: BuildStatus, op: &str) -> String {
    format!("{}.{}", stage, op)
}

fn stop_container_action(container: &str) -> String {
    format!("stop container {}", container)
}

/// Run `body` as one all-or-nothing step: its rollback entries are undone
/// if it fails and dropped if it succeeds.
fn atomically<F>(session: &mut RecoverySession, what: &str, body: F) -> Result<()>
where
    F: FnOnce(&mut RecoverySession) -> Result<()>,
{
    session.clear_rollback();
    match body(session) {
        Ok(()) => {
            session.clear_rollback();
            Ok(())
        }
        Err(err) => {
            if let Err(rollback_err) = session.execute_rollback() {
                warn!("undoing {} did not finish: {}", what, rollback_err);
            }
            Err(err)
        }
    }
}

impl Orchestrator {
    pub(super) fn run_stage(
        &self,
        session: &mut RecoverySession,
        layout: &BuildLayout,
        stage: BuildStatus,
    ) -> Result<()> {
        match stage {
            BuildStatus::Started => self.stage_started(),
            BuildStatus::DatasetsCreated => self.stage_datasets(session, layout),
            BuildStatus::OsInstalled => self.stage_os(session, layout),
            BuildStatus::VarlogMounted => self.stage_varlog(session, layout),
            BuildStatus::ContainerCreated => self.stage_container(session, layout),
            BuildStatus::AnsibleConfigured => self.stage_configure(session, layout),
            BuildStatus::Completed => self.stage_finalize(session, layout),
            BuildStatus::Failed => Err(Error::validation(
                "stage",
                stage.as_str(),
                "not a runnable stage",
            )),
        }
    }

    fn stage_started(&self) -> Result<()> {
        let base = &self.config.zfs.mount_base;
        self.exec.apply(&format!("create {}", base.display()), &mut || {
            fs::create_dir_all(base).io_context(|| format!("creating '{}'", base.display()))
        })
    }

    fn stage_datasets(&self, session: &mut RecoverySession, layout: &BuildLayout) -> Result<()> {
        let datasets = &self.datasets;
        atomically(session, "dataset creation", |session| {
            datasets.create(&layout.parent_dataset, &CreateOptions::new().parents())?;

            let root_existed = datasets.exists(&layout.root_dataset)?;
            datasets.create(
                &layout.root_dataset,
                &CreateOptions::new().mountpoint(&layout.mountpoint),
            )?;
            if !root_existed {
                let datasets = Arc::clone(datasets);
                let root = layout.root_dataset.clone();
                session.add_rollback(Action::new(format!("destroy {}", root), move || {
                    datasets.destroy(&root, true, true)
                }))?;
            }

            datasets.create(
                &layout.varlog_dataset,
                &CreateOptions::new().property("canmount", "noauto"),
            )
        })
    }

    fn stage_os(&self, session: &mut RecoverySession, layout: &BuildLayout) -> Result<()> {
        let build = &layout.build;
        let rootfs = &layout.mountpoint;

        let op = marker(BuildStatus::OsInstalled, "debootstrap");
        if session.is_operation_complete(build, &op) {
            info!("debootstrap already done for {}", build);
        } else {
            install::debootstrap(&*self.exec, &self.config.os, rootfs)?;
            session.mark_operation_complete(build, &op)?;
        }

        let op = marker(BuildStatus::OsInstalled, "base-config");
        if session.is_operation_complete(build, &op) {
            info!("base configuration already written for {}", build);
        } else {
            install::write_base_config(&*self.exec, &self.config.os, rootfs, &layout.hostname)?;
            session.mark_operation_complete(build, &op)?;
        }
        Ok(())
    }

    /// Move the root's `/var/log` onto its own dataset, keeping its content.
    ///
    /// Completion is tracked by marker rather than by the dataset's mount
    /// state: a rollback restores an older `/var/log` under a dataset that
    /// stays mounted, and that content still has to be migrated.
    fn stage_varlog(&self, session: &mut RecoverySession, layout: &BuildLayout) -> Result<()> {
        let build = &layout.build;
        let log_dir = layout.mountpoint.join("var/log");
        let aside = layout.mountpoint.join(LOG_ASIDE);
        let mounted = self
            .datasets
            .get_property(&layout.varlog_dataset, "mounted")?
            .as_deref()
            == Some("yes");

        let op = marker(BuildStatus::VarlogMounted, "migrate");
        if session.is_operation_complete(build, &op) {
            if mounted {
                info!("{} already mounted", layout.varlog_dataset);
            } else {
                info!("var/log already migrated, remounting {}", layout.varlog_dataset);
                self.datasets.mount(&layout.varlog_dataset, &log_dir)?;
            }
            return Ok(());
        }
        if mounted {
            // The root's own var/log sits underneath.
            self.datasets.unmount(&layout.varlog_dataset, true)?;
        }

        atomically(session, "var/log migration", |session| {
            if log_dir.is_dir() && !aside.exists() {
                self.exec.apply(
                    &format!("move {} to {}", log_dir.display(), aside.display()),
                    &mut || {
                        fs::rename(&log_dir, &aside).io_context(|| {
                            format!("moving '{}' aside", log_dir.display())
                        })
                    },
                )?;
            }
            if aside.is_dir() {
                let (log_dir, aside) = (log_dir.clone(), aside.clone());
                session.add_rollback(Action::new("restore var/log", move || {
                    restore_aside(&log_dir, &aside)
                }))?;
            }

            self.exec.apply(&format!("create {}", log_dir.display()), &mut || {
                fs::create_dir_all(&log_dir)
                    .io_context(|| format!("creating '{}'", log_dir.display()))
            })?;
            self.datasets.mount(&layout.varlog_dataset, &log_dir)?;
            let datasets = Arc::clone(&self.datasets);
            let varlog = layout.varlog_dataset.clone();
            session.add_rollback(Action::new(format!("unmount {}", varlog), move || {
                datasets.unmount(&varlog, true)
            }))?;

            if aside.is_dir() {
                self.exec.run(
                    &Cmd::new("cp")
                        .kind(ResourceKind::Mount)
                        .arg("-a")
                        .arg(format!("{}/.", aside.display()))
                        .arg(&log_dir),
                )?;
                self.exec.apply(&format!("remove {}", aside.display()), &mut || {
                    fs::remove_dir_all(&aside)
                        .io_context(|| format!("removing '{}'", aside.display()))
                })?;
            }
            Ok(())
        })?;
        session.mark_operation_complete(build, &op)
    }

    fn stage_container(&self, session: &mut RecoverySession, layout: &BuildLayout) -> Result<()> {
        self.boot_container(session, layout)
    }

    fn stage_configure(&self, session: &mut RecoverySession, layout: &BuildLayout) -> Result<()> {
        self.ensure_container(session, layout)?;
        let build = &layout.build;

        let op = marker(BuildStatus::AnsibleConfigured, "configure");
        if session.is_operation_complete(build, &op) {
            info!("configuration already applied to {}", build);
        } else {
            self.provisioner.configure(&ProvisionTarget {
                build: build.clone(),
                container: layout.container.clone(),
                rootfs: layout.mountpoint.clone(),
                hostname: layout.hostname.clone(),
                playbook: self.config.provision.playbook.clone(),
                extra_args: self.config.provision.extra_args.clone(),
            })?;
            session.mark_operation_complete(build, &op)?;
        }

        let packages = &self.config.provision.packages;
        let op = marker(BuildStatus::AnsibleConfigured, "packages");
        if packages.is_empty() {
            debug!("no extra packages configured");
        } else if session.is_operation_complete(build, &op) {
            info!("packages already installed in {}", build);
        } else {
            self.provisioner
                .install_packages(&layout.container, &packages.join(","))?;
            session.mark_operation_complete(build, &op)?;
        }
        Ok(())
    }

    fn stage_finalize(&self, session: &mut RecoverySession, layout: &BuildLayout) -> Result<()> {
        install::remove_policy_rc_d(&*self.exec, &layout.mountpoint)?;
        self.ensure_container(session, layout)?;

        let code = self.containers.run_command(&layout.container, "apt-get clean")?;
        if code != 0 {
            return Err(Error::resource(
                ResourceKind::Container,
                format!("`apt-get clean` in {} exited with status {}", layout.container, code),
            ));
        }

        self.containers.stop(&layout.container, false)?;
        session.remove_cleanup(&stop_container_action(&layout.container), true)?;
        Ok(())
    }

    fn boot_container(&self, session: &mut RecoverySession, layout: &BuildLayout) -> Result<()> {
        let spec = ContainerSpec {
            name: layout.container.clone(),
            rootfs: layout.mountpoint.clone(),
            hostname: layout.hostname.clone(),
            capabilities: self.config.container.capabilities.clone(),
            network: self.config.container.network.clone(),
        };
        self.containers.start(&spec)?;
        self.register_stop(session, layout)?;
        self.containers
            .wait_until_ready(&layout.container, &self.wait_policy())
    }

    /// Later stages need the container; a resumed run may find it stopped.
    fn ensure_container(&self, session: &mut RecoverySession, layout: &BuildLayout) -> Result<()> {
        if self.containers.is_running(&layout.container)? {
            return self.register_stop(session, layout);
        }
        info!("container {} is not running, starting it", layout.container);
        self.boot_container(session, layout)
    }

    fn register_stop(&self, session: &mut RecoverySession, layout: &BuildLayout) -> Result<()> {
        let name = stop_container_action(&layout.container);
        if session.cleanup_names().contains(&name.as_str()) {
            return Ok(());
        }
        let containers = Arc::clone(&self.containers);
        let container = layout.container.clone();
        session.add_cleanup(Action::new(name, move || containers.stop(&container, true)))
    }
}

fn restore_aside(log_dir: &Path, aside: &Path) -> Result<()> {
    if !aside.is_dir() {
        return Ok(());
    }
    if log_dir.is_dir() {
        // Only an empty mountpoint directory may be replaced.
        fs::remove_dir(log_dir).io_context(|| format!("removing '{}'", log_dir.display()))?;
    }
    fs::rename(aside, log_dir).io_context(|| format!("restoring '{}'", log_dir.display()))
}
