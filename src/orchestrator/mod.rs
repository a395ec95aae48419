//! Drives one build through the stage pipeline.
//!
//! Each stage runs only when the progression rules allow it, records its
//! status when it succeeds, and is followed by a recursive `stage-<status>`
//! snapshot of the build's dataset tree. A failing stage records `failed`,
//! drains the cleanup stack and aborts; the next run resumes at
//! `datasets-created`, with completion markers skipping the expensive
//! operations that already finished.
//!
//! # Example
//!
//! ```rust,ignore
//! use zfs_rootfs_builder::{executor_for, BuildOptions, Config, Orchestrator};
//!
//! let config = Config::load(None)?;
//! let orchestrator = Orchestrator::new(config, executor_for(false));
//! let outcome = orchestrator.run("noble-base", &BuildOptions::default())?;
//! println!("{:?}", outcome.final_status);
//! ```

mod stages;
mod teardown;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::Config;
use crate::drivers::{ContainerDriver, DatasetDriver, Nspawn, Zfs};
use crate::error::{Error, Result};
use crate::preflight;
use crate::process::SharedExecutor;
use crate::progression::{should_run_stage, STAGES};
use crate::provision::{AnsibleProvisioner, Provisioner};
use crate::recovery::RecoverySession;
use crate::signals;
use crate::status::{BuildStatus, StatusStore};
use crate::validate::{validate_build_name, validate_hostname};
use crate::wait::PollPolicy;

pub use teardown::{BuildReport, TeardownReport};

/// Prefix of the per-stage snapshots.
pub const SNAPSHOT_PREFIX: &str = "stage-";

pub fn snapshot_name(status: BuildStatus) -> String {
    format!("{}{}", SNAPSHOT_PREFIX, status)
}

/// Names derived from a build name and the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildLayout {
    pub build: String,
    pub parent_dataset: String,
    pub root_dataset: String,
    pub varlog_dataset: String,
    pub mountpoint: PathBuf,
    pub container: String,
    pub hostname: String,
}

/// Container name for a build; machine names may not contain `_`.
pub fn container_name(build: &str) -> String {
    build.replace('_', "-")
}

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Defaults to the container name.
    pub hostname: Option<String>,
    /// Run every stage regardless of the recorded status.
    pub force_restart: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOutcome {
    pub final_status: Option<BuildStatus>,
    pub ran: Vec<BuildStatus>,
    pub skipped: Vec<BuildStatus>,
}

pub struct Orchestrator {
    config: Config,
    exec: SharedExecutor,
    store: StatusStore,
    datasets: Arc<dyn DatasetDriver>,
    containers: Arc<dyn ContainerDriver>,
    provisioner: Arc<dyn Provisioner>,
    interrupt: Option<&'static AtomicBool>,
    host_checks: bool,
}

impl Orchestrator {
    /// An orchestrator using ZFS, systemd-nspawn and Ansible.
    pub fn new(config: Config, exec: SharedExecutor) -> Self {
        // Registration and shutdown waits give up on SIGINT/SIGTERM.
        let policy = config.container.poll_policy().interruptible(signals::flag());
        let containers: Arc<dyn ContainerDriver> = Arc::new(Nspawn::new(exec.clone(), policy));
        Self {
            store: StatusStore::new(&config.state.dir, exec.clone()),
            datasets: Arc::new(Zfs::new(exec.clone())),
            provisioner: Arc::new(AnsibleProvisioner::new(exec.clone(), containers.clone())),
            containers,
            config,
            exec,
            interrupt: None,
            host_checks: true,
        }
    }

    pub fn with_drivers(
        mut self,
        datasets: Arc<dyn DatasetDriver>,
        containers: Arc<dyn ContainerDriver>,
        provisioner: Arc<dyn Provisioner>,
    ) -> Self {
        self.datasets = datasets;
        self.containers = containers;
        self.provisioner = provisioner;
        self
    }

    /// Abort between stages, and during the boot wait, once `flag` is set.
    pub fn with_interrupt_flag(mut self, flag: &'static AtomicBool) -> Self {
        self.interrupt = Some(flag);
        self
    }

    /// Skip the host tool and privilege checks; the pool check still runs.
    pub fn without_host_checks(mut self) -> Self {
        self.host_checks = false;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &StatusStore {
        &self.store
    }

    pub fn is_dry_run(&self) -> bool {
        self.exec.is_simulated()
    }

    pub fn session(&self) -> RecoverySession {
        RecoverySession::new(&self.config.state.dir, self.exec.clone())
    }

    pub fn layout(&self, build: &str, hostname: Option<&str>) -> Result<BuildLayout> {
        validate_build_name(build)?;
        let parent_dataset = self.config.parent_dataset()?;
        let root_dataset = format!("{}/{}", parent_dataset, build);
        let container = container_name(build);
        let hostname = hostname.map(str::to_string).unwrap_or_else(|| container.clone());
        validate_hostname(&hostname)?;

        Ok(BuildLayout {
            build: build.to_string(),
            varlog_dataset: format!("{}/varlog", root_dataset),
            parent_dataset,
            root_dataset,
            mountpoint: self.config.zfs.mount_base.join(build),
            container,
            hostname,
        })
    }

    /// Run every stage the build still needs.
    pub fn run(&self, build: &str, options: &BuildOptions) -> Result<BuildOutcome> {
        let layout = self.layout(build, options.hostname.as_deref())?;
        self.config.validate()?;
        if self.host_checks {
            preflight::check_host(&self.config, self.exec.is_simulated())?;
        }
        preflight::check_pool(&*self.datasets, self.config.pool()?)?;

        let mut session = self.session();
        if options.force_restart {
            info!("forced restart of {}: clearing completion markers", build);
            session.clear_markers(build)?;
        }

        // Tracked locally so a dry run, which records nothing, still walks
        // the whole pipeline.
        let mut current = self.store.get_status(build)?;
        let mut outcome = BuildOutcome::default();

        for stage in STAGES {
            let decision = should_run_stage(stage, current, options.force_restart);
            if !decision.should_run() {
                info!("skipping {}: {}", stage, decision);
                outcome.skipped.push(stage);
                continue;
            }

            if self.interrupted() {
                if current.is_none() {
                    // Nothing was built; a fresh build leaves no history.
                    info!("build {} interrupted before it started", build);
                    return Err(Error::Interrupted);
                }
                return Err(self.fail(&mut session, build, stage, Error::Interrupted));
            }

            info!("stage {} starting", stage);
            let result = self
                .run_stage(&mut session, &layout, stage)
                .and_then(|()| self.store.set_status(build, stage, ""))
                .and_then(|()| self.snapshot_stage(&layout, stage));
            if let Err(err) = result {
                return Err(self.fail(&mut session, build, stage, err));
            }
            info!("stage {} done", stage);
            current = Some(stage);
            outcome.ran.push(stage);
        }

        session.clear_cleanup();
        outcome.final_status = current;
        Ok(outcome)
    }

    /// Readiness waits inherit the interrupt flag.
    fn wait_policy(&self) -> PollPolicy {
        let policy = self.config.container.poll_policy();
        match self.interrupt {
            Some(flag) => policy.interruptible(flag),
            None => policy,
        }
    }

    fn interrupted(&self) -> bool {
        self.interrupt
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    fn fail(
        &self,
        session: &mut RecoverySession,
        build: &str,
        stage: BuildStatus,
        err: Error,
    ) -> Error {
        error!("stage {} failed: {}", stage, err);
        if let Err(status_err) =
            self.store
                .set_status(build, BuildStatus::Failed, &format!("{}: {}", stage, err))
        {
            warn!("could not record failure of {}: {}", build, status_err);
        }
        let report = session.run_cleanup_stack();
        for (action, cleanup_err) in &report.failures {
            warn!("cleanup '{}' left work behind: {}", action, cleanup_err);
        }
        err
    }

    /// Replace `<root>@stage-<status>` with a fresh recursive snapshot.
    fn snapshot_stage(&self, layout: &BuildLayout, stage: BuildStatus) -> Result<()> {
        if !self.config.zfs.snapshots || !self.datasets.exists(&layout.root_dataset)? {
            return Ok(());
        }
        let name = snapshot_name(stage);
        let full = format!("{}@{}", layout.root_dataset, name);
        if self.datasets.exists(&full)? {
            self.datasets.destroy(&full, true, false)?;
        }
        self.datasets.snapshot(&layout.root_dataset, &name)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::drivers::fake::{FakeContainers, FakeDatasets, RecordingExecutor, RecordingProvisioner};
    use crate::process::SimulatedExecutor;
    use std::fs;
    use tempfile::TempDir;

    pub(crate) struct Harness {
        pub temp: TempDir,
        pub exec: Arc<RecordingExecutor>,
        pub datasets: Arc<FakeDatasets>,
        pub containers: Arc<FakeContainers>,
        pub provisioner: Arc<RecordingProvisioner>,
    }

    impl Harness {
        pub fn new() -> Self {
            Self {
                temp: TempDir::new().unwrap(),
                exec: Arc::new(RecordingExecutor::default()),
                datasets: Arc::new(FakeDatasets::default()),
                containers: Arc::new(FakeContainers::default()),
                provisioner: Arc::new(RecordingProvisioner::default()),
            }
        }

        pub fn config(&self) -> Config {
            let mut config = Config::default();
            config.zfs.pool = Some("tank".to_string());
            config.zfs.mount_base = self.temp.path().join("mnt");
            config.state.dir = self.temp.path().join("state");
            config.provision.packages = vec!["vim".to_string()];
            config
        }

        pub fn orchestrator(&self) -> Orchestrator {
            self.orchestrator_with(self.config(), self.exec.clone())
        }

        pub fn orchestrator_with(&self, config: Config, exec: SharedExecutor) -> Orchestrator {
            Orchestrator::new(config, exec)
                .with_drivers(
                    self.datasets.clone(),
                    self.containers.clone(),
                    self.provisioner.clone(),
                )
                .without_host_checks()
        }

        pub fn debootstrap_runs(&self) -> usize {
            self.exec
                .commands()
                .iter()
                .filter(|c| c.starts_with("debootstrap"))
                .count()
        }
    }

    const ROOT: &str = "tank/rootfs-builds/demo";

    #[test]
    fn test_full_build() {
        let h = Harness::new();
        let orch = h.orchestrator();
        let outcome = orch.run("demo", &BuildOptions::default()).unwrap();

        assert_eq!(outcome.ran, STAGES.to_vec());
        assert!(outcome.skipped.is_empty());
        assert_eq!(outcome.final_status, Some(BuildStatus::Completed));
        assert_eq!(orch.store().entries("demo").unwrap().len(), STAGES.len());

        assert!(h.datasets.has(ROOT));
        assert!(h.datasets.has(&format!("{}/varlog", ROOT)));
        let snapshots = h.datasets.list_snapshots(ROOT, "stage-*").unwrap();
        assert!(snapshots.contains(&format!("{}@stage-completed", ROOT)));
        assert!(snapshots.contains(&format!("{}/varlog@stage-completed", ROOT)));
        assert!(!snapshots.iter().any(|s| s.ends_with("@stage-started")));

        assert_eq!(h.debootstrap_runs(), 1);
        assert_eq!(h.provisioner.configure_calls(), 1);
        assert_eq!(
            *h.provisioner.installed.lock().unwrap(),
            vec![("demo".to_string(), "vim".to_string())]
        );
        assert!(h.containers.commands().contains(&"apt-get clean".to_string()));
        assert!(!h.containers.is_running("demo").unwrap());

        let rootfs = h.temp.path().join("mnt/demo");
        assert_eq!(fs::read_to_string(rootfs.join("etc/hostname")).unwrap(), "demo\n");
        assert!(!rootfs.join(crate::install::POLICY_RC_D).exists());
    }

    #[test]
    fn test_completed_build_is_left_alone() {
        let h = Harness::new();
        let orch = h.orchestrator();
        orch.run("demo", &BuildOptions::default()).unwrap();
        let ops_before = h.datasets.ops().len();

        let outcome = orch.run("demo", &BuildOptions::default()).unwrap();
        assert!(outcome.ran.is_empty());
        assert_eq!(outcome.skipped, STAGES.to_vec());
        assert_eq!(outcome.final_status, Some(BuildStatus::Completed));
        // Only the pool health check touched the driver.
        assert_eq!(h.datasets.ops().len(), ops_before + 1);
    }

    #[test]
    fn test_failure_records_failed_runs_cleanup_and_resumes() {
        let h = Harness::new();
        let orch = h.orchestrator();
        h.provisioner.fail_configure(true);

        let err = orch.run("demo", &BuildOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Resource { .. }));
        let last = orch.store().last_entry("demo").unwrap().unwrap();
        assert_eq!(last.status, BuildStatus::Failed);
        assert!(last.message.starts_with("ansible-configured: "));
        // The cleanup stack stopped the container started by this run.
        assert!(!h.containers.is_running("demo").unwrap());
        assert!(h.containers.ops().contains(&"stop demo".to_string()));

        h.provisioner.fail_configure(false);
        let outcome = orch.run("demo", &BuildOptions::default()).unwrap();
        assert_eq!(outcome.ran[0], BuildStatus::DatasetsCreated);
        assert_eq!(outcome.skipped, vec![BuildStatus::Started]);
        assert_eq!(outcome.final_status, Some(BuildStatus::Completed));
        // Markers kept the install from running twice.
        assert_eq!(h.debootstrap_runs(), 1);
        assert_eq!(h.provisioner.configure_calls(), 2);
    }

    #[test]
    fn test_dataset_failure_rolls_back_root() {
        let h = Harness::new();
        let orch = h.orchestrator();
        h.datasets.fail_on(&format!("create {}/varlog", ROOT));

        orch.run("demo", &BuildOptions::default()).unwrap_err();
        assert!(h.datasets.has("tank/rootfs-builds"));
        assert!(!h.datasets.has(ROOT));
        assert_eq!(
            orch.store().get_status("demo").unwrap(),
            Some(BuildStatus::Failed)
        );
    }

    #[test]
    fn test_interrupt_before_first_stage_records_nothing() {
        static FLAG: AtomicBool = AtomicBool::new(true);
        let h = Harness::new();
        let orch = h.orchestrator().with_interrupt_flag(&FLAG);

        let err = orch.run("demo", &BuildOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Interrupted));
        assert_eq!(orch.store().get_status("demo").unwrap(), None);
        assert!(!orch.store().status_path("demo").exists());
        assert!(!h.datasets.has(ROOT));
    }

    #[test]
    fn test_interrupt_fails_started_build() {
        static FLAG: AtomicBool = AtomicBool::new(false);
        let h = Harness::new();
        let orch = h.orchestrator().with_interrupt_flag(&FLAG);
        h.provisioner.fail_configure(true);
        orch.run("demo", &BuildOptions::default()).unwrap_err();
        h.provisioner.fail_configure(false);

        FLAG.store(true, Ordering::SeqCst);
        let err = orch.run("demo", &BuildOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Interrupted));
        let last = orch.store().last_entry("demo").unwrap().unwrap();
        assert_eq!(last.status, BuildStatus::Failed);
        assert_eq!(last.message, "datasets-created: interrupted by signal");
    }

    #[test]
    fn test_snapshot_failure_records_failed_and_resumes() {
        let h = Harness::new();
        let orch = h.orchestrator();
        h.datasets
            .fail_on(&format!("snapshot {}@stage-os-installed", ROOT));

        orch.run("demo", &BuildOptions::default()).unwrap_err();
        let statuses: Vec<BuildStatus> = orch
            .store()
            .entries("demo")
            .unwrap()
            .into_iter()
            .map(|entry| entry.status)
            .collect();
        assert_eq!(
            statuses[statuses.len() - 2..],
            [BuildStatus::OsInstalled, BuildStatus::Failed]
        );

        h.datasets.clear_failures();
        let outcome = orch.run("demo", &BuildOptions::default()).unwrap();
        assert_eq!(outcome.ran[0], BuildStatus::DatasetsCreated);
        assert_eq!(outcome.final_status, Some(BuildStatus::Completed));
        assert_eq!(h.debootstrap_runs(), 1);
        let snapshots = h.datasets.list_snapshots(ROOT, "stage-os-installed").unwrap();
        assert!(snapshots.contains(&format!("{}@stage-os-installed", ROOT)));
    }

    #[test]
    fn test_force_restart_clears_markers_and_reruns() {
        let h = Harness::new();
        let orch = h.orchestrator();
        orch.run("demo", &BuildOptions::default()).unwrap();

        let outcome = orch
            .run(
                "demo",
                &BuildOptions {
                    force_restart: true,
                    ..BuildOptions::default()
                },
            )
            .unwrap();
        assert_eq!(outcome.ran, STAGES.to_vec());
        assert_eq!(h.debootstrap_runs(), 2);
    }

    #[test]
    fn test_prechecks_write_no_status() {
        let h = Harness::new();
        let orch = h.orchestrator();
        assert!(matches!(
            orch.run("bad/name", &BuildOptions::default()).unwrap_err(),
            Error::Validation { .. }
        ));
        assert!(matches!(
            orch.run(
                "demo",
                &BuildOptions {
                    hostname: Some("bad_host".into()),
                    ..BuildOptions::default()
                }
            )
            .unwrap_err(),
            Error::Validation { .. }
        ));

        h.datasets.set_health("DEGRADED");
        assert!(matches!(
            orch.run("demo", &BuildOptions::default()).unwrap_err(),
            Error::Config(_)
        ));

        let mut config = h.config();
        config.zfs.pool = None;
        let no_pool = h.orchestrator_with(config, h.exec.clone());
        assert!(matches!(
            no_pool.run("demo", &BuildOptions::default()).unwrap_err(),
            Error::Config(_)
        ));

        assert_eq!(orch.store().get_status("demo").unwrap(), None);
    }

    #[test]
    fn test_dry_run_walks_pipeline_without_writing() {
        let h = Harness::new();
        let exec = Arc::new(SimulatedExecutor::new());
        let orch = h.orchestrator_with(h.config(), exec.clone());

        let outcome = orch.run("demo", &BuildOptions::default()).unwrap();
        assert_eq!(outcome.ran, STAGES.to_vec());
        assert_eq!(orch.store().get_status("demo").unwrap(), None);
        assert!(!h.temp.path().join("state").exists());
        assert!(!h.temp.path().join("mnt").exists());
        assert!(exec
            .intents()
            .iter()
            .any(|intent| intent.starts_with("run: debootstrap")));
    }

    #[test]
    fn test_layout() {
        let h = Harness::new();
        let layout = h.orchestrator().layout("noble_base", None).unwrap();
        assert_eq!(layout.root_dataset, "tank/rootfs-builds/noble_base");
        assert_eq!(layout.varlog_dataset, "tank/rootfs-builds/noble_base/varlog");
        assert_eq!(layout.container, "noble-base");
        assert_eq!(layout.hostname, "noble-base");
        assert_eq!(layout.mountpoint, h.temp.path().join("mnt/noble_base"));
    }
}
