use std::fmt;
use std::fs;

use serde::Serialize;
use tracing::{info, warn};

use super::{container_name, snapshot_name, Orchestrator, SNAPSHOT_PREFIX};
use crate::drivers::ContainerStatus;
use crate::error::{Error, IoContext, ResourceKind, Result};
use crate::progression::STAGES;
use crate::status::{BuildStatus, StatusEntry};
use crate::validate::validate_build_name;

/// What a teardown managed to release.
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub build: String,
    pub completed: Vec<&'static str>,
    pub failures: Vec<(&'static str, Error)>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, step: &'static str, result: Result<()>) {
        match result {
            Ok(()) => self.completed.push(step),
            Err(err) => {
                warn!("teardown of {}: {} failed: {}", self.build, step, err);
                self.failures.push((step, err));
            }
        }
    }
}

impl fmt::Display for TeardownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clean() {
            return write!(f, "{}: all artifacts removed", self.build);
        }
        write!(f, "{}: {} step(s) failed:", self.build, self.failures.len())?;
        for (step, err) in &self.failures {
            write!(f, "\n  {}: {}", step, err)?;
        }
        Ok(())
    }
}

/// Everything known about one build, for `status`.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub build: String,
    pub last: Option<StatusEntry>,
    pub root_dataset: Option<String>,
    pub dataset_exists: bool,
    pub snapshots: Vec<String>,
    pub container: ContainerStatus,
}

impl fmt::Display for BuildReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Build:      {}", self.build)?;
        match &self.last {
            Some(last) => {
                writeln!(f, "Status:     {}", last.status)?;
                writeln!(f, "Updated:    {}", last.timestamp)?;
                if !last.message.is_empty() {
                    writeln!(f, "Message:    {}", last.message)?;
                }
            }
            None => writeln!(f, "Status:     (none)")?,
        }
        if let Some(root) = &self.root_dataset {
            let state = if self.dataset_exists { "present" } else { "absent" };
            writeln!(f, "Dataset:    {} ({})", root, state)?;
        }
        for snapshot in &self.snapshots {
            writeln!(f, "Snapshot:   {}", snapshot)?;
        }
        writeln!(f, "Container:  {}", self.container)
    }
}

impl Orchestrator {
    /// Release everything a build owns: container, dataset tree, mount
    /// directory, status files and markers. Every step is attempted; the
    /// report lists the ones that failed. Running it again is harmless.
    pub fn clean_artifacts(&self, build: &str) -> Result<TeardownReport> {
        validate_build_name(build)?;
        info!("tearing down {}", build);
        let mut report = TeardownReport {
            build: build.to_string(),
            ..TeardownReport::default()
        };

        report.record("container", self.containers.destroy(&container_name(build)));

        report.record(
            "datasets",
            self.config.parent_dataset().and_then(|parent| {
                self.datasets
                    .destroy(&format!("{}/{}", parent, build), true, true)
            }),
        );

        let mountpoint = self.config.zfs.mount_base.join(build);
        report.record(
            "mount directory",
            self.exec
                .apply(&format!("remove {}", mountpoint.display()), &mut || {
                    if !mountpoint.is_dir() {
                        return Ok(());
                    }
                    let empty = fs::read_dir(&mountpoint)
                        .io_context(|| format!("reading '{}'", mountpoint.display()))?
                        .next()
                        .is_none();
                    if !empty {
                        warn!("{} is not empty, leaving it in place", mountpoint.display());
                        return Ok(());
                    }
                    fs::remove_dir(&mountpoint)
                        .io_context(|| format!("removing '{}'", mountpoint.display()))
                }),
        );

        report.record("status", self.store.clear_status(build, true));
        report.record("markers", self.session().clear_markers(build));

        Ok(report)
    }

    /// Roll the dataset tree back to the snapshot taken after `status` and
    /// make `status` the build's current status again. The container is
    /// stopped first. Returns the snapshots rolled back.
    pub fn rollback_to_stage(&self, build: &str, status: BuildStatus) -> Result<Vec<String>> {
        let layout = self.layout(build, None)?;
        if !STAGES.contains(&status) {
            return Err(Error::validation(
                "stage",
                status.as_str(),
                "only pipeline stages have snapshots",
            ));
        }
        if !self.datasets.exists(&layout.root_dataset)? {
            return Err(Error::resource(
                ResourceKind::Dataset,
                format!("{} does not exist", layout.root_dataset),
            ));
        }

        let name = snapshot_name(status);
        let snapshots = self.datasets.list_snapshots(&layout.root_dataset, &name)?;
        if snapshots.is_empty() {
            return Err(Error::resource(
                ResourceKind::Dataset,
                format!("no snapshot @{} under {}", name, layout.root_dataset),
            ));
        }

        self.containers.stop(&layout.container, true)?;
        for snapshot in &snapshots {
            self.datasets.rollback(snapshot, true)?;
        }

        let mut session = self.session();
        let cleared = session.markers_mut().clear_where(build, |op| {
            op.split_once('.')
                .and_then(|(stage, _)| stage.parse::<BuildStatus>().ok())
                .is_some_and(|stage| stage > status)
        })?;
        if cleared > 0 {
            info!("cleared {} marker(s) of later stages", cleared);
        }

        self.store
            .set_status(build, status, &format!("rolled back to snapshot {}", name))?;
        Ok(snapshots)
    }

    pub fn inspect(&self, build: &str) -> Result<BuildReport> {
        validate_build_name(build)?;
        let last = self.store.last_entry(build)?;
        let root_dataset = self
            .config
            .parent_dataset()
            .ok()
            .map(|parent| format!("{}/{}", parent, build));

        let dataset_exists = match &root_dataset {
            Some(root) => self.datasets.exists(root)?,
            None => false,
        };
        let snapshots = match &root_dataset {
            Some(root) if dataset_exists => self
                .datasets
                .list_snapshots(root, &format!("{}*", SNAPSHOT_PREFIX))?
                .into_iter()
                .filter(|s| s.starts_with(&format!("{}@", root)))
                .collect(),
            _ => Vec::new(),
        };

        Ok(BuildReport {
            build: build.to_string(),
            last,
            root_dataset,
            dataset_exists,
            snapshots,
            container: self.containers.status(&container_name(build))?,
        })
    }
}
