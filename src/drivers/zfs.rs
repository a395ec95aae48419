use std::path::Path;

use tracing::{debug, info};

use super::{ensure_no_at, CreateOptions, DatasetDriver};
use crate::error::{Error, ResourceKind, Result};
use crate::process::{Cmd, CmdOutput, SharedExecutor};

/// [`DatasetDriver`] backed by the `zfs` and `zpool` commands.
#[derive(Clone)]
pub struct Zfs {
    exec: SharedExecutor,
}

impl Zfs {
    pub fn new(exec: SharedExecutor) -> Self {
        Self { exec }
    }

    fn zfs(&self) -> Cmd {
        Cmd::new("zfs").kind(ResourceKind::Dataset)
    }

    fn run(&self, cmd: Cmd) -> Result<CmdOutput> {
        self.exec.run(&cmd)
    }

    fn is_mounted(&self, dataset: &str) -> Result<bool> {
        Ok(self.get_property(dataset, "mounted")?.as_deref() == Some("yes"))
    }
}

fn missing_dataset(out: &CmdOutput) -> bool {
    out.stderr.contains("does not exist")
}

fn query_failed(what: &str, out: &CmdOutput) -> Error {
    Error::resource(
        ResourceKind::Dataset,
        format!("{} failed: {}", what, out.stderr.trim()),
    )
}

impl DatasetDriver for Zfs {
    fn exists(&self, dataset: &str) -> Result<bool> {
        let out = self.run(
            self.zfs()
                .args(["list", "-H", "-t", "all", "-o", "name"])
                .arg(dataset)
                .read_only()
                .allow_fail(),
        )?;
        if out.success() {
            return Ok(true);
        }
        if missing_dataset(&out) {
            return Ok(false);
        }
        Err(query_failed("zfs list", &out))
    }

    fn create(&self, dataset: &str, options: &CreateOptions) -> Result<()> {
        ensure_no_at("dataset", dataset)?;
        if self.exists(dataset)? {
            debug!("dataset {} already exists", dataset);
            return Ok(());
        }

        info!("creating dataset {}", dataset);
        let mut cmd = self.zfs().arg("create");
        if options.parents {
            cmd = cmd.arg("-p");
        }
        for (key, value) in &options.properties {
            cmd = cmd.arg("-o").arg(format!("{}={}", key, value));
        }
        if let Some(mountpoint) = &options.mountpoint {
            cmd = cmd
                .arg("-o")
                .arg(format!("mountpoint={}", mountpoint.display()));
        }
        self.run(cmd.arg(dataset))?;
        Ok(())
    }

    fn destroy(&self, dataset: &str, recursive: bool, force: bool) -> Result<()> {
        if !self.exists(dataset)? {
            debug!("dataset {} already gone", dataset);
            return Ok(());
        }

        info!("destroying {}", dataset);
        let mut cmd = self.zfs().arg("destroy");
        if recursive {
            cmd = cmd.arg("-r");
        }
        if force {
            cmd = cmd.arg("-f");
        }
        self.run(cmd.arg(dataset))?;
        Ok(())
    }

    fn get_property(&self, dataset: &str, property: &str) -> Result<Option<String>> {
        let out = self.run(
            self.zfs()
                .args(["get", "-H", "-o", "value"])
                .arg(property)
                .arg(dataset)
                .read_only()
                .allow_fail(),
        )?;
        if !out.success() {
            if missing_dataset(&out) {
                return Ok(None);
            }
            return Err(query_failed("zfs get", &out));
        }
        let value = out.stdout.trim();
        if value.is_empty() || value == "-" {
            return Ok(None);
        }
        Ok(Some(value.to_string()))
    }

    fn mount(&self, dataset: &str, target: &Path) -> Result<()> {
        ensure_no_at("dataset", dataset)?;
        info!("mounting {} at {}", dataset, target.display());
        self.run(
            self.zfs()
                .kind(ResourceKind::Mount)
                .arg("set")
                .arg(format!("mountpoint={}", target.display()))
                .arg(dataset),
        )?;
        if !self.is_mounted(dataset)? {
            self.run(self.zfs().kind(ResourceKind::Mount).arg("mount").arg(dataset))?;
        }
        Ok(())
    }

    fn unmount(&self, dataset: &str, force: bool) -> Result<()> {
        ensure_no_at("dataset", dataset)?;
        if !self.is_mounted(dataset)? {
            debug!("{} is not mounted", dataset);
            return Ok(());
        }
        info!("unmounting {}", dataset);
        let mut cmd = self.zfs().kind(ResourceKind::Mount).arg("unmount");
        if force {
            cmd = cmd.arg("-f");
        }
        self.run(cmd.arg(dataset))?;
        Ok(())
    }

    fn snapshot(&self, dataset: &str, name: &str) -> Result<()> {
        ensure_no_at("dataset", dataset)?;
        ensure_no_at("snapshot name", name)?;
        let full = format!("{}@{}", dataset, name);
        info!("creating snapshot {}", full);
        self.run(self.zfs().args(["snapshot", "-r"]).arg(&full))?;
        Ok(())
    }

    fn list_snapshots(&self, dataset: &str, pattern: &str) -> Result<Vec<String>> {
        ensure_no_at("dataset", dataset)?;
        let matcher = glob::Pattern::new(pattern).map_err(|err| {
            Error::validation("snapshot pattern", pattern, err.to_string())
        })?;
        let out = self.run(
            self.zfs()
                .args(["list", "-H", "-t", "snapshot", "-o", "name", "-r"])
                .arg(dataset)
                .read_only()
                .allow_fail(),
        )?;
        if !out.success() {
            if missing_dataset(&out) {
                return Ok(Vec::new());
            }
            return Err(query_failed("zfs list", &out));
        }

        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| {
                line.split_once('@')
                    .is_some_and(|(_, snap)| matcher.matches(snap))
            })
            .map(str::to_string)
            .collect())
    }

    fn rollback(&self, snapshot: &str, force: bool) -> Result<()> {
        if !snapshot.contains('@') {
            return Err(Error::validation(
                "snapshot",
                snapshot,
                "expected <dataset>@<snapshot>",
            ));
        }
        info!("rolling back to {}", snapshot);
        let mut cmd = self.zfs().args(["rollback", "-r"]);
        if force {
            cmd = cmd.arg("-f");
        }
        self.run(cmd.arg(snapshot))?;
        Ok(())
    }

    fn pool_health(&self, pool: &str) -> Result<String> {
        ensure_no_at("pool", pool)?;
        let out = self.exec.run(
            &Cmd::new("zpool")
                .kind(ResourceKind::Dataset)
                .args(["list", "-H", "-o", "health"])
                .arg(pool)
                .read_only()
                .allow_fail(),
        )?;
        if !out.success() {
            return Err(Error::config(format!(
                "pool '{}' is not available: {}",
                pool,
                out.stderr.trim()
            )));
        }
        Ok(out.stdout.trim().to_string())
    }
}
