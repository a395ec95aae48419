//! In-memory drivers for orchestrator tests.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Mutex;

use super::{ContainerDriver, ContainerSpec, ContainerStatus, CreateOptions, DatasetDriver};
use crate::error::{Error, ResourceKind, Result};
use crate::process::{Cmd, CmdOutput, Executor};
use crate::provision::{ProvisionTarget, Provisioner};
use crate::wait::PollPolicy;

fn fail_if(rules: &Mutex<Vec<String>>, kind: ResourceKind, op: &str) -> Result<()> {
    if rules.lock().unwrap().iter().any(|rule| op.starts_with(rule.as_str())) {
        return Err(Error::resource(kind, format!("injected failure: {}", op)));
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct FakeDatasets {
    pub datasets: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
    pub snapshots: Mutex<BTreeSet<String>>,
    pub ops: Mutex<Vec<String>>,
    failures: Mutex<Vec<String>>,
    health: Mutex<Option<String>>,
}

impl FakeDatasets {
    /// Fail every operation whose log line starts with `prefix`,
    /// e.g. `"create tank/rootfs-builds/demo/varlog"`.
    pub fn fail_on(&self, prefix: &str) {
        self.failures.lock().unwrap().push(prefix.to_string());
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }

    pub fn set_health(&self, health: &str) {
        *self.health.lock().unwrap() = Some(health.to_string());
    }

    pub fn has(&self, dataset: &str) -> bool {
        self.datasets.lock().unwrap().contains_key(dataset)
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    fn record(&self, op: String) -> Result<()> {
        self.ops.lock().unwrap().push(op.clone());
        fail_if(&self.failures, ResourceKind::Dataset, &op)
    }

    fn in_tree(root: &str, name: &str) -> bool {
        name == root || name.starts_with(&format!("{}/", root))
    }
}

impl DatasetDriver for FakeDatasets {
    fn exists(&self, dataset: &str) -> Result<bool> {
        if dataset.contains('@') {
            return Ok(self.snapshots.lock().unwrap().contains(dataset));
        }
        Ok(self.has(dataset))
    }

    fn create(&self, dataset: &str, options: &CreateOptions) -> Result<()> {
        if self.has(dataset) {
            return Ok(());
        }
        self.record(format!("create {}", dataset))?;
        let mut props: BTreeMap<String, String> = options.properties.iter().cloned().collect();
        if let Some(mountpoint) = &options.mountpoint {
            props.insert("mountpoint".into(), mountpoint.display().to_string());
            props.insert("mounted".into(), "yes".into());
        }
        self.datasets.lock().unwrap().insert(dataset.to_string(), props);
        Ok(())
    }

    fn destroy(&self, dataset: &str, recursive: bool, _force: bool) -> Result<()> {
        if !self.exists(dataset)? {
            return Ok(());
        }
        self.record(format!("destroy {}", dataset))?;
        if let Some((base, snap)) = dataset.split_once('@') {
            self.snapshots.lock().unwrap().retain(|s| {
                let matches = s.split_once('@').is_some_and(|(d, n)| {
                    n == snap && (d == base || (recursive && Self::in_tree(base, d)))
                });
                !matches
            });
            return Ok(());
        }
        self.datasets
            .lock()
            .unwrap()
            .retain(|name, _| !Self::in_tree(dataset, name));
        self.snapshots.lock().unwrap().retain(|s| {
            s.split_once('@')
                .map_or(true, |(d, _)| !Self::in_tree(dataset, d))
        });
        Ok(())
    }

    fn get_property(&self, dataset: &str, property: &str) -> Result<Option<String>> {
        Ok(self
            .datasets
            .lock()
            .unwrap()
            .get(dataset)
            .and_then(|props| props.get(property).cloned()))
    }

    fn mount(&self, dataset: &str, target: &Path) -> Result<()> {
        self.record(format!("mount {} {}", dataset, target.display()))?;
        if let Some(props) = self.datasets.lock().unwrap().get_mut(dataset) {
            props.insert("mountpoint".into(), target.display().to_string());
            props.insert("mounted".into(), "yes".into());
        }
        Ok(())
    }

    fn unmount(&self, dataset: &str, _force: bool) -> Result<()> {
        if self.get_property(dataset, "mounted")?.as_deref() != Some("yes") {
            return Ok(());
        }
        self.record(format!("unmount {}", dataset))?;
        if let Some(props) = self.datasets.lock().unwrap().get_mut(dataset) {
            props.insert("mounted".into(), "no".into());
        }
        Ok(())
    }

    fn snapshot(&self, dataset: &str, name: &str) -> Result<()> {
        let full = format!("{}@{}", dataset, name);
        if self.snapshots.lock().unwrap().contains(&full) {
            return Err(Error::resource(
                ResourceKind::Dataset,
                format!("snapshot {} already exists", full),
            ));
        }
        self.record(format!("snapshot {}", full))?;
        let tree: Vec<String> = self
            .datasets
            .lock()
            .unwrap()
            .keys()
            .filter(|d| Self::in_tree(dataset, d))
            .cloned()
            .collect();
        let mut snapshots = self.snapshots.lock().unwrap();
        for d in tree {
            snapshots.insert(format!("{}@{}", d, name));
        }
        Ok(())
    }

    fn list_snapshots(&self, dataset: &str, pattern: &str) -> Result<Vec<String>> {
        let matcher = glob::Pattern::new(pattern)
            .map_err(|err| Error::validation("snapshot pattern", pattern, err.to_string()))?;
        Ok(self
            .snapshots
            .lock()
            .unwrap()
            .iter()
            .filter(|s| {
                s.split_once('@')
                    .is_some_and(|(d, n)| Self::in_tree(dataset, d) && matcher.matches(n))
            })
            .cloned()
            .collect())
    }

    fn rollback(&self, snapshot: &str, _force: bool) -> Result<()> {
        self.record(format!("rollback {}", snapshot))
    }

    fn pool_health(&self, pool: &str) -> Result<String> {
        self.record(format!("health {}", pool))?;
        Ok(self
            .health
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| "ONLINE".to_string()))
    }
}

#[derive(Debug, Default)]
pub struct FakeContainers {
    pub running: Mutex<BTreeSet<String>>,
    pub ops: Mutex<Vec<String>>,
    pub commands: Mutex<Vec<String>>,
    pub started: Mutex<Vec<ContainerSpec>>,
    failures: Mutex<Vec<String>>,
}

impl FakeContainers {
    pub fn fail_on(&self, prefix: &str) {
        self.failures.lock().unwrap().push(prefix.to_string());
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    fn record(&self, op: String) -> Result<()> {
        self.ops.lock().unwrap().push(op.clone());
        fail_if(&self.failures, ResourceKind::Container, &op)
    }
}

impl ContainerDriver for FakeContainers {
    fn is_running(&self, name: &str) -> Result<bool> {
        Ok(self.running.lock().unwrap().contains(name))
    }

    fn start(&self, spec: &ContainerSpec) -> Result<()> {
        if self.is_running(&spec.name)? {
            return Ok(());
        }
        self.record(format!("start {}", spec.name))?;
        self.started.lock().unwrap().push(spec.clone());
        self.running.lock().unwrap().insert(spec.name.clone());
        Ok(())
    }

    fn stop(&self, name: &str, _force: bool) -> Result<()> {
        if !self.is_running(name)? {
            return Ok(());
        }
        self.record(format!("stop {}", name))?;
        self.running.lock().unwrap().remove(name);
        Ok(())
    }

    fn destroy(&self, name: &str) -> Result<()> {
        self.record(format!("destroy {}", name))?;
        self.running.lock().unwrap().remove(name);
        Ok(())
    }

    fn run_command(&self, name: &str, command: &str) -> Result<i32> {
        let op = format!("exec {} {}", name, command);
        self.commands.lock().unwrap().push(command.to_string());
        if self
            .failures
            .lock()
            .unwrap()
            .iter()
            .any(|rule| op.starts_with(rule.as_str()))
        {
            return Ok(100);
        }
        Ok(0)
    }

    fn status(&self, name: &str) -> Result<ContainerStatus> {
        let mut status = ContainerStatus::absent(name);
        if self.is_running(name)? {
            status.state = "running".to_string();
        }
        Ok(status)
    }

    fn wait_until_ready(&self, name: &str, _policy: &PollPolicy) -> Result<()> {
        self.record(format!("ready {}", name))
    }
}

#[derive(Debug, Default)]
pub struct RecordingProvisioner {
    pub configured: Mutex<Vec<ProvisionTarget>>,
    pub installed: Mutex<Vec<(String, String)>>,
    fail_configure: Mutex<bool>,
}

impl RecordingProvisioner {
    pub fn fail_configure(&self, fail: bool) {
        *self.fail_configure.lock().unwrap() = fail;
    }

    pub fn configure_calls(&self) -> usize {
        self.configured.lock().unwrap().len()
    }
}

impl Provisioner for RecordingProvisioner {
    fn configure(&self, target: &ProvisionTarget) -> Result<()> {
        self.configured.lock().unwrap().push(target.clone());
        if *self.fail_configure.lock().unwrap() {
            return Err(Error::resource(
                ResourceKind::Provision,
                "playbook failed: 1 task failed",
            ));
        }
        Ok(())
    }

    fn install_packages(&self, container: &str, packages: &str) -> Result<()> {
        self.installed
            .lock()
            .unwrap()
            .push((container.to_string(), packages.to_string()));
        Ok(())
    }
}

/// Applies filesystem mutations for real but only records commands.
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    commands: Mutex<Vec<String>>,
    failures: Mutex<Vec<String>>,
}

impl RecordingExecutor {
    /// Fail commands whose rendered line contains `needle`.
    pub fn fail_matching(&self, needle: &str) {
        self.failures.lock().unwrap().push(needle.to_string());
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

impl Executor for RecordingExecutor {
    fn run(&self, cmd: &Cmd) -> Result<CmdOutput> {
        let line = cmd.to_string();
        self.commands.lock().unwrap().push(line.clone());
        if self
            .failures
            .lock()
            .unwrap()
            .iter()
            .any(|needle| line.contains(needle.as_str()))
        {
            return Err(Error::resource(
                ResourceKind::Command,
                format!("`{}` failed (status 1): injected", line),
            ));
        }
        Ok(CmdOutput::simulated())
    }

    fn apply(&self, _description: &str, action: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        action()
    }

    fn is_simulated(&self) -> bool {
        false
    }
}

/// Answers commands with canned output, matched by rendered-line prefix.
/// Unmatched commands succeed with empty output.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    replies: Mutex<Vec<(String, CmdOutput)>>,
    commands: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn reply(&self, prefix: &str, status: i32, stdout: &str, stderr: &str) -> &Self {
        self.replies.lock().unwrap().push((
            prefix.to_string(),
            CmdOutput {
                status: Some(status),
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            },
        ));
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

impl Executor for ScriptedExecutor {
    fn run(&self, cmd: &Cmd) -> Result<CmdOutput> {
        let line = cmd.to_string();
        self.commands.lock().unwrap().push(line.clone());
        let output = self
            .replies
            .lock()
            .unwrap()
            .iter()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_else(CmdOutput::simulated);
        cmd.check(output)
    }

    fn apply(&self, _description: &str, action: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        action()
    }

    fn is_simulated(&self) -> bool {
        false
    }
}
