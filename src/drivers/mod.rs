//! Capability traits for the external systems a build drives.
//!
//! The orchestrator only talks to datasets and containers through
//! [`DatasetDriver`] and [`ContainerDriver`]. [`Zfs`] and [`Nspawn`] shell out
//! through the injected executor; tests substitute in-memory fakes.
//!
//! Mutations are idempotent where the host allows it: creating an existing
//! dataset or starting a running container succeeds without change, and
//! destroying something that is already gone is a no-op.

#[cfg(test)]
pub(crate) mod fake;
mod nspawn;
mod zfs;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::wait::PollPolicy;

pub use nspawn::{unit_name, Nspawn};
pub use zfs::Zfs;

/// Options for [`DatasetDriver::create`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateOptions {
    pub mountpoint: Option<PathBuf>,
    pub properties: Vec<(String, String)>,
    /// Create missing ancestors as well.
    pub parents: bool,
}

impl CreateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mountpoint(mut self, path: impl Into<PathBuf>) -> Self {
        self.mountpoint = Some(path.into());
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push((key.into(), value.into()));
        self
    }

    pub fn parents(mut self) -> Self {
        self.parents = true;
        self
    }
}

pub trait DatasetDriver: Send + Sync {
    fn exists(&self, dataset: &str) -> Result<bool>;

    /// Create `dataset` unless it already exists.
    fn create(&self, dataset: &str, options: &CreateOptions) -> Result<()>;

    /// Destroy a dataset or snapshot; a missing one is not an error.
    fn destroy(&self, dataset: &str, recursive: bool, force: bool) -> Result<()>;

    /// `None` when the dataset does not exist or the property is unset.
    fn get_property(&self, dataset: &str, property: &str) -> Result<Option<String>>;

    fn mount(&self, dataset: &str, target: &Path) -> Result<()>;

    fn unmount(&self, dataset: &str, force: bool) -> Result<()>;

    /// Recursive snapshot `<dataset>@<name>` of the dataset and its children.
    fn snapshot(&self, dataset: &str, name: &str) -> Result<()>;

    /// Full names of snapshots in the tree under `dataset` whose snapshot
    /// part matches the glob `pattern`.
    fn list_snapshots(&self, dataset: &str, pattern: &str) -> Result<Vec<String>>;

    fn rollback(&self, snapshot: &str, force: bool) -> Result<()>;

    /// Pool health as reported by `zpool`, e.g. `ONLINE` or `DEGRADED`.
    fn pool_health(&self, pool: &str) -> Result<String>;
}

pub trait ContainerDriver: Send + Sync {
    fn is_running(&self, name: &str) -> Result<bool>;

    /// Create and boot a container; a running one is left alone.
    fn start(&self, spec: &ContainerSpec) -> Result<()>;

    fn stop(&self, name: &str, force: bool) -> Result<()>;

    /// Stop the container and release everything the host keeps for it.
    fn destroy(&self, name: &str) -> Result<()>;

    /// Run a shell command inside the container and return its exit status.
    fn run_command(&self, name: &str, command: &str) -> Result<i32>;

    fn status(&self, name: &str) -> Result<ContainerStatus>;

    /// Block until the container's init reports it has finished booting.
    fn wait_until_ready(&self, name: &str, policy: &PollPolicy) -> Result<()>;
}

/// Everything needed to boot one build container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub rootfs: PathBuf,
    pub hostname: String,
    pub capabilities: Vec<String>,
    pub network: NetworkMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum NetworkMode {
    /// Share the host's network namespace.
    Host,
    /// Loopback only.
    None,
    /// Private veth pair to the host.
    Veth,
    /// Veth pair attached to a host bridge.
    Bridge(String),
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkMode::Host => f.write_str("host"),
            NetworkMode::None => f.write_str("none"),
            NetworkMode::Veth => f.write_str("veth"),
            NetworkMode::Bridge(bridge) => write!(f, "bridge:{}", bridge),
        }
    }
}

impl FromStr for NetworkMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "host" => Ok(NetworkMode::Host),
            "none" => Ok(NetworkMode::None),
            "veth" => Ok(NetworkMode::Veth),
            _ => match s.strip_prefix("bridge:") {
                Some(bridge)
                    if !bridge.is_empty()
                        && bridge
                            .chars()
                            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')) =>
                {
                    Ok(NetworkMode::Bridge(bridge.to_string()))
                }
                _ => Err(Error::validation(
                    "network mode",
                    s,
                    "expected 'host', 'none', 'veth' or 'bridge:<name>'",
                )),
            },
        }
    }
}

impl TryFrom<String> for NetworkMode {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<NetworkMode> for String {
    fn from(mode: NetworkMode) -> Self {
        mode.to_string()
    }
}

/// Snapshot of a container as the host sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerStatus {
    pub name: String,
    /// Machine state, or `absent` when the host does not know the container.
    pub state: String,
    pub leader: Option<u32>,
    pub since: Option<String>,
}

impl ContainerStatus {
    pub fn absent(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: "absent".to_string(),
            leader: None,
            since: None,
        }
    }

    pub fn running(&self) -> bool {
        self.state == "running"
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.state)?;
        if let Some(leader) = self.leader {
            write!(f, " (leader pid {})", leader)?;
        }
        if let Some(since) = &self.since {
            write!(f, " since {}", since)?;
        }
        Ok(())
    }
}

/// Reject names the drivers would splice into a snapshot or dataset path.
pub(crate) fn ensure_no_at(field: &'static str, value: &str) -> Result<()> {
    if value.contains('@') {
        return Err(Error::validation(field, value, "no '@' allowed here"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_mode_parsing() {
        assert_eq!("host".parse::<NetworkMode>().unwrap(), NetworkMode::Host);
        assert_eq!("none".parse::<NetworkMode>().unwrap(), NetworkMode::None);
        assert_eq!("veth".parse::<NetworkMode>().unwrap(), NetworkMode::Veth);
        assert_eq!(
            "bridge:br0".parse::<NetworkMode>().unwrap(),
            NetworkMode::Bridge("br0".to_string())
        );
        assert!("bridge:".parse::<NetworkMode>().is_err());
        assert!("bridge:br 0".parse::<NetworkMode>().is_err());
        assert!("macvlan".parse::<NetworkMode>().is_err());
        assert_eq!(NetworkMode::Bridge("lan".into()).to_string(), "bridge:lan");
    }

    #[test]
    fn test_create_options_builder() {
        let opts = CreateOptions::new()
            .parents()
            .mountpoint("/mnt/demo")
            .property("canmount", "noauto");
        assert!(opts.parents);
        assert_eq!(opts.mountpoint, Some(PathBuf::from("/mnt/demo")));
        assert_eq!(
            opts.properties,
            vec![("canmount".to_string(), "noauto".to_string())]
        );
    }
}
