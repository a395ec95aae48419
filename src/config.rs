//! Builder configuration.
//!
//! Configuration is a TOML file with `[zfs]`, `[os]`, `[container]`,
//! `[provision]` and `[state]` tables. Every key has a default except the
//! pool, which must come from the file or `ROOTFS_BUILDER_POOL`.
//!
//! # Example
//!
//! ```toml
//! [zfs]
//! pool = "tank"
//!
//! [os]
//! distribution = "debian"
//! release = "bookworm"
//!
//! [container]
//! network = "bridge:br0"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::drivers::NetworkMode;
use crate::error::{Error, Result};
use crate::validate::validate_package_name;
use crate::wait::PollPolicy;

pub const CONFIG_ENV: &str = "ROOTFS_BUILDER_CONFIG";
pub const POOL_ENV: &str = "ROOTFS_BUILDER_POOL";
pub const STATE_DIR_ENV: &str = "ROOTFS_BUILDER_STATE_DIR";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/zfs-rootfs-builder/config.toml";
const APP_DIR: &str = "zfs-rootfs-builder";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub zfs: ZfsConfig,
    pub os: OsConfig,
    pub container: ContainerConfig,
    pub provision: ProvisionConfig,
    pub state: StateConfig,
    /// File the configuration was read from, if any.
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ZfsConfig {
    pub pool: Option<String>,
    /// Parent dataset, relative to the pool, under which builds live.
    pub dataset_base: String,
    /// Directory under which build roots are mounted.
    pub mount_base: PathBuf,
    /// Take a recursive `stage-<status>` snapshot after every stage.
    pub snapshots: bool,
}

impl Default for ZfsConfig {
    fn default() -> Self {
        Self {
            pool: None,
            dataset_base: "rootfs-builds".to_string(),
            mount_base: PathBuf::from("/var/tmp/zfs-rootfs-builder"),
            snapshots: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distribution {
    Ubuntu,
    Debian,
}

impl Distribution {
    pub fn default_mirror(self) -> &'static str {
        match self {
            Distribution::Ubuntu => "http://archive.ubuntu.com/ubuntu",
            Distribution::Debian => "http://deb.debian.org/debian",
        }
    }

    pub fn default_components(self) -> &'static [&'static str] {
        match self {
            Distribution::Ubuntu => &["main", "universe"],
            Distribution::Debian => &["main"],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OsConfig {
    pub distribution: Distribution,
    pub release: String,
    pub mirror: Option<String>,
    pub arch: String,
    pub components: Option<Vec<String>>,
    /// Extra packages passed to debootstrap `--include`.
    pub include: Vec<String>,
}

impl Default for OsConfig {
    fn default() -> Self {
        Self {
            distribution: Distribution::Ubuntu,
            release: "noble".to_string(),
            mirror: None,
            arch: "amd64".to_string(),
            components: None,
            include: vec![
                "systemd-sysv".to_string(),
                "dbus".to_string(),
                "python3".to_string(),
            ],
        }
    }
}

impl OsConfig {
    pub fn mirror_url(&self) -> &str {
        self.mirror
            .as_deref()
            .unwrap_or_else(|| self.distribution.default_mirror())
    }

    pub fn components(&self) -> Vec<String> {
        match &self.components {
            Some(components) => components.clone(),
            None => self
                .distribution
                .default_components()
                .iter()
                .map(|c| c.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContainerConfig {
    /// Extra capabilities granted to the container, e.g. `CAP_NET_ADMIN`.
    pub capabilities: Vec<String>,
    pub network: NetworkMode,
    pub poll_interval_secs: u64,
    pub max_retries: u32,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        let policy = PollPolicy::default();
        Self {
            capabilities: Vec::new(),
            network: NetworkMode::Veth,
            poll_interval_secs: policy.interval.as_secs(),
            max_retries: policy.max_retries,
        }
    }
}

impl ContainerConfig {
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy::new(Duration::from_secs(self.poll_interval_secs), self.max_retries)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProvisionConfig {
    /// Ansible playbook applied in the `ansible-configured` stage.
    pub playbook: Option<PathBuf>,
    /// Packages installed with apt after the playbook.
    pub packages: Vec<String>,
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StateConfig {
    pub dir: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/lib/zfs-rootfs-builder"),
        }
    }
}

impl Config {
    /// Load from the first configuration file found, then apply environment
    /// overrides. See [`search_paths`] for the order.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        Self::load_with(explicit, |key| std::env::var(key).ok())
    }

    pub fn load_with<F>(explicit: Option<&Path>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let requested = explicit
            .map(Path::to_path_buf)
            .or_else(|| lookup(CONFIG_ENV).filter(|v| !v.is_empty()).map(PathBuf::from));

        let config = match requested {
            Some(path) => {
                if !path.is_file() {
                    return Err(Error::config(format!(
                        "config file '{}' does not exist",
                        path.display()
                    )));
                }
                Self::from_file(&path)?
            }
            None => match search_paths().into_iter().find(|p| p.is_file()) {
                Some(path) => Self::from_file(&path)?,
                None => {
                    debug!("no config file found, using defaults");
                    Self::default()
                }
            },
        };

        let config = config.with_env_overrides(lookup);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|err| {
            Error::config(format!("reading config '{}': {}", path.display(), err))
        })?;
        let mut config = Self::from_toml_str(&raw).map_err(|err| match err {
            Error::Config(msg) => Error::config(format!("'{}': {}", path.display(), msg)),
            other => other,
        })?;
        debug!("loaded config from {}", path.display());
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|err| Error::config(format!("parsing TOML: {}", err)))
    }

    pub fn with_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(pool) = lookup(POOL_ENV).filter(|v| !v.trim().is_empty()) {
            self.zfs.pool = Some(pool.trim().to_string());
        }
        if let Some(dir) = lookup(STATE_DIR_ENV).filter(|v| !v.trim().is_empty()) {
            self.state.dir = PathBuf::from(dir.trim());
        }
        self
    }

    /// Structural checks that do not need the pool to exist.
    pub fn validate(&self) -> Result<()> {
        let base = &self.zfs.dataset_base;
        if base.is_empty() || base.starts_with('/') || base.ends_with('/') || base.contains('@') {
            return Err(Error::config(format!(
                "zfs.dataset_base '{}' must be a relative dataset path without '@'",
                base
            )));
        }
        if !self.zfs.mount_base.is_absolute() {
            return Err(Error::config(format!(
                "zfs.mount_base '{}' must be an absolute path",
                self.zfs.mount_base.display()
            )));
        }
        if !self.state.dir.is_absolute() {
            return Err(Error::config(format!(
                "state.dir '{}' must be an absolute path",
                self.state.dir.display()
            )));
        }
        if self.os.release.trim().is_empty() {
            return Err(Error::config("os.release must not be empty"));
        }
        if self.container.max_retries == 0 {
            return Err(Error::config("container.max_retries must be at least 1"));
        }
        for package in self.os.include.iter().chain(&self.provision.packages) {
            validate_package_name(package)
                .map_err(|err| Error::config(format!("package list: {}", err)))?;
        }
        Ok(())
    }

    /// The configured pool. Building without one is a configuration error.
    pub fn pool(&self) -> Result<&str> {
        match self.zfs.pool.as_deref() {
            Some(pool) if !pool.is_empty() => Ok(pool),
            _ => Err(Error::config(format!(
                "no ZFS pool configured; set [zfs] pool or {}",
                POOL_ENV
            ))),
        }
    }

    /// `<pool>/<dataset_base>`.
    pub fn parent_dataset(&self) -> Result<String> {
        Ok(format!("{}/{}", self.pool()?, self.zfs.dataset_base))
    }
}

/// Configuration files consulted when neither `--config` nor
/// `ROOTFS_BUILDER_CONFIG` names one, in priority order.
pub fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(SYSTEM_CONFIG_PATH)];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join(APP_DIR).join("config.toml"));
    }
    paths
}
