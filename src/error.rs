//! Error taxonomy and process exit codes.
//!
//! Library operations return [`Error`]; the CLI maps each error onto a fixed
//! [`ExitCode`] and prints a recovery hint for its category.

use std::fmt;
use std::io;

use thiserror::Error;

/// Process exit codes reported by the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    InvalidArgs = 2,
    MissingDependency = 3,
    ConfigError = 4,
    PermissionError = 5,
    NetworkError = 6,
    Timeout = 7,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn label(self) -> &'static str {
        match self {
            ExitCode::Success => "success",
            ExitCode::GeneralError => "general error",
            ExitCode::InvalidArgs => "invalid arguments",
            ExitCode::MissingDependency => "missing dependency",
            ExitCode::ConfigError => "configuration error",
            ExitCode::PermissionError => "permission error",
            ExitCode::NetworkError => "network error",
            ExitCode::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code(), self.label())
    }
}

/// The external system a failed resource operation was talking to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Dataset,
    Container,
    Mount,
    Install,
    Provision,
    Filesystem,
    Command,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Dataset => "dataset",
            ResourceKind::Container => "container",
            ResourceKind::Mount => "mount",
            ResourceKind::Install => "install",
            ResourceKind::Provision => "provision",
            ResourceKind::Filesystem => "filesystem",
            ResourceKind::Command => "command",
        };
        f.write_str(name)
    }
}

/// A host tool that could not be found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingTool {
    pub tool: String,
    pub package: Option<String>,
}

impl fmt::Display for MissingTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.package {
            Some(package) => write!(f, "{} (install: {})", self.tool, package),
            None => write!(f, "{}", self.tool),
        }
    }
}

fn format_missing(missing: &[MissingTool]) -> String {
    missing
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid {field} '{value}': {reason}")]
    Validation {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid status '{0}'")]
    InvalidStatus(String),

    #[error("corrupt status entry: {0}")]
    CorruptStatus(String),

    #[error("missing required host tools: {}", format_missing(.missing))]
    Dependency { missing: Vec<MissingTool> },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{kind} operation failed: {detail}")]
    Resource { kind: ResourceKind, detail: String },

    #[error("timed out waiting for {what} after {attempts} attempts")]
    Timeout { what: String, attempts: u32 },

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("rollback action '{action}' failed: {source}")]
    Rollback {
        action: String,
        #[source]
        source: Box<Error>,
    },

    #[error("interrupted by signal")]
    Interrupted,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

const NETWORK_MARKERS: &[&str] = &[
    "Temporary failure in name resolution",
    "Could not resolve",
    "Failed to fetch",
    "Network is unreachable",
    "Connection timed out",
    "Connection refused",
    "Couldn't download",
];

const SPACE_MARKERS: &[&str] = &["No space left on device", "out of space", "quota exceeded"];

impl Error {
    pub fn validation(
        field: &'static str,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Validation {
            field,
            value: value.into(),
            reason: reason.into(),
        }
    }

    pub fn resource(kind: ResourceKind, detail: impl Into<String>) -> Self {
        Self::Resource {
            kind,
            detail: detail.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::PermissionDenied {
            return Self::Permission(format!("{}: {}", context.into(), source));
        }
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Map this error onto the CLI's exit code enumeration.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Error::Validation { .. } | Error::InvalidStatus(_) => ExitCode::InvalidArgs,
            Error::Dependency { .. } => ExitCode::MissingDependency,
            Error::Config(_) => ExitCode::ConfigError,
            Error::Permission(_) => ExitCode::PermissionError,
            Error::Timeout { .. } => ExitCode::Timeout,
            Error::Resource { detail, .. } if mentions(detail, NETWORK_MARKERS) => {
                ExitCode::NetworkError
            }
            Error::Rollback { source, .. } => source.exit_code(),
            Error::Io { source, .. } if source.kind() == io::ErrorKind::PermissionDenied => {
                ExitCode::PermissionError
            }
            _ => ExitCode::GeneralError,
        }
    }

    /// A category-specific hint for the operator, when one applies.
    pub fn recovery_hint(&self) -> Option<&'static str> {
        match self {
            Error::Resource { detail, .. } if mentions(detail, SPACE_MARKERS) => Some(
                "free space in the pool (`zfs list -o space`) or the host, then re-run `create` to resume",
            ),
            Error::Resource { detail, .. } if mentions(detail, NETWORK_MARKERS) => Some(
                "check DNS resolution and connectivity to the configured mirror, then re-run `create` to resume",
            ),
            Error::Permission(_) => Some(
                "ZFS and container operations need root; re-run with sudo",
            ),
            Error::Dependency { .. } => Some(
                "install the missing tools listed above; no build state was created",
            ),
            Error::Config(_) => Some(
                "check the [zfs] pool setting (or ROOTFS_BUILDER_POOL) and `zpool status`",
            ),
            Error::Resource {
                kind: ResourceKind::Dataset,
                ..
            } => Some(
                "inspect the dataset tree with `zfs list -r -t all`; `destroy` removes a partial build",
            ),
            Error::Resource {
                kind: ResourceKind::Container,
                ..
            } => Some(
                "inspect the container with `machinectl status`; `machinectl terminate` stops leftovers",
            ),
            Error::Resource {
                kind: ResourceKind::Mount,
                ..
            } => Some("look for stale mounts with `zfs mount` and `findmnt`; unmount them and retry"),
            Error::Timeout { .. } => Some(
                "the container is slow to boot; raise container.max_retries or container.poll_interval_secs",
            ),
            Error::Rollback { source, .. } => source.recovery_hint(),
            Error::Io { source, .. } if source.kind() == io::ErrorKind::PermissionDenied => {
                Some("ZFS and container operations need root; re-run with sudo")
            }
            _ => None,
        }
    }
}

fn mentions(detail: &str, markers: &[&str]) -> bool {
    markers.iter().any(|marker| detail.contains(marker))
}

/// Attach a context message to `std::io` failures, mirroring `anyhow::Context`.
pub trait IoContext<T> {
    fn io_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T> IoContext<T> for std::result::Result<T, io::Error> {
    fn io_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|source| Error::io(f(), source))
    }
}
