//! Build status model and its append-only persistence.
//!
//! Each build has one status file with one entry per line:
//!
//! ```text
//! 2025-01-01T00:00:00+00:00|os-installed|stage ok
//! ```
//!
//! The first two `|` are structural; everything after the second one is the
//! message, verbatim. The current status of a build is the status of its
//! last entry.

mod history;
mod store;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::{Error, Result};

pub use history::{format_duration, History, HistoryRow};
pub use store::{render_build_table, BuildSummary, StatusStore};

/// Field delimiter in status files.
pub const DELIMITER: char = '|';

/// Every status a build can record, in pipeline order.
///
/// Declaration order is precedence: a status's index in [`VALID_STATUSES`]
/// is its position in the pipeline, with `Failed` last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildStatus {
    Started,
    DatasetsCreated,
    OsInstalled,
    VarlogMounted,
    ContainerCreated,
    AnsibleConfigured,
    Completed,
    Failed,
}

pub const VALID_STATUSES: [BuildStatus; 8] = [
    BuildStatus::Started,
    BuildStatus::DatasetsCreated,
    BuildStatus::OsInstalled,
    BuildStatus::VarlogMounted,
    BuildStatus::ContainerCreated,
    BuildStatus::AnsibleConfigured,
    BuildStatus::Completed,
    BuildStatus::Failed,
];

impl BuildStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildStatus::Started => "started",
            BuildStatus::DatasetsCreated => "datasets-created",
            BuildStatus::OsInstalled => "os-installed",
            BuildStatus::VarlogMounted => "varlog-mounted",
            BuildStatus::ContainerCreated => "container-created",
            BuildStatus::AnsibleConfigured => "ansible-configured",
            BuildStatus::Completed => "completed",
            BuildStatus::Failed => "failed",
        }
    }

    /// Position in [`VALID_STATUSES`].
    pub fn index(self) -> usize {
        self as usize
    }

    /// Neither finished nor failed: a build left here was interrupted mid-run
    /// or is being driven by another process.
    pub fn is_in_progress(self) -> bool {
        !matches!(self, BuildStatus::Completed | BuildStatus::Failed)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        VALID_STATUSES
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::InvalidStatus(s.to_string()))
    }
}

/// One immutable line of a status file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusEntry {
    pub timestamp: String,
    pub status: BuildStatus,
    pub message: String,
}

impl StatusEntry {
    /// An entry stamped with the current time.
    pub fn new(status: BuildStatus, message: &str) -> Self {
        Self {
            timestamp: now_timestamp(),
            status,
            message: message.replace(['\r', '\n'], " "),
        }
    }

    pub fn parse_line(line: &str) -> Result<Self> {
        let (timestamp, rest) = line
            .split_once(DELIMITER)
            .ok_or_else(|| Error::CorruptStatus(format!("no '{}' delimiter in '{}'", DELIMITER, line)))?;
        let (status, message) = rest.split_once(DELIMITER).unwrap_or((rest, ""));
        if timestamp.is_empty() {
            return Err(Error::CorruptStatus(format!("empty timestamp in '{}'", line)));
        }
        Ok(Self {
            timestamp: timestamp.to_string(),
            status: status.parse()?,
            message: message.to_string(),
        })
    }

    pub fn to_line(&self) -> String {
        format!(
            "{}{d}{}{d}{}",
            self.timestamp,
            self.status,
            self.message,
            d = DELIMITER
        )
    }

    /// `None` when the stored timestamp is not valid ISO-8601/RFC 3339.
    pub fn parsed_timestamp(&self) -> Option<OffsetDateTime> {
        parse_timestamp(&self.timestamp)
    }
}

/// Current time as an ISO-8601 timestamp with whole seconds.
pub fn now_timestamp() -> String {
    let now = OffsetDateTime::now_utc();
    let now = now.replace_nanosecond(0).unwrap_or(now);
    now.format(&Rfc3339)
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}

pub fn parse_timestamp(raw: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(raw.trim(), &Rfc3339).ok()
}
