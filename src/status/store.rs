use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::Serialize;
use tracing::{debug, warn};

use super::{BuildStatus, History, StatusEntry};
use crate::error::{Error, IoContext, Result};
use crate::process::SharedExecutor;
use crate::validate::validate_build_name;

const STATUS_DIR: &str = "status";
const LOG_DIR: &str = "logs";
const STATUS_EXT: &str = "status";
const LOG_EXT: &str = "log";

/// Per-build status and log files under `<state_dir>/status` and
/// `<state_dir>/logs`.
#[derive(Clone)]
pub struct StatusStore {
    root: PathBuf,
    exec: SharedExecutor,
}

/// Last known state of one build, as shown by `list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildSummary {
    pub name: String,
    pub status: BuildStatus,
    pub updated: String,
    pub message: String,
}

impl StatusStore {
    pub fn new(state_dir: impl Into<PathBuf>, exec: SharedExecutor) -> Self {
        Self {
            root: state_dir.into(),
            exec,
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.root
    }

    pub fn status_dir(&self) -> PathBuf {
        self.root.join(STATUS_DIR)
    }

    pub fn status_path(&self, build: &str) -> PathBuf {
        self.status_dir().join(format!("{}.{}", build, STATUS_EXT))
    }

    pub fn log_path(&self, build: &str) -> PathBuf {
        self.root.join(LOG_DIR).join(format!("{}.{}", build, LOG_EXT))
    }

    /// Append a status entry stamped with the current time.
    pub fn set_status(&self, build: &str, status: BuildStatus, message: &str) -> Result<()> {
        validate_build_name(build)?;
        let entry = StatusEntry::new(status, message);
        let path = self.status_path(build);
        let line = entry.to_line();
        self.exec.apply(
            &format!("append '{}' to {}", line, path.display()),
            &mut || append_line(&path, &line),
        )?;
        debug!(build, %status, "status recorded");
        Ok(())
    }

    /// Like [`set_status`](Self::set_status) for an unparsed status name.
    pub fn set_status_str(&self, build: &str, status: &str, message: &str) -> Result<()> {
        let status: BuildStatus = status.parse()?;
        self.set_status(build, status, message)
    }

    /// All entries, oldest first. A build without a status file has none.
    pub fn entries(&self, build: &str) -> Result<Vec<StatusEntry>> {
        validate_build_name(build)?;
        let path = self.status_path(build);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path)
            .io_context(|| format!("reading status file '{}'", path.display()))?;

        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                StatusEntry::parse_line(line).map_err(|err| match err {
                    Error::CorruptStatus(detail) => Error::CorruptStatus(format!(
                        "{}:{}: {}",
                        path.display(),
                        n + 1,
                        detail
                    )),
                    other => other,
                })
            })
            .collect()
    }

    pub fn last_entry(&self, build: &str) -> Result<Option<StatusEntry>> {
        Ok(self.entries(build)?.pop())
    }

    /// Current status, or `None` for a build that has never recorded one.
    pub fn get_status(&self, build: &str) -> Result<Option<BuildStatus>> {
        Ok(self.last_entry(build)?.map(|entry| entry.status))
    }

    pub fn get_status_timestamp(&self, build: &str) -> Result<Option<String>> {
        Ok(self.last_entry(build)?.map(|entry| entry.timestamp))
    }

    /// Remove the status and log files of a build.
    ///
    /// Without `force`, a build whose current status is in progress is left
    /// alone.
    pub fn clear_status(&self, build: &str, force: bool) -> Result<()> {
        validate_build_name(build)?;
        if !force {
            if let Some(status) = self.get_status(build)? {
                if status.is_in_progress() {
                    return Err(Error::validation(
                        "build",
                        build,
                        format!(
                            "current status '{}' is in progress; use --force to clear it",
                            status
                        ),
                    ));
                }
            }
        }

        for path in [self.status_path(build), self.log_path(build)] {
            if !path.exists() {
                continue;
            }
            self.exec
                .apply(&format!("remove {}", path.display()), &mut || {
                    fs::remove_file(&path)
                        .io_context(|| format!("removing '{}'", path.display()))
                })?;
        }
        Ok(())
    }

    /// Every build with a non-empty status file, sorted by name.
    ///
    /// Unreadable status files are reported and skipped so one corrupt build
    /// does not hide the others.
    pub fn list_builds(&self) -> Result<Vec<BuildSummary>> {
        let dir = self.status_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut builds = Vec::new();
        for entry in
            fs::read_dir(&dir).io_context(|| format!("reading status directory '{}'", dir.display()))?
        {
            let entry =
                entry.io_context(|| format!("iterating status directory '{}'", dir.display()))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(STATUS_EXT) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            match self.last_entry(name) {
                Ok(Some(last)) => builds.push(BuildSummary {
                    name: name.to_string(),
                    status: last.status,
                    updated: last.timestamp,
                    message: last.message,
                }),
                Ok(None) => {}
                Err(err) => warn!(build = name, error = %err, "skipping unreadable status file"),
            }
        }

        builds.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(builds)
    }

    /// Entries with per-transition durations; `tail` limits to the last N.
    pub fn history(&self, build: &str, tail: Option<usize>) -> Result<History> {
        Ok(History::from_entries(build, self.entries(build)?, tail))
    }
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .io_context(|| format!("creating status directory '{}'", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .io_context(|| format!("opening status file '{}'", path.display()))?;
    file.lock_exclusive()
        .io_context(|| format!("locking status file '{}'", path.display()))?;
    let written = writeln!(file, "{}", line)
        .io_context(|| format!("appending to status file '{}'", path.display()));
    let _ = file.unlock();
    written
}

/// Name/status/last-updated/message table for `list`.
pub fn render_build_table(builds: &[BuildSummary]) -> String {
    if builds.is_empty() {
        return "No builds found\n".to_string();
    }

    let headers = ["NAME", "STATUS", "LAST UPDATED", "MESSAGE"];
    let name_w = column_width(headers[0], builds.iter().map(|b| b.name.len()));
    let status_w = column_width(headers[1], builds.iter().map(|b| b.status.as_str().len()));
    let updated_w = column_width(headers[2], builds.iter().map(|b| b.updated.len()));

    let mut out = format!(
        "{:<name_w$}  {:<status_w$}  {:<updated_w$}  {}\n",
        headers[0], headers[1], headers[2], headers[3],
    );
    for build in builds {
        out.push_str(
            format!(
                "{:<name_w$}  {:<status_w$}  {:<updated_w$}  {}",
                build.name,
                build.status.as_str(),
                build.updated,
                build.message,
            )
            .trim_end(),
        );
        out.push('\n');
    }
    out
}

fn column_width(header: &str, values: impl Iterator<Item = usize>) -> usize {
    values.fold(header.len(), usize::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{RealExecutor, SimulatedExecutor};
    use crate::progression::{next_stage, should_run_stage};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn store() -> (TempDir, StatusStore) {
        let temp = TempDir::new().unwrap();
        let store = StatusStore::new(temp.path(), Arc::new(RealExecutor));
        (temp, store)
    }

    #[test]
    fn test_unknown_build_has_no_status() {
        let (_temp, store) = store();
        assert_eq!(store.get_status("fresh").unwrap(), None);
        assert_eq!(store.get_status_timestamp("fresh").unwrap(), None);
        assert!(store.entries("fresh").unwrap().is_empty());
    }

    #[test]
    fn test_last_write_wins() {
        let (_temp, store) = store();
        let sequence = [
            BuildStatus::Started,
            BuildStatus::DatasetsCreated,
            BuildStatus::Failed,
            BuildStatus::DatasetsCreated,
            BuildStatus::OsInstalled,
        ];
        for status in sequence {
            store.set_status("demo", status, "").unwrap();
            assert_eq!(store.get_status("demo").unwrap(), Some(status));
        }
        assert_eq!(store.entries("demo").unwrap().len(), sequence.len());
    }

    #[test]
    fn test_set_status_str_rejects_unknown_status() {
        let (_temp, store) = store();
        let err = store.set_status_str("demo", "booting", "").unwrap_err();
        assert!(matches!(err, Error::InvalidStatus(_)));
        assert!(!store.status_path("demo").exists());
    }

    #[test]
    fn test_file_format_is_pipe_delimited() {
        let (_temp, store) = store();
        store
            .set_status("demo", BuildStatus::Failed, "disk full | retry later")
            .unwrap();
        let content = fs::read_to_string(store.status_path("demo")).unwrap();
        let line = content.lines().next().unwrap();
        let parts: Vec<&str> = line.splitn(3, '|').collect();
        assert_eq!(parts[1], "failed");
        assert_eq!(parts[2], "disk full | retry later");
    }

    #[test]
    fn test_invalid_build_name_rejected_before_write() {
        let (temp, store) = store();
        assert!(store
            .set_status("../escape", BuildStatus::Started, "")
            .is_err());
        assert!(!temp.path().join(STATUS_DIR).exists());
    }

    #[test]
    fn test_corrupt_line_is_an_error_not_absence() {
        let (_temp, store) = store();
        store.set_status("demo", BuildStatus::Started, "").unwrap();
        let mut file = OpenOptions::new()
            .append(true)
            .open(store.status_path("demo"))
            .unwrap();
        writeln!(file, "not a status line").unwrap();
        let err = store.get_status("demo").unwrap_err();
        assert!(err.to_string().contains(":2:"));
    }

    #[test]
    fn test_clear_status_removes_files_and_respects_force() {
        let (_temp, store) = store();
        store.set_status("demo", BuildStatus::OsInstalled, "").unwrap();
        fs::create_dir_all(store.log_path("demo").parent().unwrap()).unwrap();
        fs::write(store.log_path("demo"), "log\n").unwrap();

        assert!(store.clear_status("demo", false).is_err());
        assert!(store.status_path("demo").exists());

        store.clear_status("demo", true).unwrap();
        assert!(!store.status_path("demo").exists());
        assert!(!store.log_path("demo").exists());
        assert_eq!(store.get_status("demo").unwrap(), None);

        // Clearing an absent build is fine.
        store.clear_status("demo", false).unwrap();
    }

    #[test]
    fn test_clear_finished_build_without_force() {
        let (_temp, store) = store();
        store.set_status("done", BuildStatus::Completed, "").unwrap();
        store.clear_status("done", false).unwrap();
        assert!(!store.status_path("done").exists());
    }

    #[test]
    fn test_simulated_store_writes_nothing() {
        let temp = TempDir::new().unwrap();
        let exec = Arc::new(SimulatedExecutor::new());
        let store = StatusStore::new(temp.path(), exec.clone());
        store.set_status("demo", BuildStatus::Started, "").unwrap();

        assert!(!store.status_path("demo").exists());
        assert_eq!(exec.intents().len(), 1);
        assert!(exec.intents()[0].contains("|started|"));
    }

    #[test]
    fn test_simulated_clear_keeps_files() {
        let temp = TempDir::new().unwrap();
        StatusStore::new(temp.path(), Arc::new(RealExecutor))
            .set_status("demo", BuildStatus::Completed, "")
            .unwrap();

        let exec = Arc::new(SimulatedExecutor::new());
        let store = StatusStore::new(temp.path(), exec.clone());
        store.clear_status("demo", true).unwrap();
        assert!(store.status_path("demo").exists());
        assert!(exec.intents()[0].starts_with("remove "));
    }

    #[test]
    fn test_list_builds_sorted_and_empty_table() {
        let (_temp, store) = store();
        assert!(store.list_builds().unwrap().is_empty());
        assert_eq!(render_build_table(&[]), "No builds found\n");

        store.set_status("zeta", BuildStatus::Started, "").unwrap();
        store
            .set_status("alpha", BuildStatus::Completed, "all good")
            .unwrap();
        let builds = store.list_builds().unwrap();
        let names: Vec<_> = builds.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, ["alpha", "zeta"]);

        let table = render_build_table(&builds);
        let lines: Vec<_> = table.lines().collect();
        assert!(lines[0].starts_with("NAME"));
        assert!(lines[1].starts_with("alpha"));
        assert!(lines[1].contains("completed"));
        assert!(lines[1].ends_with("all good"));
    }

    #[test]
    fn test_demo_scenario() {
        let (_temp, store) = store();
        let current = store.get_status("demo").unwrap();
        assert!(should_run_stage(BuildStatus::Started, current, false).should_run());

        store.set_status("demo", BuildStatus::Started, "").unwrap();
        let current = store.get_status("demo").unwrap();
        assert!(should_run_stage(BuildStatus::DatasetsCreated, current, false).should_run());

        store
            .set_status("demo", BuildStatus::DatasetsCreated, "")
            .unwrap();
        let current = store.get_status("demo").unwrap();
        assert!(!should_run_stage(BuildStatus::DatasetsCreated, current, false).should_run());
        assert!(should_run_stage(BuildStatus::OsInstalled, current, false).should_run());

        store
            .set_status("demo", BuildStatus::Failed, "disk full")
            .unwrap();
        let current = store.get_status("demo").unwrap();
        assert_eq!(current, Some(BuildStatus::Failed));
        assert_eq!(
            next_stage(BuildStatus::Failed),
            Some(BuildStatus::DatasetsCreated)
        );
        assert!(should_run_stage(BuildStatus::DatasetsCreated, current, false).should_run());
        assert!(!should_run_stage(BuildStatus::OsInstalled, current, false).should_run());
    }
}
