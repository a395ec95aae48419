use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{IoContext, Result};
use crate::process::SharedExecutor;
use crate::status::now_timestamp;
use crate::validate::{validate_build_name, validate_operation_name};

pub const MARKER_DIR: &str = "markers";
pub const MARKER_EXT: &str = "done";

/// Durable `(build, operation)` completion markers.
///
/// Each marker is `<state>/markers/<build>/<operation>.done` holding the
/// completion time. Markers written by this process are also kept in memory.
pub struct MarkerStore {
    root: PathBuf,
    exec: SharedExecutor,
    completed: HashSet<(String, String)>,
}

impl MarkerStore {
    pub fn new(state_dir: &Path, exec: SharedExecutor) -> Self {
        Self {
            root: state_dir.join(MARKER_DIR),
            exec,
            completed: HashSet::new(),
        }
    }

    pub fn build_dir(&self, build: &str) -> PathBuf {
        self.root.join(build)
    }

    pub fn marker_path(&self, build: &str, operation: &str) -> PathBuf {
        self.build_dir(build)
            .join(format!("{}.{}", operation, MARKER_EXT))
    }

    pub fn mark_complete(&mut self, build: &str, operation: &str) -> Result<()> {
        validate_build_name(build)?;
        validate_operation_name(operation)?;
        let path = self.marker_path(build, operation);
        let completed = &mut self.completed;

        self.exec.apply(
            &format!("mark {}/{} complete", build, operation),
            &mut || {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).io_context(|| {
                        format!("creating marker directory '{}'", parent.display())
                    })?;
                }
                fs::write(&path, format!("{}\n", now_timestamp()))
                    .io_context(|| format!("writing marker '{}'", path.display()))?;
                completed.insert((build.to_string(), operation.to_string()));
                Ok(())
            },
        )?;
        debug!(build, operation, "operation marked complete");
        Ok(())
    }

    /// The marker file wins; the in-memory set covers markers whose file
    /// has since become unreadable.
    pub fn is_complete(&self, build: &str, operation: &str) -> bool {
        if validate_build_name(build).is_err() || validate_operation_name(operation).is_err() {
            return false;
        }
        self.marker_path(build, operation).is_file()
            || self
                .completed
                .contains(&(build.to_string(), operation.to_string()))
    }

    /// Completion time recorded in the marker file.
    pub fn completed_at(&self, build: &str, operation: &str) -> Option<String> {
        fs::read_to_string(self.marker_path(build, operation))
            .ok()
            .map(|content| content.trim().to_string())
    }

    /// Remove every marker of `build`.
    pub fn clear(&mut self, build: &str) -> Result<()> {
        self.clear_where(build, |_| true).map(|_| ())
    }

    /// Remove the markers of `build` whose operation name matches `pred`.
    /// Returns how many marker files were removed.
    pub fn clear_where<F>(&mut self, build: &str, pred: F) -> Result<usize>
    where
        F: Fn(&str) -> bool,
    {
        validate_build_name(build)?;
        let dir = self.build_dir(build);
        let completed = &mut self.completed;
        let mut removed = 0;

        self.exec.apply(
            &format!("clear markers of {}", build),
            &mut || {
                completed.retain(|(b, op)| b != build || !pred(op.as_str()));
                if !dir.is_dir() {
                    return Ok(());
                }
                for entry in fs::read_dir(&dir)
                    .io_context(|| format!("reading marker directory '{}'", dir.display()))?
                {
                    let path = entry
                        .io_context(|| format!("reading marker directory '{}'", dir.display()))?
                        .path();
                    if path.extension().and_then(|e| e.to_str()) != Some(MARKER_EXT) {
                        continue;
                    }
                    let Some(operation) = path.file_stem().and_then(|s| s.to_str()) else {
                        continue;
                    };
                    if pred(operation) {
                        fs::remove_file(&path)
                            .io_context(|| format!("removing marker '{}'", path.display()))?;
                        removed += 1;
                    }
                }
                // Only drop the directory once it holds nothing else.
                if fs::read_dir(&dir)
                    .map(|mut entries| entries.next().is_none())
                    .unwrap_or(false)
                {
                    fs::remove_dir(&dir)
                        .io_context(|| format!("removing marker directory '{}'", dir.display()))?;
                }
                Ok(())
            },
        )?;
        Ok(removed)
    }
}
