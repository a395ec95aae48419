//! Cleanup and rollback stacks plus operation completion markers.
//!
//! The two stacks have different failure contracts:
//!
//! - the **cleanup stack** releases resources when a build aborts. It is
//!   best-effort: every entry runs, failures are logged, and the stack is
//!   always drained.
//! - the **rollback stack** undoes the steps of one multi-step operation. It
//!   is strict: it stops at the first failing entry and reports it.
//!
//! Both run newest-first. A [`RecoverySession`] dropped with pending cleanup
//! entries runs them as an emergency cleanup, so an early return or panic
//! still releases what the build acquired.

mod markers;

use std::fmt;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::process::{Cmd, Executor, SharedExecutor};

pub use markers::{MarkerStore, MARKER_DIR, MARKER_EXT};

type Callback = Box<dyn FnMut() -> Result<()> + Send>;

enum Body {
    Callback(Callback),
    Command(Cmd),
}

/// A named stack entry: either a closure or a command line.
pub struct Action {
    name: String,
    body: Body,
}

impl Action {
    pub fn new<F>(name: impl Into<String>, callback: F) -> Self
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        Self {
            name: name.into(),
            body: Body::Callback(Box::new(callback)),
        }
    }

    pub fn command(name: impl Into<String>, cmd: Cmd) -> Self {
        Self {
            name: name.into(),
            body: Body::Command(cmd),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn execute(&mut self, exec: &dyn Executor) -> Result<()> {
        match &mut self.body {
            Body::Callback(callback) => callback(),
            Body::Command(cmd) => exec.run(cmd).map(|_| ()),
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.body {
            Body::Callback(_) => write!(f, "Action({:?}, <callback>)", self.name),
            Body::Command(cmd) => write!(f, "Action({:?}, `{}`)", self.name, cmd),
        }
    }
}

/// Result of draining the cleanup stack.
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub ran: usize,
    pub failures: Vec<(String, Error)>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Recovery state of one orchestrator run.
pub struct RecoverySession {
    exec: SharedExecutor,
    cleanup: Vec<Action>,
    rollback: Vec<Action>,
    markers: MarkerStore,
}

impl RecoverySession {
    pub fn new(state_dir: &Path, exec: SharedExecutor) -> Self {
        Self {
            markers: MarkerStore::new(state_dir, exec.clone()),
            exec,
            cleanup: Vec::new(),
            rollback: Vec::new(),
        }
    }

    pub fn add_cleanup(&mut self, action: Action) -> Result<()> {
        push_action(&*self.exec, &mut self.cleanup, "cleanup", action)
    }

    pub fn add_rollback(&mut self, action: Action) -> Result<()> {
        push_action(&*self.exec, &mut self.rollback, "rollback", action)
    }

    /// Remove the oldest cleanup entry named `name`, or every such entry.
    /// Returns how many were removed.
    pub fn remove_cleanup(&mut self, name: &str, all: bool) -> Result<usize> {
        let stack = &mut self.cleanup;
        let mut removed = 0;
        self.exec.apply(
            &format!("remove cleanup entry '{}'", name),
            &mut || {
                if all {
                    let before = stack.len();
                    stack.retain(|action| action.name != name);
                    removed = before - stack.len();
                } else if let Some(pos) = stack.iter().position(|action| action.name == name) {
                    stack.remove(pos);
                    removed = 1;
                }
                Ok(())
            },
        )?;
        Ok(removed)
    }

    /// Run every cleanup entry newest-first, logging failures and
    /// continuing. The stack is empty afterwards.
    pub fn run_cleanup_stack(&mut self) -> CleanupReport {
        let mut report = CleanupReport::default();
        if self.cleanup.is_empty() {
            return report;
        }
        info!("running {} cleanup action(s)", self.cleanup.len());

        while let Some(mut action) = self.cleanup.pop() {
            report.ran += 1;
            match action.execute(&*self.exec) {
                Ok(()) => debug!("cleanup '{}' done", action.name),
                Err(err) => {
                    warn!("cleanup '{}' failed: {}", action.name, err);
                    report.failures.push((action.name, err));
                }
            }
        }
        report
    }

    /// Undo the current operation newest-first, stopping at the first
    /// failure. The stack is cleared whether or not every entry ran.
    pub fn execute_rollback(&mut self) -> Result<()> {
        let mut actions = std::mem::take(&mut self.rollback);
        if actions.is_empty() {
            return Ok(());
        }
        info!("rolling back {} step(s)", actions.len());

        while let Some(mut action) = actions.pop() {
            if let Err(err) = action.execute(&*self.exec) {
                if !actions.is_empty() {
                    warn!(
                        "rollback stopped at '{}'; {} earlier step(s) not undone",
                        action.name,
                        actions.len()
                    );
                }
                return Err(Error::Rollback {
                    action: action.name,
                    source: Box::new(err),
                });
            }
            debug!("rollback '{}' done", action.name);
        }
        Ok(())
    }

    /// Commit the current operation: drop its undo entries unrun.
    pub fn clear_rollback(&mut self) {
        self.rollback.clear();
    }

    /// Forget pending cleanup entries without running them.
    pub fn clear_cleanup(&mut self) {
        self.cleanup.clear();
    }

    /// Drain the cleanup stack, ignoring every failure.
    pub fn emergency_cleanup(&mut self, reason: &str) {
        if self.cleanup.is_empty() {
            return;
        }
        warn!(
            "emergency cleanup ({}): {} action(s)",
            reason,
            self.cleanup.len()
        );
        while let Some(mut action) = self.cleanup.pop() {
            let _ = action.execute(&*self.exec);
        }
    }

    pub fn cleanup_len(&self) -> usize {
        self.cleanup.len()
    }

    pub fn rollback_len(&self) -> usize {
        self.rollback.len()
    }

    /// Cleanup entry names, oldest first.
    pub fn cleanup_names(&self) -> Vec<&str> {
        self.cleanup.iter().map(Action::name).collect()
    }

    pub fn mark_operation_complete(&mut self, build: &str, operation: &str) -> Result<()> {
        self.markers.mark_complete(build, operation)
    }

    pub fn is_operation_complete(&self, build: &str, operation: &str) -> bool {
        self.markers.is_complete(build, operation)
    }

    pub fn clear_markers(&mut self, build: &str) -> Result<()> {
        self.markers.clear(build)
    }

    pub fn markers(&self) -> &MarkerStore {
        &self.markers
    }

    pub fn markers_mut(&mut self) -> &mut MarkerStore {
        &mut self.markers
    }
}

impl Drop for RecoverySession {
    fn drop(&mut self) {
        self.emergency_cleanup("recovery session dropped");
    }
}

impl fmt::Debug for RecoverySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoverySession")
            .field("cleanup", &self.cleanup)
            .field("rollback", &self.rollback)
            .finish_non_exhaustive()
    }
}

fn push_action(
    exec: &dyn Executor,
    stack: &mut Vec<Action>,
    which: &str,
    action: Action,
) -> Result<()> {
    let description = format!("register {} '{}'", which, action.name);
    let mut slot = Some(action);
    exec.apply(&description, &mut || {
        if let Some(action) = slot.take() {
            stack.push(action);
        }
        Ok(())
    })
}
