//! Stage ordering and the run/skip decision.
//!
//! A build advances one stage at a time. The decision only looks at the
//! current status, so a resumed build picks up exactly where its status file
//! says it stopped. `failed` sends the build back to `datasets-created`.

use std::fmt;

use crate::error::Result;
use crate::status::{BuildStatus, StatusStore};

/// The pipeline, in execution order. `Failed` is a status, not a stage.
pub const STAGES: [BuildStatus; 7] = [
    BuildStatus::Started,
    BuildStatus::DatasetsCreated,
    BuildStatus::OsInstalled,
    BuildStatus::VarlogMounted,
    BuildStatus::ContainerCreated,
    BuildStatus::AnsibleConfigured,
    BuildStatus::Completed,
];

pub fn first_stage() -> BuildStatus {
    STAGES[0]
}

/// The stage that may run after `status`, if any.
pub fn next_stage(status: BuildStatus) -> Option<BuildStatus> {
    match status {
        BuildStatus::Started => Some(BuildStatus::DatasetsCreated),
        BuildStatus::DatasetsCreated => Some(BuildStatus::OsInstalled),
        BuildStatus::OsInstalled => Some(BuildStatus::VarlogMounted),
        BuildStatus::VarlogMounted => Some(BuildStatus::ContainerCreated),
        BuildStatus::ContainerCreated => Some(BuildStatus::AnsibleConfigured),
        BuildStatus::AnsibleConfigured => Some(BuildStatus::Completed),
        BuildStatus::Completed => None,
        BuildStatus::Failed => Some(BuildStatus::DatasetsCreated),
    }
}

/// Outcome of asking whether a stage may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageDecision {
    Run,
    AlreadyDone {
        current: BuildStatus,
    },
    WouldSkip {
        current: BuildStatus,
        expected: BuildStatus,
    },
    BuildComplete,
    NotStarted {
        expected: BuildStatus,
    },
    AwaitingRecovery {
        expected: BuildStatus,
    },
    NotAStage,
}

impl StageDecision {
    pub fn should_run(self) -> bool {
        self == StageDecision::Run
    }
}

impl fmt::Display for StageDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageDecision::Run => write!(f, "stage may run"),
            StageDecision::AlreadyDone { current } => {
                write!(f, "already done (current status '{}')", current)
            }
            StageDecision::WouldSkip { current, expected } => write!(
                f,
                "would skip stages: current status is '{}', next stage is '{}'",
                current, expected
            ),
            StageDecision::BuildComplete => write!(f, "build already completed"),
            StageDecision::NotStarted { expected } => {
                write!(f, "build has no status yet; first stage is '{}'", expected)
            }
            StageDecision::AwaitingRecovery { expected } => {
                write!(f, "build failed; it resumes at '{}'", expected)
            }
            StageDecision::NotAStage => write!(f, "'failed' is not a runnable stage"),
        }
    }
}

/// Decide whether `stage` may run given the build's current status.
pub fn should_run_stage(
    stage: BuildStatus,
    current: Option<BuildStatus>,
    force_restart: bool,
) -> StageDecision {
    if stage == BuildStatus::Failed {
        return StageDecision::NotAStage;
    }
    if force_restart {
        return StageDecision::Run;
    }

    let current = match current {
        None if stage == first_stage() => return StageDecision::Run,
        None => {
            return StageDecision::NotStarted {
                expected: first_stage(),
            }
        }
        Some(current) => current,
    };

    match current {
        BuildStatus::Completed => StageDecision::BuildComplete,
        BuildStatus::Failed => match next_stage(current) {
            Some(expected) if expected == stage => StageDecision::Run,
            Some(expected) => StageDecision::AwaitingRecovery { expected },
            None => StageDecision::BuildComplete,
        },
        _ if stage.index() <= current.index() => StageDecision::AlreadyDone { current },
        _ if stage.index() == current.index() + 1 => StageDecision::Run,
        _ => StageDecision::WouldSkip {
            current,
            expected: next_stage(current).unwrap_or(stage),
        },
    }
}

/// [`should_run_stage`] against the build's stored status.
pub fn decide(
    store: &StatusStore,
    build: &str,
    stage: BuildStatus,
    force_restart: bool,
) -> Result<StageDecision> {
    let current = store.get_status(build)?;
    Ok(should_run_stage(stage, current, force_restart))
}
