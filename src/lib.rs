//! Resumable root filesystem builds on ZFS.
//!
//! A build installs an Ubuntu or Debian system into its own dataset tree,
//! boots it in a disposable systemd-nspawn container, provisions it, and
//! snapshots the tree after every stage. Progress is an append-only status
//! file per build, so an interrupted or failed build resumes where it left
//! off.
//!
//! - **Status store** - Append-only per-build status log and history
//! - **Progression** - Which stage may run given the recorded status
//! - **Recovery** - LIFO cleanup and rollback stacks, completion markers
//! - **Drivers** - ZFS datasets and systemd-nspawn containers behind traits
//! - **Orchestrator** - The stage pipeline, teardown and snapshot rollback
//! - **Preflight checks** - Host tool, privilege and pool validation
//!
//! # Architecture
//!
//! ```text
//! zfs-rootfs-builder (binary)
//!     │
//!     └── Orchestrator
//!             ├── StatusStore ──────── status/<build>.status
//!             ├── RecoverySession ──── markers/<build>/<stage>.<op>.done
//!             ├── DatasetDriver ────── zfs / zpool
//!             ├── ContainerDriver ──── systemd-run + systemd-nspawn
//!             └── Provisioner ──────── ansible-playbook, apt-get
//!
//! Every host mutation goes through an Executor, which either performs it
//! or, in dry-run mode, only reports it.
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use zfs_rootfs_builder::{executor_for, BuildOptions, Config, Orchestrator};
//!
//! let config = Config::load(None)?;
//! let orchestrator = Orchestrator::new(config, executor_for(true));
//! let outcome = orchestrator.run("noble-base", &BuildOptions::default())?;
//! println!("would run: {:?}", outcome.ran);
//! ```

pub mod config;
pub mod drivers;
pub mod error;
pub mod install;
pub mod orchestrator;
pub mod preflight;
pub mod process;
pub mod progression;
pub mod provision;
pub mod recovery;
pub mod signals;
pub mod status;
pub mod validate;
pub mod wait;

pub use config::Config;
pub use error::{Error, ExitCode, Result};
pub use orchestrator::{BuildOptions, BuildOutcome, BuildReport, Orchestrator, TeardownReport};
pub use process::{executor_for, Executor, SharedExecutor};
pub use progression::{should_run_stage, StageDecision, STAGES};
pub use recovery::RecoverySession;
pub use status::{BuildStatus, StatusEntry, StatusStore};
