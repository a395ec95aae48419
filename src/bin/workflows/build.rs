use anyhow::{Context, Result};
use zfs_rootfs_builder::{BuildOptions, BuildStatus, Orchestrator};

pub(crate) fn create(
    orchestrator: &Orchestrator,
    name: &str,
    hostname: Option<String>,
    force: bool,
) -> Result<()> {
    let options = BuildOptions {
        hostname,
        force_restart: force,
    };
    let outcome = orchestrator
        .run(name, &options)
        .with_context(|| format!("building '{}'", name))?;

    let verb = if orchestrator.is_dry_run() {
        "would run"
    } else {
        "ran"
    };
    println!(
        "{}: {} {} stage(s), skipped {}",
        name,
        verb,
        outcome.ran.len(),
        outcome.skipped.len()
    );
    if let Some(status) = outcome.final_status {
        println!("{}: status {}", name, status);
    }
    Ok(())
}

pub(crate) fn rollback(orchestrator: &Orchestrator, name: &str, stage: &str) -> Result<()> {
    let stage: BuildStatus = stage.parse()?;
    let snapshots = orchestrator
        .rollback_to_stage(name, stage)
        .with_context(|| format!("rolling '{}' back to {}", name, stage))?;
    for snapshot in &snapshots {
        println!("rolled back {}", snapshot);
    }
    println!("{}: status {}; `create {}` resumes from here", name, stage, name);
    Ok(())
}
