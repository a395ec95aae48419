use anyhow::{Context, Result};
use zfs_rootfs_builder::{Error, Orchestrator};

/// Refuse to act on a build another run may still be driving.
fn ensure_idle(orchestrator: &Orchestrator, name: &str, force: bool) -> Result<()> {
    if force {
        return Ok(());
    }
    if let Some(status) = orchestrator.store().get_status(name)? {
        if status.is_in_progress() {
            return Err(Error::validation(
                "build",
                name,
                format!("status '{}' is in progress; use --force to destroy it", status),
            )
            .into());
        }
    }
    Ok(())
}

pub(crate) fn destroy(orchestrator: &Orchestrator, name: &str, force: bool) -> Result<()> {
    ensure_idle(orchestrator, name, force)?;
    let report = orchestrator
        .clean_artifacts(name)
        .with_context(|| format!("destroying '{}'", name))?;
    println!("{}", report);

    match report.failures.into_iter().next() {
        Some((step, err)) => {
            Err(anyhow::Error::new(err).context(format!("destroying '{}': {}", name, step)))
        }
        None => Ok(()),
    }
}

pub(crate) fn clean(orchestrator: &Orchestrator, name: &str, force: bool) -> Result<()> {
    orchestrator
        .store()
        .clear_status(name, force)
        .with_context(|| format!("cleaning '{}'", name))?;
    orchestrator
        .session()
        .clear_markers(name)
        .with_context(|| format!("clearing markers of '{}'", name))?;
    println!("{}: status, log and markers removed", name);
    Ok(())
}
