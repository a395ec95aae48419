use anyhow::{Context, Result};
use zfs_rootfs_builder::status::render_build_table;
use zfs_rootfs_builder::Orchestrator;

pub(crate) fn list(orchestrator: &Orchestrator, json: bool) -> Result<()> {
    let builds = orchestrator
        .store()
        .list_builds()
        .context("listing builds")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&builds)?);
    } else {
        print!("{}", render_build_table(&builds));
    }
    Ok(())
}

pub(crate) fn status(orchestrator: &Orchestrator, name: &str, json: bool) -> Result<()> {
    let report = orchestrator
        .inspect(name)
        .with_context(|| format!("inspecting '{}'", name))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report);
    }
    Ok(())
}

pub(crate) fn history(orchestrator: &Orchestrator, name: &str, tail: Option<usize>) -> Result<()> {
    let history = orchestrator
        .store()
        .history(name, tail)
        .with_context(|| format!("reading history of '{}'", name))?;
    print!("{}", history);
    Ok(())
}
