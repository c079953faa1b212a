use anyhow::{bail, Result};
use colored::Colorize;
use planner_sync_core::config::SyncConfig;
use std::path::Path;

pub fn init(path: &Path) -> Result<()> {
    if path.exists() {
        bail!("{} already exists", path.display());
    }
    SyncConfig::default().save_to(path)?;
    println!("{} {}", "Wrote".green(), path.display());
    Ok(())
}
