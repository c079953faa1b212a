use super::App;
use anyhow::Result;
use colored::Colorize;
use planner_sync_core::MigrationEngine;

fn engine(app: &App, legacy_container: Option<String>) -> MigrationEngine {
    let container = legacy_container.unwrap_or_else(|| app.config.legacy_container.clone());
    MigrationEngine::with_legacy_container(app.store.clone(), &container)
}

pub async fn check(app: &App) -> Result<()> {
    let identity = app.identity()?;
    if engine(app, None).needs_migration(identity).await? {
        println!("{} {} still uses the legacy layout", "pending".yellow(), identity.id);
    } else {
        println!("{} {} is migrated", "done".green(), identity.id);
    }
    Ok(())
}

pub async fn run(app: &App, legacy_container: Option<String>) -> Result<()> {
    let identity = app.identity()?;
    let report = engine(app, legacy_container).migrate(identity).await?;
    if report.already_complete {
        println!("{} nothing to do", "done".green());
        return Ok(());
    }
    app.persist()?;
    println!(
        "{} wrote {} documents in {} batches",
        "migrated".green().bold(),
        report.documents_written,
        report.batches_committed
    );
    for key in &report.unknown_keys {
        println!("  {} left unknown legacy key {}", "!".yellow(), key);
    }
    Ok(())
}
