use super::{confirm, App};
use anyhow::{anyhow, Result};
use colored::Colorize;
use planner_sync_core::backup::{ExportOptions, ExportPipeline, ExportStage, GithubRepository, ImportPipeline};
use planner_sync_core::config::BackupConfig;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

fn repository(config: &BackupConfig) -> Result<Arc<GithubRepository>> {
    let token = config
        .token()
        .ok_or_else(|| anyhow!("set {} to an API token for the backup repository", config.token_env))?;
    Ok(Arc::new(GithubRepository::new(config, token)?))
}

/// Print each stage as it is reached. Ends once the pipeline is dropped.
fn spawn_printer(mut progress: watch::Receiver<ExportStage>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let stage = *progress.borrow_and_update();
            println!("{} {}", "·".dimmed(), stage.label());
        }
    })
}

async fn finish_printer(printer: JoinHandle<()>) {
    if let Err(e) = printer.await {
        tracing::debug!("Progress printer ended early: {}", e);
    }
}

pub async fn export(
    app: &App,
    owner: Option<String>,
    repo: Option<String>,
    branch: Option<String>,
) -> Result<()> {
    let identity = app.identity()?;
    let mut config = app.config.backup.clone();
    if let Some(owner) = owner {
        config.owner = owner;
    }
    if let Some(repo) = repo {
        config.repo = repo;
    }
    if branch.is_some() {
        config.branch = branch;
    }

    let pipeline = ExportPipeline::new(app.store.clone(), repository(&config)?, ExportOptions::from(&config));
    let printer = spawn_printer(pipeline.progress());

    let result = pipeline.run(Some(identity)).await;
    drop(pipeline);
    finish_printer(printer).await;

    let report = result?;
    println!(
        "{} {} files to {}/{}@{} ({})",
        "exported".green().bold(),
        report.files,
        config.owner,
        config.repo,
        report.branch,
        &report.commit[..report.commit.len().min(12)]
    );
    if report.created_repository {
        println!("  created repository {}/{}", config.owner, config.repo);
    }
    if report.bootstrapped {
        println!("  seeded empty branch with {}", config.seed_path);
    }
    Ok(())
}

pub async fn import(app: &App, branch: Option<String>, yes: bool) -> Result<()> {
    let identity = app.identity()?;
    let config = &app.config.backup;
    if !yes
        && !confirm(&format!(
            "Merge {}/{} into the data of {}?",
            config.owner, config.repo, identity.id
        ))?
    {
        println!("{}", "aborted".yellow());
        return Ok(());
    }

    let pipeline = ImportPipeline::new(
        app.store.clone(),
        repository(config)?,
        branch.or_else(|| config.branch.clone()),
    );
    let outcome = pipeline.run(Some(identity)).await;
    // Committed batches stay committed even when a later one fails.
    app.persist()?;
    let report = outcome?;
    println!(
        "{} {} files ({} skipped), {} writes in {} batches",
        "imported".green().bold(),
        report.files_parsed,
        report.files_skipped,
        report.operations_written,
        report.batches_committed
    );
    Ok(())
}
