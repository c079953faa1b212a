//! planner-sync CLI
//!
//! Drives the sync core against a local snapshot of the document store:
//! - running and checking the one-time schema migration
//! - exporting to and importing from the git backup
//! - reading and writing single documents through the caches

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

mod commands;

use commands::App;

#[derive(Parser)]
#[command(name = "planner-sync")]
#[command(author, version, about = "Planner state sync, migration and backup")]
struct Cli {
    /// Config file (TOML). Missing file means defaults.
    #[arg(long, env = "PLANNER_SYNC_CONFIG", default_value = "planner-sync.toml", global = true)]
    config: PathBuf,

    /// Signed-in user id. Omit to work against the local fallback store.
    #[arg(long, env = "PLANNER_SYNC_USER", global = true)]
    user: Option<String>,

    /// Override `store.snapshot_path`.
    #[arg(long, global = true)]
    snapshot: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a config file with every default filled in.
    InitConfig,

    /// Report whether the legacy layout still has to be migrated.
    CheckMigration,

    /// Rewrite the legacy layout into per-user paths.
    Migrate {
        /// Override `legacy_container`.
        #[arg(long)]
        legacy_container: Option<String>,
    },

    /// Export planner state to the backup repository.
    Export {
        /// Override `backup.owner`.
        #[arg(long)]
        owner: Option<String>,
        /// Override `backup.repo`.
        #[arg(long)]
        repo: Option<String>,
        /// Override `backup.branch`.
        #[arg(long)]
        branch: Option<String>,
    },

    /// Merge the backup repository's files into planner state.
    Import {
        /// Override `backup.branch`.
        #[arg(long)]
        branch: Option<String>,
        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
    },

    /// Print a document, e.g. `planner/daily/2025-01-01`.
    Show { path: String },

    /// Write a JSON value to a document through the debounced cache.
    Set { path: String, value: String },

    /// List a collection, e.g. `tasks`.
    List {
        path: String,
        /// Field to order by.
        #[arg(long)]
        order_by: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "planner_sync=info,planner_sync_core=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::InitConfig = cli.command {
        return commands::config::init(&cli.config);
    }

    let app = App::load(&cli.config, cli.user, cli.snapshot)?;
    let result = match cli.command {
        Commands::InitConfig => Ok(()),
        Commands::CheckMigration => commands::migrate::check(&app).await,
        Commands::Migrate { legacy_container } => commands::migrate::run(&app, legacy_container).await,
        Commands::Export { owner, repo, branch } => commands::backup::export(&app, owner, repo, branch).await,
        Commands::Import { branch, yes } => commands::backup::import(&app, branch, yes).await,
        Commands::Show { path } => commands::docs::show(&app, &path).await,
        Commands::Set { path, value } => commands::docs::set(&app, &path, &value).await,
        Commands::List { path, order_by } => commands::docs::list(&app, &path, order_by.as_deref()).await,
    };

    if let Err(e) = result {
        let kind = e
            .downcast_ref::<planner_sync_core::SyncError>()
            .map(|e| e.kind())
            .unwrap_or("error");
        eprintln!("{} {:#}", format!("[{kind}]").red().bold(), e);
        std::process::exit(1);
    }
    Ok(())
}
