pub mod backup;
pub mod config;
pub mod docs;
pub mod migrate;

use anyhow::{Context, Result};
use planner_sync_core::config::SyncConfig;
use planner_sync_core::identity::require;
use planner_sync_core::local_store::FileLocalStore;
use planner_sync_core::memory_store::MemoryStore;
use planner_sync_core::{Identity, SyncContext};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Loaded config plus the store snapshot every command works against.
pub struct App {
    pub config: SyncConfig,
    pub store: Arc<MemoryStore>,
    pub identity: Option<Identity>,
    snapshot_path: PathBuf,
}

impl App {
    pub fn load(config_path: &Path, user: Option<String>, snapshot: Option<PathBuf>) -> Result<Self> {
        let mut config = SyncConfig::load_from(config_path)?;
        if let Some(snapshot) = snapshot {
            config.store.snapshot_path = snapshot;
        }
        let snapshot_path = config.store.snapshot_path.clone();
        tracing::debug!(
            "Using config {} with store snapshot {}",
            config_path.display(),
            snapshot_path.display()
        );
        let store = MemoryStore::load(&snapshot_path, config.batch_limit)
            .with_context(|| format!("loading store snapshot {}", snapshot_path.display()))?;
        Ok(Self {
            config,
            store: Arc::new(store),
            identity: user.filter(|u| !u.trim().is_empty()).map(Identity::new),
            snapshot_path,
        })
    }

    pub fn identity(&self) -> Result<&Identity> {
        Ok(require(self.identity.as_ref())?)
    }

    pub fn context(&self) -> SyncContext {
        SyncContext::new(
            self.store.clone(),
            Arc::new(FileLocalStore::open(&self.config.store.local_path)),
            self.identity.clone(),
        )
        .with_debounce(self.config.debounce())
    }

    /// Write the store snapshot back after a command changed it.
    pub fn persist(&self) -> Result<()> {
        self.store
            .save(&self.snapshot_path)
            .with_context(|| format!("saving store snapshot {}", self.snapshot_path.display()))
    }
}

pub fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} [y/N] ");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}
