use crate::context::DEFAULT_DEBOUNCE;
use crate::error::{Result, SyncError};
use crate::migration::DEFAULT_LEGACY_CONTAINER;
use crate::store::DEFAULT_BATCH_LIMIT;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub debounce_ms: u64,
    pub batch_limit: usize,
    pub legacy_container: String,
    pub store: StoreConfig,
    pub backup: BackupConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE.as_millis() as u64,
            batch_limit: DEFAULT_BATCH_LIMIT,
            legacy_container: DEFAULT_LEGACY_CONTAINER.to_string(),
            store: StoreConfig::default(),
            backup: BackupConfig::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON snapshot backing the development remote store.
    pub snapshot_path: PathBuf,
    /// JSON file backing the signed-out fallback store.
    pub local_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            snapshot_path: PathBuf::from(".planner-sync/store.json"),
            local_path: PathBuf::from(".planner-sync/local.json"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub owner: String,
    pub repo: String,
    /// Discovered from the repository when unset.
    pub branch: Option<String>,
    pub api_base: String,
    /// Name of the environment variable holding the API token.
    pub token_env: String,
    pub private: bool,
    /// File written to bootstrap an empty repository.
    pub seed_path: String,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            owner: String::new(),
            repo: "planner-backup".to_string(),
            branch: None,
            api_base: "https://api.github.com".to_string(),
            token_env: "PLANNER_BACKUP_TOKEN".to_string(),
            private: true,
            seed_path: "README.md".to_string(),
        }
    }
}

impl BackupConfig {
    pub fn token(&self) -> Option<String> {
        std::env::var(&self.token_env).ok().filter(|t| !t.trim().is_empty())
    }
}

impl SyncConfig {
    /// Missing file yields defaults; a malformed one is an error.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(raw) => toml::from_str(&raw)
                .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(SyncError::Config(format!("{}: {}", path.display(), e))),
        }
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SyncError::Config(e.to_string()))?;
        }
        let rendered = toml::to_string_pretty(self).map_err(|e| SyncError::Config(e.to_string()))?;
        std::fs::write(path, rendered).map_err(|e| SyncError::Config(e.to_string()))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.debounce(), Duration::from_millis(900));
        assert_eq!(config.batch_limit, 500);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("planner-sync.toml");
        std::fs::write(&path, "batch_limit = 50\n\n[backup]\nowner = \"me\"\n").unwrap();

        let config = SyncConfig::load_from(&path).unwrap();
        assert_eq!(config.batch_limit, 50);
        assert_eq!(config.backup.owner, "me");
        assert_eq!(config.backup.seed_path, "README.md");
        assert_eq!(config.legacy_container, "data");
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("planner-sync.toml");
        std::fs::write(&path, "batch_limit = \"many\"").unwrap();
        assert!(matches!(SyncConfig::load_from(&path), Err(SyncError::Config(_))));
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/planner-sync.toml");
        let mut config = SyncConfig::default();
        config.backup.branch = Some("backup".into());
        config.debounce_ms = 250;
        config.save_to(&path).unwrap();
        assert_eq!(SyncConfig::load_from(&path).unwrap(), config);
    }
}
