use thiserror::Error;

/// Failure reported by a remote store call (subscribe, write, read, commit).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("remote store unavailable: {0}")]
    Unavailable(String),
    #[error("batch of {size} operations exceeds the provider limit of {limit}")]
    BatchTooLarge { size: usize, limit: usize },
    #[error("document at {0} is not an object and cannot be merged")]
    NotAnObject(String),
}

#[derive(Debug, Error)]
pub enum SyncError {
    /// An operation that needs an account was invoked without one.
    #[error("no signed-in identity")]
    NotAuthenticated,

    #[error("invalid logical path: {0:?}")]
    InvalidPath(String),

    #[error(transparent)]
    RemoteUnavailable(#[from] StoreError),

    #[error("could not bootstrap backup repository: {0}")]
    RepositoryBootstrapFailed(String),

    /// The branch moved between resolving its head and updating it.
    #[error("branch {branch} moved while committing; re-run the export")]
    RefConflict { branch: String },

    #[error("backup repository error: {0}")]
    Repository(String),

    #[error("migration failed: {0}")]
    MigrationFailure(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Short machine-readable kind, used as the status half of the
    /// status/message pair surfaced to the UI.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::NotAuthenticated => "not_authenticated",
            SyncError::InvalidPath(_) => "invalid_path",
            SyncError::RemoteUnavailable(_) => "remote_unavailable",
            SyncError::RepositoryBootstrapFailed(_) => "repository_bootstrap_failed",
            SyncError::RefConflict { .. } => "ref_conflict",
            SyncError::Repository(_) => "repository_error",
            SyncError::MigrationFailure(_) => "migration_failure",
            SyncError::Config(_) => "config_error",
        }
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
