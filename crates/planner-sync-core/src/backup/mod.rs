//! Export to and import from a git-backed text backup.

pub mod export;
pub mod format;
pub mod github;
pub mod import;
pub mod repository;

pub use export::{ExportOptions, ExportPipeline, ExportReport, ExportStage};
pub use github::GithubRepository;
pub use import::{ImportPipeline, ImportReport};
pub use repository::{BackupRepository, InMemoryRepository};
