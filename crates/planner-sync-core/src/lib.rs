//! Persistent-state synchronization for the planner.
//!
//! Reactive document and collection caches sit over a [`store::RemoteStore`]
//! (or a [`local_store::LocalStore`] when nobody is signed in), a one-time
//! migration moves legacy flat documents into per-user paths, and the
//! [`backup`] pipelines export to and import from a git repository of
//! markdown files.

pub mod address;
pub mod backup;
pub mod collection_cache;
pub mod config;
pub mod context;
pub mod document_cache;
pub mod error;
pub mod identity;
pub mod local_store;
pub mod memory_store;
pub mod migration;
pub mod model;
pub mod registry;
pub mod store;

pub use collection_cache::{CollectionCache, CollectionSnapshot, Entry, Mutation};
pub use context::SyncContext;
pub use document_cache::{DocumentCache, DocumentSnapshot};
pub use error::{Result, StoreError, SyncError};
pub use identity::Identity;
pub use migration::{MigrationEngine, MigrationReport, MigrationStatus};
pub use registry::CacheRegistry;
