use crate::address::{collection_address, document_address, DocumentAddress, LogicalPath};
use crate::error::{Result, SyncError};
use crate::identity::Identity;
use crate::model::{
    DAILY_NOTES, HABITS, JOURNAL_ANSWERS, JOURNAL_LOG, MIGRATION_RECORD, MONTHLY_PLANS,
    SETTINGS, TASKS, TIMER_SETTINGS, YEARLY_PLANS,
};
use crate::store::{RemoteStore, SetOptions, StoredDocument, WriteBatch};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

pub const DEFAULT_LEGACY_CONTAINER: &str = "data";

/// Stored at `meta/migration`. Flipped to `completed` exactly once, in the
/// last batch of a successful migration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    #[serde(default)]
    pub completed: bool,
    #[serde(rename = "completedAt", default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrationStatus {
    NotChecked,
    Running,
    Done,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MigrationReport {
    /// The record was already complete; nothing was read or written.
    pub already_complete: bool,
    pub documents_written: usize,
    pub batches_committed: usize,
    /// Legacy keys with no mapping. Left in place.
    pub unknown_keys: Vec<String>,
}

/// One-shot rewrite of the flat legacy container into the hierarchical
/// layout the caches read.
pub struct MigrationEngine {
    store: Arc<dyn RemoteStore>,
    legacy_container: String,
    status: Mutex<MigrationStatus>,
}

impl MigrationEngine {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self::with_legacy_container(store, DEFAULT_LEGACY_CONTAINER)
    }

    pub fn with_legacy_container(store: Arc<dyn RemoteStore>, legacy_container: &str) -> Self {
        Self {
            store,
            legacy_container: legacy_container.to_string(),
            status: Mutex::new(MigrationStatus::NotChecked),
        }
    }

    pub fn status(&self) -> MigrationStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, status: MigrationStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    fn record_address(identity: &Identity) -> Result<DocumentAddress> {
        Ok(document_address(identity, &LogicalPath::parse(MIGRATION_RECORD)?))
    }

    async fn read_record(&self, identity: &Identity) -> Result<MigrationRecord> {
        let address = Self::record_address(identity)?;
        let record = match self.store.get(&address).await? {
            Some(value) => serde_json::from_value(value).unwrap_or_else(|e| {
                tracing::warn!("Unreadable migration record at {}: {}", address, e);
                MigrationRecord::default()
            }),
            None => MigrationRecord::default(),
        };
        Ok(record)
    }

    /// True if the record is absent or not completed. Never writes.
    pub async fn needs_migration(&self, identity: &Identity) -> Result<bool> {
        let record = self.read_record(identity).await?;
        if record.completed {
            self.set_status(MigrationStatus::Done);
        }
        Ok(!record.completed)
    }

    pub async fn migrate(&self, identity: &Identity) -> Result<MigrationReport> {
        if !self.needs_migration(identity).await? {
            tracing::info!("Migration already complete for {}", identity.id);
            return Ok(MigrationReport {
                already_complete: true,
                ..Default::default()
            });
        }

        self.set_status(MigrationStatus::Running);
        let result = self.run(identity).await;
        self.set_status(match result {
            Ok(_) => MigrationStatus::Done,
            Err(_) => MigrationStatus::NotChecked,
        });
        result
    }

    async fn run(&self, identity: &Identity) -> Result<MigrationReport> {
        let legacy = collection_address(identity, &LogicalPath::parse(&self.legacy_container)?);
        let documents = self.store.get_collection(&legacy).await?;
        tracing::info!("Migrating {} legacy documents from {}", documents.len(), legacy);

        let mut report = MigrationReport::default();
        let mut writes: Vec<(DocumentAddress, Value)> = Vec::new();
        for doc in documents {
            let key = doc.id.clone();
            if !map_legacy(identity, doc, &mut writes)? {
                tracing::warn!("Leaving unknown legacy key {} in place", key);
                report.unknown_keys.push(key);
            }
        }
        report.documents_written = writes.len();

        let record = MigrationRecord {
            completed: true,
            completed_at: Some(chrono::Utc::now().timestamp_millis()),
        };
        let record = serde_json::to_value(record).map_err(|e| SyncError::MigrationFailure(e.to_string()))?;
        writes.push((Self::record_address(identity)?, record));

        // The record is the final operation, so it can only land once every
        // batch before it has been committed.
        let limit = self.store.batch_limit().max(1);
        for chunk in writes.chunks(limit) {
            let mut batch = WriteBatch::new();
            for (address, value) in chunk {
                batch.set(address.clone(), value.clone(), SetOptions::merge());
            }
            self.store
                .commit(batch)
                .await
                .map_err(|e| SyncError::MigrationFailure(e.to_string()))?;
            report.batches_committed += 1;
        }

        tracing::info!(
            "Migration complete for {}: {} documents in {} batches",
            identity.id,
            report.documents_written,
            report.batches_committed
        );
        Ok(report)
    }
}

/// Append the rewrites for one legacy document. Returns `false` for keys
/// with no mapping.
fn map_legacy(
    identity: &Identity,
    doc: StoredDocument,
    writes: &mut Vec<(DocumentAddress, Value)>,
) -> Result<bool> {
    match doc.id.as_str() {
        "tasks" => explode_items(identity, TASKS, &doc.data, writes)?,
        "habits" => explode_items(identity, HABITS, &doc.data, writes)?,
        "dailyNotes" => explode_dated(identity, DAILY_NOTES, doc.data, writes, |value| match value {
            Value::String(content) => Some(json!({ "content": content })),
            Value::Object(_) => Some(value),
            _ => None,
        })?,
        "monthlyPlans" => explode_dated(identity, MONTHLY_PLANS, doc.data, writes, objects_only)?,
        "yearlyPlans" => explode_dated(identity, YEARLY_PLANS, doc.data, writes, objects_only)?,
        "journal" => relocate(identity, JOURNAL_ANSWERS, doc.data, writes)?,
        "log" => relocate(identity, JOURNAL_LOG, doc.data, writes)?,
        "settings" => relocate(identity, SETTINGS, doc.data, writes)?,
        "timerSettings" => relocate(identity, TIMER_SETTINGS, doc.data, writes)?,
        _ => return Ok(false),
    }
    Ok(true)
}

/// `{ items: [..] }` -> one document per element.
fn explode_items(
    identity: &Identity,
    collection: &str,
    data: &Value,
    writes: &mut Vec<(DocumentAddress, Value)>,
) -> Result<()> {
    let target = collection_address(identity, &LogicalPath::parse(collection)?);
    let items = data.get("items").and_then(Value::as_array).cloned().unwrap_or_default();
    for (index, item) in items.into_iter().enumerate() {
        let Value::Object(mut fields) = item else {
            tracing::warn!("Skipping non-object element {} of legacy {}", index, collection);
            continue;
        };
        let id = match fields.remove("id") {
            Some(Value::String(id)) if !id.trim().is_empty() => id,
            Some(Value::Number(id)) => id.to_string(),
            _ => index.to_string(),
        };
        match target.document(&id) {
            Ok(address) => writes.push((address, Value::Object(fields))),
            Err(e) => tracing::warn!("Skipping legacy {} element: {}", collection, e),
        }
    }
    Ok(())
}

/// `{ key: value }` -> one document per key under `collection`.
fn explode_dated(
    identity: &Identity,
    collection: &str,
    data: Value,
    writes: &mut Vec<(DocumentAddress, Value)>,
    shape: impl Fn(Value) -> Option<Value>,
) -> Result<()> {
    let parent = LogicalPath::parse(collection)?;
    let Value::Object(entries) = data else {
        return Ok(());
    };
    for (key, value) in entries {
        let Some(body) = shape(value) else {
            tracing::warn!("Skipping unrecognized legacy {} entry {}", collection, key);
            continue;
        };
        match parent.child(&key) {
            Ok(path) => writes.push((document_address(identity, &path), body)),
            Err(e) => tracing::warn!("Skipping legacy {} entry: {}", collection, e),
        }
    }
    Ok(())
}

fn objects_only(value: Value) -> Option<Value> {
    value.is_object().then_some(value)
}

/// Singleton or already multi-date document moved as a whole.
fn relocate(
    identity: &Identity,
    destination: &str,
    data: Value,
    writes: &mut Vec<(DocumentAddress, Value)>,
) -> Result<()> {
    if data.is_object() {
        writes.push((document_address(identity, &LogicalPath::parse(destination)?), data));
    }
    Ok(())
}
