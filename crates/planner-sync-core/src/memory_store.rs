use crate::address::{CollectionAddress, DocumentAddress};
use crate::error::StoreError;
use crate::store::{
    compare_field, merge_value, BatchOp, CollectionEvent, DocumentEvent, RemoteStore, SetOptions,
    StoredDocument, WriteBatch, DEFAULT_BATCH_LIMIT,
};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

struct CollectionSubscriber {
    order_by: Option<String>,
    tx: mpsc::UnboundedSender<CollectionEvent>,
}

/// A single `set` or `delete` call as observed by the store.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedWrite {
    pub address: String,
    /// `None` for deletes.
    pub value: Option<Value>,
}

#[derive(Default, Serialize, Deserialize)]
struct Snapshot {
    documents: BTreeMap<String, Value>,
}

/// In-process real-time document store.
///
/// Serves as the development backend for the CLI (persisted as a JSON
/// snapshot) and as the test double for every cache and pipeline test:
/// it counts writes and commits and can be told to fail writes.
pub struct MemoryStore {
    /// address -> document body
    documents: Mutex<BTreeMap<String, Value>>,
    document_subscribers: DashMap<String, Vec<mpsc::UnboundedSender<DocumentEvent>>>,
    collection_subscribers: DashMap<String, Vec<CollectionSubscriber>>,
    batch_limit: usize,
    fail_writes: AtomicBool,
    commit_count: AtomicUsize,
    writes: Mutex<Vec<RecordedWrite>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_batch_limit(DEFAULT_BATCH_LIMIT)
    }

    pub fn with_batch_limit(batch_limit: usize) -> Self {
        Self {
            documents: Mutex::new(BTreeMap::new()),
            document_subscribers: DashMap::new(),
            collection_subscribers: DashMap::new(),
            batch_limit: batch_limit.max(1),
            fail_writes: AtomicBool::new(false),
            commit_count: AtomicUsize::new(0),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Load a snapshot written by [`MemoryStore::save`]. A missing file yields
    /// an empty store.
    pub fn load(path: &Path, batch_limit: usize) -> anyhow::Result<Self> {
        let store = Self::with_batch_limit(batch_limit);
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            let snapshot: Snapshot = serde_json::from_str(&contents)?;
            tracing::info!(
                "Loaded {} documents from {}",
                snapshot.documents.len(),
                path.display()
            );
            *store.lock_documents() = snapshot.documents;
        }
        Ok(store)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let snapshot = Snapshot {
            documents: self.lock_documents().clone(),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&snapshot)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Make every subsequent write (`set`, `delete`, `commit`) fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of individual `set`/`delete` calls that reached the store.
    pub fn write_count(&self) -> usize {
        self.lock_writes().len()
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.lock_writes().clone()
    }

    pub fn commit_count(&self) -> usize {
        self.commit_count.load(Ordering::SeqCst)
    }

    pub fn document_count(&self) -> usize {
        self.lock_documents().len()
    }

    /// Synchronous read for assertions and CLI display.
    pub fn peek(&self, address: &DocumentAddress) -> Option<Value> {
        self.lock_documents().get(&address.to_string()).cloned()
    }

    fn lock_documents(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Value>> {
        self.documents.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_writes(&self) -> std::sync::MutexGuard<'_, Vec<RecordedWrite>> {
        self.writes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("writes are failing".to_string()))
        } else {
            Ok(())
        }
    }

    fn apply(documents: &mut BTreeMap<String, Value>, op: BatchOp) -> Result<String, StoreError> {
        match op {
            BatchOp::Set {
                address,
                value,
                options,
            } => {
                let key = address.to_string();
                if !value.is_object() {
                    return Err(StoreError::NotAnObject(key));
                }
                match documents.get_mut(&key) {
                    Some(existing) if options.merge => merge_value(existing, value),
                    _ => {
                        documents.insert(key.clone(), value);
                    }
                }
                Ok(key)
            }
            BatchOp::Delete { address } => {
                let key = address.to_string();
                documents.remove(&key);
                Ok(key)
            }
        }
    }

    fn collection_snapshot(
        documents: &BTreeMap<String, Value>,
        collection: &str,
        order_by: Option<&str>,
    ) -> Vec<StoredDocument> {
        let prefix = format!("{}/", collection);
        let mut items: Vec<StoredDocument> = documents
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, _)| !key[prefix.len()..].contains('/'))
            .map(|(key, data)| StoredDocument {
                id: key[prefix.len()..].to_string(),
                data: data.clone(),
            })
            .collect();
        if let Some(field) = order_by {
            items.sort_by(|a, b| compare_field(&a.data, &b.data, field));
        }
        items
    }

    /// Push the current state of every touched document and its collection
    /// to live subscribers, pruning the ones whose receivers are gone.
    fn notify(&self, touched: &[String]) {
        let documents = self.lock_documents().clone();
        for key in touched {
            if let Some(mut subscribers) = self.document_subscribers.get_mut(key) {
                let value = documents.get(key).cloned();
                subscribers.retain(|tx| tx.send(Ok(value.clone())).is_ok());
            }

            let Some((collection, _)) = key.rsplit_once('/') else {
                continue;
            };
            if let Some(mut subscribers) = self.collection_subscribers.get_mut(collection) {
                subscribers.retain(|sub| {
                    let items =
                        Self::collection_snapshot(&documents, collection, sub.order_by.as_deref());
                    sub.tx.send(Ok(items)).is_ok()
                });
            }
        }
    }

    fn record(&self, key: &str, value: Option<Value>) {
        self.lock_writes().push(RecordedWrite {
            address: key.to_string(),
            value,
        });
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn subscribe_document(&self, address: &DocumentAddress) -> mpsc::UnboundedReceiver<DocumentEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let key = address.to_string();
        let current = self.lock_documents().get(&key).cloned();
        if tx.send(Ok(current)).is_ok() {
            self.document_subscribers.entry(key).or_default().push(tx);
        }
        rx
    }

    fn subscribe_collection(
        &self,
        address: &CollectionAddress,
        order_by: Option<&str>,
    ) -> mpsc::UnboundedReceiver<CollectionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let key = address.to_string();
        let items = Self::collection_snapshot(&self.lock_documents(), &key, order_by);
        if tx.send(Ok(items)).is_ok() {
            self.collection_subscribers
                .entry(key)
                .or_default()
                .push(CollectionSubscriber {
                    order_by: order_by.map(str::to_string),
                    tx,
                });
        }
        rx
    }

    async fn set(&self, address: &DocumentAddress, value: Value, options: SetOptions) -> Result<(), StoreError> {
        self.check_writable()?;
        let recorded = value.clone();
        let key = {
            let mut documents = self.lock_documents();
            Self::apply(
                &mut documents,
                BatchOp::Set {
                    address: address.clone(),
                    value,
                    options,
                },
            )?
        };
        self.record(&key, Some(recorded));
        self.notify(&[key]);
        Ok(())
    }

    async fn delete(&self, address: &DocumentAddress) -> Result<(), StoreError> {
        self.check_writable()?;
        let key = {
            let mut documents = self.lock_documents();
            Self::apply(
                &mut documents,
                BatchOp::Delete {
                    address: address.clone(),
                },
            )?
        };
        self.record(&key, None);
        self.notify(&[key]);
        Ok(())
    }

    async fn get(&self, address: &DocumentAddress) -> Result<Option<Value>, StoreError> {
        Ok(self.lock_documents().get(&address.to_string()).cloned())
    }

    async fn get_collection(&self, address: &CollectionAddress) -> Result<Vec<StoredDocument>, StoreError> {
        Ok(Self::collection_snapshot(
            &self.lock_documents(),
            &address.to_string(),
            None,
        ))
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        self.check_writable()?;
        if batch.len() > self.batch_limit {
            return Err(StoreError::BatchTooLarge {
                size: batch.len(),
                limit: self.batch_limit,
            });
        }

        // Apply to a scratch copy so a failing op leaves the store untouched.
        let touched = {
            let mut documents = self.lock_documents();
            let mut staged = documents.clone();
            let mut touched = Vec::with_capacity(batch.len());
            for op in batch.into_ops() {
                touched.push(Self::apply(&mut staged, op)?);
            }
            *documents = staged;
            touched
        };
        self.commit_count.fetch_add(1, Ordering::SeqCst);
        touched.iter().for_each(|key| tracing::debug!("Batch wrote {}", key));
        self.notify(&touched);
        Ok(())
    }

    fn batch_limit(&self) -> usize {
        self.batch_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::resolve_document;
    use crate::identity::Identity;
    use serde_json::json;

    fn addr(raw: &str) -> DocumentAddress {
        resolve_document(&Identity::new("u"), raw).unwrap()
    }

    // === set / get ===

    #[tokio::test]
    async fn merge_set_preserves_existing_fields() {
        let store = MemoryStore::new();
        let a = addr("config/settings");
        store.set(&a, json!({"theme": "dark"}), SetOptions::merge()).await.unwrap();
        store.set(&a, json!({"sound": true}), SetOptions::merge()).await.unwrap();
        assert_eq!(store.get(&a).await.unwrap(), Some(json!({"theme": "dark", "sound": true})));
    }

    #[tokio::test]
    async fn replace_set_drops_existing_fields() {
        let store = MemoryStore::new();
        let a = addr("config/settings");
        store.set(&a, json!({"theme": "dark"}), SetOptions::merge()).await.unwrap();
        store.set(&a, json!({"sound": true}), SetOptions::replace()).await.unwrap();
        assert_eq!(store.get(&a).await.unwrap(), Some(json!({"sound": true})));
    }

    #[tokio::test]
    async fn failing_writes_leave_store_untouched() {
        let store = MemoryStore::new();
        store.fail_writes(true);
        let a = addr("config/settings");
        assert!(store.set(&a, json!({"x": 1}), SetOptions::merge()).await.is_err());
        assert_eq!(store.get(&a).await.unwrap(), None);
        assert_eq!(store.write_count(), 0);
    }

    // === collections ===

    #[tokio::test]
    async fn collection_lists_direct_children_only() {
        let store = MemoryStore::new();
        let user = Identity::new("u");
        let collection = crate::address::resolve_collection(&user, "tasks").unwrap();
        store
            .set(&collection.document("t1").unwrap(), json!({"name": "a"}), SetOptions::merge())
            .await
            .unwrap();
        store
            .set(&addr("tasks/t2/sub/x"), json!({"name": "nested"}), SetOptions::merge())
            .await
            .unwrap();
        let items = store.get_collection(&collection).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "t1");
    }

    #[tokio::test]
    async fn collection_subscription_orders_by_field() {
        let store = MemoryStore::new();
        let user = Identity::new("u");
        let collection = crate::address::resolve_collection(&user, "tasks").unwrap();
        let mut rx = store.subscribe_collection(&collection, Some("createdAt"));
        assert!(rx.recv().await.unwrap().unwrap().is_empty());

        store
            .set(&collection.document("b").unwrap(), json!({"createdAt": 2}), SetOptions::merge())
            .await
            .unwrap();
        let _ = rx.recv().await;
        store
            .set(&collection.document("a").unwrap(), json!({"createdAt": 3}), SetOptions::merge())
            .await
            .unwrap();
        let items = rx.recv().await.unwrap().unwrap();
        let ids: Vec<&str> = items.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    // === subscriptions ===

    #[tokio::test]
    async fn document_subscription_sees_initial_and_updates() {
        let store = MemoryStore::new();
        let a = addr("config/settings");
        let mut rx = store.subscribe_document(&a);
        assert_eq!(rx.recv().await.unwrap().unwrap(), None);
        store.set(&a, json!({"x": 1}), SetOptions::merge()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().unwrap(), Some(json!({"x": 1})));
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let store = MemoryStore::new();
        let a = addr("config/settings");
        drop(store.subscribe_document(&a));
        store.set(&a, json!({"x": 1}), SetOptions::merge()).await.unwrap();
        assert!(store.document_subscribers.get(&a.to_string()).unwrap().is_empty());
    }

    // === batches ===

    #[tokio::test]
    async fn oversized_batch_is_rejected() {
        let store = MemoryStore::with_batch_limit(2);
        let mut batch = WriteBatch::new();
        for i in 0..3 {
            batch.set(addr(&format!("tasks/t{i}")), json!({}), SetOptions::merge());
        }
        let err = store.commit(batch).await.unwrap_err();
        assert_eq!(err, StoreError::BatchTooLarge { size: 3, limit: 2 });
        assert_eq!(store.document_count(), 0);
    }

    #[tokio::test]
    async fn batch_with_invalid_op_applies_nothing() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.set(addr("tasks/ok"), json!({"a": 1}), SetOptions::merge());
        batch.set(addr("tasks/bad"), json!("not an object"), SetOptions::merge());
        assert!(store.commit(batch).await.is_err());
        assert_eq!(store.document_count(), 0);
        assert_eq!(store.commit_count(), 0);
    }

    // === persistence ===

    #[tokio::test]
    async fn snapshot_survives_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = MemoryStore::new();
        store.set(&addr("config/settings"), json!({"x": 1}), SetOptions::merge()).await.unwrap();
        store.save(&path).unwrap();

        let loaded = MemoryStore::load(&path, DEFAULT_BATCH_LIMIT).unwrap();
        assert_eq!(loaded.peek(&addr("config/settings")), Some(json!({"x": 1})));
    }
}
