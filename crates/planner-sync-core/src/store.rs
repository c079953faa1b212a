use crate::address::{CollectionAddress, DocumentAddress};
use crate::error::StoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use tokio::sync::mpsc;

/// Per-batch operation limit most hosted document stores enforce.
pub const DEFAULT_BATCH_LIMIT: usize = 500;

/// One document as returned by a collection read or snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub id: String,
    pub data: Value,
}

/// Value pushed to a document subscriber: the document body, `None` when the
/// document does not exist, or the subscription's error channel.
pub type DocumentEvent = Result<Option<Value>, StoreError>;

/// Value pushed to a collection subscriber: the full ordered snapshot.
pub type CollectionEvent = Result<Vec<StoredDocument>, StoreError>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Preserve remote fields absent from the written value.
    pub merge: bool,
}

impl SetOptions {
    pub fn merge() -> Self {
        Self { merge: true }
    }

    pub fn replace() -> Self {
        Self { merge: false }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum BatchOp {
    Set {
        address: DocumentAddress,
        value: Value,
        options: SetOptions,
    },
    Delete {
        address: DocumentAddress,
    },
}

/// Writes that land together or not at all.
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, address: DocumentAddress, value: Value, options: SetOptions) -> &mut Self {
        self.ops.push(BatchOp::Set {
            address,
            value,
            options,
        });
        self
    }

    pub fn delete(&mut self, address: DocumentAddress) -> &mut Self {
        self.ops.push(BatchOp::Delete { address });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Boundary to the hosted real-time document store.
///
/// Subscriptions are plain channels: the first event is the current state,
/// later events follow every change. Dropping the receiver unsubscribes.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    fn subscribe_document(&self, address: &DocumentAddress) -> mpsc::UnboundedReceiver<DocumentEvent>;

    fn subscribe_collection(
        &self,
        address: &CollectionAddress,
        order_by: Option<&str>,
    ) -> mpsc::UnboundedReceiver<CollectionEvent>;

    async fn set(&self, address: &DocumentAddress, value: Value, options: SetOptions) -> Result<(), StoreError>;

    async fn delete(&self, address: &DocumentAddress) -> Result<(), StoreError>;

    async fn get(&self, address: &DocumentAddress) -> Result<Option<Value>, StoreError>;

    async fn get_collection(&self, address: &CollectionAddress) -> Result<Vec<StoredDocument>, StoreError>;

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;

    fn batch_limit(&self) -> usize {
        DEFAULT_BATCH_LIMIT
    }
}

// ---------------------------------------------------------------------------
// Value helpers
// ---------------------------------------------------------------------------

/// Recursive merge of `patch` into `target`: objects merge key by key, any
/// other value replaces what was there.
pub fn merge_value(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(existing), Value::Object(incoming)) => merge_object(existing, incoming),
        (slot, incoming) => *slot = incoming,
    }
}

fn merge_object(existing: &mut Map<String, Value>, incoming: Map<String, Value>) {
    for (key, value) in incoming {
        let nested = value.is_object() && existing.get(&key).is_some_and(Value::is_object);
        match existing.get_mut(&key) {
            Some(slot) if nested => merge_value(slot, value),
            _ => {
                existing.insert(key, value);
            }
        }
    }
}

/// Ordering used by `order_by` subscriptions. Missing fields sort last;
/// numbers compare numerically, everything else by its JSON text.
pub fn compare_field(a: &Value, b: &Value, field: &str) -> Ordering {
    match (a.get(field), b.get(field)) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or_default();
            let y = y.as_f64().unwrap_or_default();
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}
