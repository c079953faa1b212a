use crate::address::{collection_address, DocumentAddress, LogicalPath};
use crate::context::SyncContext;
use crate::error::StoreError;
use crate::store::{compare_field, merge_value, CollectionEvent, SetOptions, StoredDocument};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const CREATED_AT: &str = "createdAt";
const UPDATED_AT: &str = "updatedAt";

/// Client-side id: `{epoch_millis}-{nanoid(8)}`. Sorts roughly by creation
/// time and does not collide between devices.
pub fn new_entry_id() -> String {
    format!(
        "{}-{}",
        chrono::Utc::now().timestamp_millis(),
        nanoid::nanoid!(8)
    )
}

/// One item of a collection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    #[serde(rename = "createdAt", default)]
    pub created_at: i64,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Entry {
    pub fn from_stored(doc: StoredDocument) -> Self {
        let mut fields = match doc.data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        fields.remove("id");
        let created_at = fields
            .remove(CREATED_AT)
            .and_then(|v| v.as_i64())
            .unwrap_or_default();
        Self {
            id: doc.id,
            created_at,
            fields,
        }
    }

    /// Stored body: the fields plus `createdAt` (the id is the address).
    pub fn to_value(&self) -> Value {
        let mut body = self.fields.clone();
        body.insert(CREATED_AT.to_string(), Value::from(self.created_at));
        Value::Object(body)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CollectionSnapshot {
    pub items: Vec<Entry>,
    pub loading: bool,
}

/// Outcome of a collection mutation. The optimistic part has already been
/// applied when this is returned; `settled` waits for the remote phase.
pub struct Mutation {
    id: String,
    state: MutationState,
}

enum MutationState {
    Settled(bool),
    InFlight(JoinHandle<bool>),
}

impl Mutation {
    fn settled_now(id: String, ok: bool) -> Self {
        Self {
            id,
            state: MutationState::Settled(ok),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// `true` if the remote phase succeeded (or there was none).
    pub async fn settled(self) -> bool {
        match self.state {
            MutationState::Settled(ok) => ok,
            MutationState::InFlight(handle) => handle.await.unwrap_or(false),
        }
    }
}

struct State {
    items: Vec<Entry>,
    loading: bool,
    listener: Option<JoinHandle<()>>,
}

struct Shared {
    ctx: SyncContext,
    path: LogicalPath,
    order_by: Option<String>,
    state: Mutex<State>,
    updates: watch::Sender<CollectionSnapshot>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, state: &State) {
        self.updates.send_replace(CollectionSnapshot {
            items: state.items.clone(),
            loading: state.loading,
        });
    }

    fn sort(&self, items: &mut [Entry]) {
        if let Some(field) = &self.order_by {
            items.sort_by(|a, b| compare_field(&a.to_value(), &b.to_value(), field));
        }
    }

    fn apply_event(&self, event: CollectionEvent) {
        let mut state = self.lock();
        match event {
            Ok(docs) => {
                state.items = docs.into_iter().map(Entry::from_stored).collect();
                state.loading = false;
            }
            Err(e) => {
                tracing::warn!("Subscription to collection {} failed: {}", self.path, e);
                state.loading = false;
            }
        }
        self.publish(&state);
    }

    fn persist_local(&self, items: &[Entry]) {
        match serde_json::to_string(items) {
            Ok(json) => self.ctx.local.set(&self.path.local_key(), json),
            Err(e) => tracing::warn!("Failed to encode {} for local store: {}", self.path, e),
        }
    }

    fn rollback_add(&self, id: &str) {
        let mut state = self.lock();
        state.items.retain(|entry| entry.id != id);
        self.publish(&state);
    }
}

async fn listen(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<CollectionEvent>) {
    while let Some(event) = rx.recv().await {
        shared.apply_event(event);
    }
}

/// Live, optimistic view of one logical collection.
///
/// Must be created inside a Tokio runtime.
pub struct CollectionCache {
    shared: Arc<Shared>,
}

impl CollectionCache {
    pub fn open(ctx: SyncContext, path: LogicalPath, order_by: Option<&str>) -> Self {
        let (updates, _) = watch::channel(CollectionSnapshot {
            items: Vec::new(),
            loading: true,
        });
        let shared = Arc::new(Shared {
            ctx,
            path,
            order_by: order_by.map(str::to_string),
            state: Mutex::new(State {
                items: Vec::new(),
                loading: true,
                listener: None,
            }),
            updates,
        });

        {
            let mut state = shared.lock();
            match &shared.ctx.identity {
                None => {
                    state.items = shared
                        .ctx
                        .local
                        .get(&shared.path.local_key())
                        .and_then(|raw| match serde_json::from_str::<Vec<Entry>>(&raw) {
                            Ok(items) => Some(items),
                            Err(e) => {
                                tracing::warn!("Ignoring unreadable local collection {}: {}", shared.path, e);
                                None
                            }
                        })
                        .unwrap_or_default();
                    state.loading = false;
                }
                Some(identity) => {
                    let address = collection_address(identity, &shared.path);
                    tracing::debug!("Subscribing to collection {} ({})", shared.path, address);
                    let rx = shared
                        .ctx
                        .store
                        .subscribe_collection(&address, shared.order_by.as_deref());
                    state.listener = Some(tokio::spawn(listen(Arc::clone(&shared), rx)));
                }
            }
            shared.publish(&state);
        }

        Self { shared }
    }

    /// Insert a new entry. Rolled back from `items` if the remote write fails.
    pub fn add(&self, data: Value, id: Option<String>) -> Mutation {
        let id = id.unwrap_or_else(new_entry_id);
        let Value::Object(fields) = data else {
            tracing::warn!("Refusing to add non-object entry {} to {}", id, self.shared.path);
            return Mutation::settled_now(id, false);
        };
        let mut entry = Entry {
            id: id.clone(),
            created_at: chrono::Utc::now().timestamp_millis(),
            fields,
        };
        entry.fields.remove("id");

        let remote = {
            let mut state = self.shared.lock();
            state.items.retain(|existing| existing.id != id);
            state.items.push(entry.clone());
            self.shared.sort(&mut state.items);
            self.shared.publish(&state);
            if self.shared.ctx.identity.is_none() {
                self.shared.persist_local(&state.items);
            }
            self.shared.ctx.identity.clone()
        };

        let Some(identity) = remote else {
            return Mutation::settled_now(id, true);
        };
        let shared = Arc::clone(&self.shared);
        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            let result = match collection_address(&identity, &shared.path).document(&task_id) {
                Ok(address) => shared
                    .ctx
                    .store
                    .set(&address, entry.to_value(), SetOptions::merge())
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match result {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!("Failed to add {} to {}, rolling back: {}", task_id, shared.path, e);
                    shared.rollback_add(&task_id);
                    false
                }
            }
        });
        Mutation {
            id,
            state: MutationState::InFlight(handle),
        }
    }

    /// Merge `patch` into an existing entry and stamp `updatedAt`. Not
    /// rolled back on failure; the next snapshot reconciles.
    pub fn update(&self, id: &str, patch: Value) -> Mutation {
        let Value::Object(mut patch) = patch else {
            tracing::warn!("Refusing non-object patch for {} in {}", id, self.shared.path);
            return Mutation::settled_now(id.to_string(), false);
        };
        patch.remove("id");
        patch.insert(
            UPDATED_AT.to_string(),
            Value::from(chrono::Utc::now().timestamp_millis()),
        );

        {
            let mut state = self.shared.lock();
            let Some(entry) = state.items.iter_mut().find(|entry| entry.id == id) else {
                tracing::warn!("No entry {} in {} to update", id, self.shared.path);
                return Mutation::settled_now(id.to_string(), false);
            };
            let mut body = Value::Object(std::mem::take(&mut entry.fields));
            merge_value(&mut body, Value::Object(patch.clone()));
            if let Value::Object(fields) = body {
                entry.fields = fields;
            }
            self.shared.sort(&mut state.items);
            self.shared.publish(&state);
            if self.shared.ctx.identity.is_none() {
                self.shared.persist_local(&state.items);
            }
        }

        self.remote(id, move |shared, address| async move {
            shared
                .ctx
                .store
                .set(&address, Value::Object(patch), SetOptions::merge())
                .await
        })
    }

    /// Drop an entry. Not rolled back on failure.
    pub fn remove(&self, id: &str) -> Mutation {
        {
            let mut state = self.shared.lock();
            state.items.retain(|entry| entry.id != id);
            self.shared.publish(&state);
            if self.shared.ctx.identity.is_none() {
                self.shared.persist_local(&state.items);
            }
        }

        self.remote(id, |shared, address| async move {
            shared.ctx.store.delete(&address).await
        })
    }

    /// Run the remote half of an `update` or `remove`; failures are logged.
    fn remote<F, Fut>(&self, id: &str, op: F) -> Mutation
    where
        F: FnOnce(Arc<Shared>, DocumentAddress) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), StoreError>> + Send + 'static,
    {
        let Some(identity) = self.shared.ctx.identity.clone() else {
            return Mutation::settled_now(id.to_string(), true);
        };
        let address = match collection_address(&identity, &self.shared.path).document(id) {
            Ok(address) => address,
            Err(e) => {
                tracing::warn!("Cannot address {} in {}: {}", id, self.shared.path, e);
                return Mutation::settled_now(id.to_string(), false);
            }
        };
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            let path = shared.path.clone();
            let target = address.to_string();
            match op(shared, address).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!("Remote write to {} ({}) failed: {}", path, target, e);
                    false
                }
            }
        });
        Mutation {
            id: id.to_string(),
            state: MutationState::InFlight(handle),
        }
    }

    pub fn items(&self) -> Vec<Entry> {
        self.shared.lock().items.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.shared.lock().loading
    }

    pub fn path(&self) -> &LogicalPath {
        &self.shared.path
    }

    pub fn snapshot(&self) -> CollectionSnapshot {
        let state = self.shared.lock();
        CollectionSnapshot {
            items: state.items.clone(),
            loading: state.loading,
        }
    }

    pub fn watch(&self) -> watch::Receiver<CollectionSnapshot> {
        self.shared.updates.subscribe()
    }

    /// Cancel the subscription. In-flight mutations still complete.
    pub fn close(&self) {
        if let Some(listener) = self.shared.lock().listener.take() {
            listener.abort();
        }
    }
}

impl Drop for CollectionCache {
    fn drop(&mut self) {
        self.close();
    }
}
