//! In-process collaborators: a live document collection, a blob store, a
//! fixed auth gate and a view that records what it was told to render.
//!
//! Every type is a cheap handle over shared state, so a test can keep one
//! clone for inspection and hand another to the runtime.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::trace;
use url::Url;
use uuid::Uuid;

use super::{AuthGate, BlobStore, Principal, RemoteFeed, RemoteWriter, Subscription, TableView};
use crate::error::{ErrorCategory, RemoteError, SyncError};
use crate::event::{PanelView, RowView};
use crate::model::{
    DocumentPatch, FieldName, NewRecord, RecordId, RecordPayload, RemoteChange, UserId,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn take_failure(counter: &mut u32) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

// --- Collection ---

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WriteOp {
    Partial,
    Merge,
    Create,
    Delete,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WriteLogEntry {
    pub op: WriteOp,
    pub id: RecordId,
    pub document: Map<String, Value>,
    pub succeeded: bool,
}

#[derive(Default)]
struct CollectionState {
    documents: BTreeMap<RecordId, Map<String, Value>>,
    subscribers: HashMap<u64, mpsc::UnboundedSender<RemoteChange>>,
    next_subscriber: u64,
    fail_partial: u32,
    fail_merge: u32,
    fail_create: u32,
    fail_delete: u32,
    latency: Duration,
    log: Vec<WriteLogEntry>,
}

impl CollectionState {
    fn broadcast(&mut self, change: RemoteChange) {
        self.subscribers
            .retain(|_, sink| sink.send(change.clone()).is_ok());
    }

    /// Merges `document` into the stored one and echoes the full result.
    fn upsert(&mut self, id: &RecordId, document: &Map<String, Value>) {
        let existed = self.documents.contains_key(id);
        let stored = self.documents.entry(id.clone()).or_default();
        for (key, value) in document {
            stored.insert(key.clone(), value.clone());
        }
        let payload = RecordPayload::from_document(stored);
        let change = if existed {
            RemoteChange::modified(id.clone(), payload)
        } else {
            RemoteChange::added(id.clone(), payload)
        };
        self.broadcast(change);
    }

    fn remove(&mut self, id: &RecordId) {
        if self.documents.remove(id).is_some() {
            self.broadcast(RemoteChange::removed(id.clone()));
        }
    }

    fn record(&mut self, op: WriteOp, id: &RecordId, document: Map<String, Value>, succeeded: bool) {
        self.log.push(WriteLogEntry {
            op,
            id: id.clone(),
            document,
            succeeded,
        });
    }
}

/// A live collection with document-store semantics: a partial update of a
/// missing document fails, a merge write upserts, and every mutation is
/// echoed to all subscribers.
#[derive(Clone, Default)]
pub struct InMemoryCollection {
    state: Arc<Mutex<CollectionState>>,
}

impl InMemoryCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_documents<'a>(documents: impl IntoIterator<Item = (&'a str, Value)>) -> Self {
        let collection = Self::new();
        {
            let mut state = lock(&collection.state);
            for (id, doc) in documents {
                if let Value::Object(doc) = doc {
                    state.documents.insert(RecordId::new(id), doc);
                }
            }
        }
        collection
    }

    /// A change made by another client.
    pub fn remote_upsert(&self, id: &str, document: Value) {
        if let Value::Object(doc) = document {
            lock(&self.state).upsert(&RecordId::new(id), &doc);
        }
    }

    pub fn remote_remove(&self, id: &str) {
        lock(&self.state).remove(&RecordId::new(id));
    }

    /// Delivers a raw notification without touching stored documents.
    pub fn push_change(&self, change: RemoteChange) {
        lock(&self.state).broadcast(change);
    }

    pub fn document(&self, id: &RecordId) -> Option<Map<String, Value>> {
        lock(&self.state).documents.get(id).cloned()
    }

    pub fn document_ids(&self) -> Vec<RecordId> {
        lock(&self.state).documents.keys().cloned().collect()
    }

    pub fn writes(&self) -> Vec<WriteLogEntry> {
        lock(&self.state).log.clone()
    }

    pub fn write_count(&self, op: WriteOp) -> usize {
        lock(&self.state).log.iter().filter(|w| w.op == op).count()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.state).subscribers.len()
    }

    pub fn fail_next_partial_updates(&self, n: u32) {
        lock(&self.state).fail_partial = n;
    }

    pub fn fail_next_merge_writes(&self, n: u32) {
        lock(&self.state).fail_merge = n;
    }

    pub fn fail_next_creates(&self, n: u32) {
        lock(&self.state).fail_create = n;
    }

    pub fn fail_next_deletes(&self, n: u32) {
        lock(&self.state).fail_delete = n;
    }

    /// Delay applied before every write takes effect.
    pub fn set_latency(&self, latency: Duration) {
        lock(&self.state).latency = latency;
    }

    async fn simulate_latency(&self) {
        let latency = lock(&self.state).latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl RemoteFeed for InMemoryCollection {
    async fn subscribe(
        &self,
        sink: mpsc::UnboundedSender<RemoteChange>,
    ) -> Result<Subscription, RemoteError> {
        let mut state = lock(&self.state);
        for (id, doc) in &state.documents {
            let change = RemoteChange::added(id.clone(), RecordPayload::from_document(doc));
            if sink.send(change).is_err() {
                return Err(RemoteError::new(ErrorCategory::Unknown, "subscriber gone"));
            }
        }
        let key = state.next_subscriber;
        state.next_subscriber += 1;
        state.subscribers.insert(key, sink);
        trace!(subscriber = key, "feed subscribed");

        let shared = Arc::downgrade(&self.state);
        Ok(Subscription::new(move || {
            if let Some(state) = shared.upgrade() {
                lock(&state).subscribers.remove(&key);
            }
        }))
    }
}

#[async_trait]
impl RemoteWriter for InMemoryCollection {
    async fn partial_update(
        &self,
        id: &RecordId,
        patch: &DocumentPatch,
    ) -> Result<(), RemoteError> {
        self.simulate_latency().await;
        let mut state = lock(&self.state);
        let document = patch.to_document();
        if take_failure(&mut state.fail_partial) {
            state.record(WriteOp::Partial, id, document, false);
            return Err(RemoteError::transient("injected partial update failure"));
        }
        if !state.documents.contains_key(id) {
            state.record(WriteOp::Partial, id, document, false);
            return Err(RemoteError::not_found(format!("no document {id}")));
        }
        state.upsert(id, &document);
        state.record(WriteOp::Partial, id, document, true);
        Ok(())
    }

    async fn merge_write(&self, id: &RecordId, patch: &DocumentPatch) -> Result<(), RemoteError> {
        self.simulate_latency().await;
        let mut state = lock(&self.state);
        let document = patch.to_document();
        if take_failure(&mut state.fail_merge) {
            state.record(WriteOp::Merge, id, document, false);
            return Err(RemoteError::transient("injected merge write failure"));
        }
        state.upsert(id, &document);
        state.record(WriteOp::Merge, id, document, true);
        Ok(())
    }

    async fn create(&self, record: &NewRecord) -> Result<RecordId, RemoteError> {
        self.simulate_latency().await;
        let mut state = lock(&self.state);
        let id = RecordId::new(Uuid::new_v4().simple().to_string());
        let document = record.to_document();
        if take_failure(&mut state.fail_create) {
            state.record(WriteOp::Create, &id, document, false);
            return Err(RemoteError::transient("injected create failure"));
        }
        state.upsert(&id, &document);
        state.record(WriteOp::Create, &id, document, true);
        Ok(id)
    }

    async fn delete(&self, id: &RecordId) -> Result<(), RemoteError> {
        self.simulate_latency().await;
        let mut state = lock(&self.state);
        if take_failure(&mut state.fail_delete) {
            state.record(WriteOp::Delete, id, Map::new(), false);
            return Err(RemoteError::new(ErrorCategory::PermissionDenied, "injected delete failure"));
        }
        state.remove(id);
        state.record(WriteOp::Delete, id, Map::new(), true);
        Ok(())
    }
}

// --- Blobs ---

#[derive(Default)]
struct BlobState {
    objects: BTreeMap<String, (Bytes, String)>,
    fail_upload: u32,
    fail_delete: u32,
}

#[derive(Clone, Default)]
pub struct InMemoryBlobStore {
    state: Arc<Mutex<BlobState>>,
}

impl InMemoryBlobStore {
    const URL_PREFIX: &'static str = "memory://blobs/";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn paths(&self) -> Vec<String> {
        lock(&self.state).objects.keys().cloned().collect()
    }

    pub fn object(&self, path: &str) -> Option<(Bytes, String)> {
        lock(&self.state).objects.get(path).cloned()
    }

    pub fn fail_next_uploads(&self, n: u32) {
        lock(&self.state).fail_upload = n;
    }

    pub fn fail_next_deletes(&self, n: u32) {
        lock(&self.state).fail_delete = n;
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn upload(
        &self,
        path: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<Url, RemoteError> {
        let mut state = lock(&self.state);
        if take_failure(&mut state.fail_upload) {
            return Err(RemoteError::transient("injected upload failure"));
        }
        let url = Url::parse(&format!("{}{path}", Self::URL_PREFIX))
            .map_err(|e| RemoteError::new(ErrorCategory::Unknown, e.to_string()))?;
        state
            .objects
            .insert(path.to_string(), (bytes, content_type.to_string()));
        Ok(url)
    }

    async fn delete(&self, reference: &str) -> Result<(), RemoteError> {
        let mut state = lock(&self.state);
        if take_failure(&mut state.fail_delete) {
            return Err(RemoteError::transient("injected delete failure"));
        }
        let path = reference.strip_prefix(Self::URL_PREFIX).unwrap_or(reference);
        match state.objects.remove(path) {
            Some(_) => Ok(()),
            None => Err(RemoteError::not_found(format!("no object at {path}"))),
        }
    }
}

// --- Auth ---

pub struct StaticAuth {
    principal: Option<Principal>,
    calls: AtomicUsize,
}

impl StaticAuth {
    pub fn signed_in(uid: &str) -> Self {
        Self {
            principal: Some(Principal {
                uid: UserId::new(uid),
            }),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn signed_out() -> Self {
        Self {
            principal: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthGate for StaticAuth {
    async fn ensure_identity(&self) -> Result<Principal, RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.principal
            .clone()
            .ok_or_else(|| RemoteError::new(ErrorCategory::PermissionDenied, "not signed in"))
    }
}

// --- View ---

/// What a [`RecordingView`] currently displays.
#[derive(Clone, Debug, Default)]
pub struct ViewSnapshot {
    pub rows: HashMap<RecordId, RowView>,
    pub order: Vec<RecordId>,
    pub panel: Option<PanelView>,
    pub errors: Vec<SyncError>,
    pub rows_created: usize,
    pub reorders: usize,
}

impl ViewSnapshot {
    pub fn cell(&self, id: &str, field: FieldName) -> Option<&str> {
        self.rows.get(&RecordId::new(id)).map(|r| r.cells.value(field))
    }

    /// Ids of visible rows in display order.
    pub fn visible_order(&self) -> Vec<RecordId> {
        self.order
            .iter()
            .filter(|id| self.rows.get(*id).is_some_and(|r| r.visible))
            .cloned()
            .collect()
    }
}

#[derive(Clone, Default)]
pub struct RecordingView {
    state: Arc<Mutex<ViewSnapshot>>,
}

impl RecordingView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ViewSnapshot {
        lock(&self.state).clone()
    }
}

impl TableView for RecordingView {
    fn render_row(&mut self, row: &RowView) {
        let mut state = lock(&self.state);
        if state.rows.insert(row.id.clone(), row.clone()).is_none() {
            state.rows_created += 1;
            state.order.push(row.id.clone());
        }
    }

    fn remove_row(&mut self, id: &RecordId) {
        let mut state = lock(&self.state);
        state.rows.remove(id);
        state.order.retain(|r| r != id);
    }

    fn reorder(&mut self, ids: &[RecordId]) {
        let mut state = lock(&self.state);
        state.reorders += 1;
        state.order = ids.to_vec();
    }

    fn set_row_visible(&mut self, id: &RecordId, visible: bool) {
        if let Some(row) = lock(&self.state).rows.get_mut(id) {
            row.visible = visible;
        }
    }

    fn render_panel(&mut self, panel: &PanelView) {
        lock(&self.state).panel = Some(panel.clone());
    }

    fn close_panel(&mut self, id: &RecordId) {
        let mut state = lock(&self.state);
        if state.panel.as_ref().is_some_and(|p| &p.record == id) {
            state.panel = None;
        }
    }

    fn report_error(&mut self, error: &SyncError) {
        lock(&self.state).errors.push(error.clone());
    }
}
