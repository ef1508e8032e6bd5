//! In-process [`RemoteStore`] used by tests.
//!
//! Applies the same access rules and ordering as the SQLite store. Test
//! hooks let callers count attempted writes, take the store offline, and
//! force every open live query to fail.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::watch;

use crate::error::StoreError;
use crate::session::Session;

use super::{
    CREATED_AT_FIELD, Document, Fields, KeyedOp, OWNER_FIELD, RemoteStore, SnapshotReceiver,
    SnapshotResult, TaskQuery, apply_keyed_ops, check_create, check_owner, check_patch,
    failed_listener, merge_fields, new_document_id, server_timestamp, spawn_listener,
};

/// How open live queries fail after [`MemoryStore::break_listeners`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelFault {
    PermissionDenied,
    Unavailable,
}

impl ChannelFault {
    fn into_error(self) -> StoreError {
        match self {
            ChannelFault::PermissionDenied => StoreError::PermissionDenied,
            ChannelFault::Unavailable => {
                StoreError::Unavailable("live query channel closed".to_string())
            }
        }
    }
}

#[derive(Debug, Clone)]
struct StoredDocument {
    seq: u64,
    id: String,
    owner: String,
    created_at: String,
    data: Fields,
}

#[derive(Debug, Default)]
struct Collection {
    docs: Vec<StoredDocument>,
    next_seq: u64,
    fault: Option<ChannelFault>,
}

impl Collection {
    fn find_mut(&mut self, session: &Session, id: &str) -> Result<&mut StoredDocument, StoreError> {
        let doc = self
            .docs
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        check_owner(session, &doc.owner)?;
        Ok(doc)
    }

    fn snapshot(&self, owner: &str) -> SnapshotResult {
        if let Some(fault) = self.fault {
            return Err(fault.into_error());
        }
        let mut docs: Vec<&StoredDocument> =
            self.docs.iter().filter(|d| d.owner == owner).collect();
        docs.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.seq.cmp(&a.seq))
        });
        Ok(docs
            .into_iter()
            .map(|d| Document {
                id: d.id.clone(),
                data: d.data.clone(),
            })
            .collect())
    }
}

pub struct MemoryStore {
    collection: Arc<Mutex<Collection>>,
    changes: watch::Sender<u64>,
    offline: AtomicBool,
    write_attempts: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            collection: Arc::new(Mutex::new(Collection::default())),
            changes,
            offline: AtomicBool::new(false),
            write_attempts: AtomicUsize::new(0),
        }
    }

    /// Number of write calls that reached the store, successful or not.
    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }

    /// While offline every write fails with `Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fails every open live query (and any opened later) with `fault`.
    pub fn break_listeners(&self, fault: ChannelFault) {
        self.collection.lock().fault = Some(fault);
        self.notify();
    }

    pub fn restore_listeners(&self) {
        self.collection.lock().fault = None;
    }

    pub fn len(&self) -> usize {
        self.collection.lock().docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn notify(&self) {
        self.changes.send_modify(|version| *version += 1);
    }

    fn begin_write(&self) -> Result<(), StoreError> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store is offline".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn create(&self, session: &Session, mut fields: Fields) -> Result<String, StoreError> {
        self.begin_write()?;
        check_create(session, &fields)?;

        let id = new_document_id();
        let created_at = server_timestamp(Utc::now());
        fields.insert(CREATED_AT_FIELD.to_string(), json!(created_at));
        let owner = fields
            .get(OWNER_FIELD)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        {
            let mut collection = self.collection.lock();
            let seq = collection.next_seq;
            collection.next_seq += 1;
            collection.docs.push(StoredDocument {
                seq,
                id: id.clone(),
                owner,
                created_at,
                data: fields,
            });
        }
        self.notify();
        Ok(id)
    }

    async fn update(&self, session: &Session, id: &str, fields: Fields) -> Result<(), StoreError> {
        self.begin_write()?;
        check_patch(&fields)?;
        {
            let mut collection = self.collection.lock();
            let doc = collection.find_mut(session, id)?;
            merge_fields(&mut doc.data, fields);
        }
        self.notify();
        Ok(())
    }

    async fn update_keyed(
        &self,
        session: &Session,
        id: &str,
        field: &str,
        ops: Vec<KeyedOp>,
    ) -> Result<(), StoreError> {
        self.begin_write()?;
        if field == OWNER_FIELD || field == CREATED_AT_FIELD {
            return Err(StoreError::PermissionDenied);
        }
        {
            let mut collection = self.collection.lock();
            let doc = collection.find_mut(session, id)?;
            apply_keyed_ops(&mut doc.data, field, ops)?;
        }
        self.notify();
        Ok(())
    }

    async fn delete(&self, session: &Session, id: &str) -> Result<(), StoreError> {
        self.begin_write()?;
        {
            let mut collection = self.collection.lock();
            collection.find_mut(session, id)?;
            collection.docs.retain(|d| d.id != id);
        }
        self.notify();
        Ok(())
    }

    fn listen(&self, session: &Session, query: TaskQuery) -> SnapshotReceiver {
        if session.user_id() != &query.owner {
            return failed_listener(StoreError::PermissionDenied);
        }
        let collection = self.collection.clone();
        let owner = query.owner.as_str().to_string();
        spawn_listener(self.changes.subscribe(), move || {
            std::future::ready(collection.lock().snapshot(&owner))
        })
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store is offline".to_string()));
        }
        Ok(())
    }
}
