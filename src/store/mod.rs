//! Remote document store collaborator.
//!
//! The application never owns persistence: it talks to a [`RemoteStore`]
//! that accepts writes scoped by the caller's [`Session`] and pushes full
//! result-set snapshots for live queries. Two implementations live here:
//! [`sqlite::SqliteStore`] for the running service and
//! [`memory::MemoryStore`] for tests.
//!
//! Both apply the same access rules (see [`check_create`], [`check_owner`],
//! [`check_patch`]) so that ownership is enforced by the store, never by
//! the client.

pub mod memory;
pub mod sqlite;

use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;
use crate::session::{Session, UserId};

pub const TASKS_COLLECTION: &str = "tasks";
pub const OWNER_FIELD: &str = "userId";
pub const CREATED_AT_FIELD: &str = "createdAt";
pub const KEY_FIELD: &str = "id";

const SNAPSHOT_BUFFER: usize = 16;

pub type Fields = serde_json::Map<String, Value>;
pub type SnapshotResult = Result<Vec<Document>, StoreError>;
pub type SnapshotReceiver = mpsc::Receiver<SnapshotResult>;

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub data: Fields,
}

/// Live query over the tasks collection, filtered by owner and ordered by
/// `createdAt` descending (ties: most recently inserted first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskQuery {
    pub owner: UserId,
}

impl TaskQuery {
    pub fn owned_by(owner: UserId) -> Self {
        Self { owner }
    }
}

/// Keyed edit of an array field whose elements are objects with an `id`.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyedOp {
    Upsert(Fields),
    Merge { key: String, fields: Fields },
    Remove { key: String },
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn create(&self, session: &Session, fields: Fields) -> Result<String, StoreError>;

    async fn update(&self, session: &Session, id: &str, fields: Fields) -> Result<(), StoreError>;

    /// Applies keyed array operations atomically with respect to other writes.
    async fn update_keyed(
        &self,
        session: &Session,
        id: &str,
        field: &str,
        ops: Vec<KeyedOp>,
    ) -> Result<(), StoreError>;

    async fn delete(&self, session: &Session, id: &str) -> Result<(), StoreError>;

    /// Opens a live query. The first message is the current result set; a
    /// new full snapshot follows every change. An `Err` terminates the channel.
    /// Dropping the receiver closes the query.
    fn listen(&self, session: &Session, query: TaskQuery) -> SnapshotReceiver;

    async fn health_check(&self) -> Result<(), StoreError>;
}

pub fn check_create(session: &Session, fields: &Fields) -> Result<(), StoreError> {
    match fields.get(OWNER_FIELD).and_then(Value::as_str) {
        Some(owner) => check_owner(session, owner),
        None => Err(StoreError::PermissionDenied),
    }
}

pub fn check_owner(session: &Session, owner: &str) -> Result<(), StoreError> {
    if session.user_id().as_str() == owner {
        Ok(())
    } else {
        Err(StoreError::PermissionDenied)
    }
}

/// `userId` and `createdAt` are immutable once written.
pub fn check_patch(fields: &Fields) -> Result<(), StoreError> {
    if fields.contains_key(OWNER_FIELD) || fields.contains_key(CREATED_AT_FIELD) {
        return Err(StoreError::PermissionDenied);
    }
    Ok(())
}

pub fn merge_fields(target: &mut Fields, patch: Fields) {
    for (key, value) in patch {
        target.insert(key, value);
    }
}

pub fn apply_keyed_ops(data: &mut Fields, field: &str, ops: Vec<KeyedOp>) -> Result<(), StoreError> {
    let slot = data
        .entry(field.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if slot.is_null() {
        *slot = Value::Array(Vec::new());
    }
    let items = slot
        .as_array_mut()
        .ok_or_else(|| StoreError::InvalidDocument(format!("{} is not an array", field)))?;

    for op in ops {
        match op {
            KeyedOp::Upsert(element) => {
                let key = element
                    .get(KEY_FIELD)
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        StoreError::InvalidDocument(format!("{} element without id", field))
                    })?
                    .to_string();
                match items.iter_mut().find(|item| element_key(item) == Some(key.as_str())) {
                    Some(existing) => *existing = Value::Object(element),
                    None => items.push(Value::Object(element)),
                }
            }
            KeyedOp::Merge { key, fields } => {
                if let Some(Value::Object(existing)) = items
                    .iter_mut()
                    .find(|item| element_key(item) == Some(key.as_str()))
                {
                    for (k, v) in fields {
                        if k != KEY_FIELD {
                            existing.insert(k, v);
                        }
                    }
                }
            }
            KeyedOp::Remove { key } => {
                items.retain(|item| element_key(item) != Some(key.as_str()));
            }
        }
    }
    Ok(())
}

fn element_key(item: &Value) -> Option<&str> {
    item.get(KEY_FIELD).and_then(Value::as_str)
}

/// Fixed-width RFC 3339 so stored timestamps sort lexicographically.
pub fn server_timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn new_document_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Drives a live query: loads a snapshot, forwards it when it differs from
/// the previous one, then waits for the next change notification.
pub(crate) fn spawn_listener<F, Fut>(mut changes: watch::Receiver<u64>, mut load: F) -> SnapshotReceiver
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = SnapshotResult> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(SNAPSHOT_BUFFER);
    tokio::spawn(async move {
        let mut last: Option<Vec<Document>> = None;
        loop {
            match load().await {
                Ok(docs) => {
                    if last.as_ref() != Some(&docs) {
                        debug!("pushing snapshot with {} documents", docs.len());
                        if tx.send(Ok(docs.clone())).await.is_err() {
                            break;
                        }
                        last = Some(docs);
                    }
                }
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                    break;
                }
            }

            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tx.closed() => break,
            }
        }
        debug!("live query closed");
    });
    rx
}

pub(crate) fn failed_listener(err: StoreError) -> SnapshotReceiver {
    let (tx, rx) = mpsc::channel(1);
    let _ = tx.try_send(Err(err));
    rx
}
