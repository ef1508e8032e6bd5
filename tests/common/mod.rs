#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use taskflow::error::StoreError;
use taskflow::services::TaskFeed;
use taskflow::session::Session;
use taskflow::store::memory::MemoryStore;
use taskflow::store::{Fields, KeyedOp, RemoteStore, SnapshotReceiver, TaskQuery};
use tokio::sync::{Notify, mpsc, watch};
use tokio::time::timeout;

/// Where a write pauses until the test calls [`HeldStore::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hold {
    Nothing,
    /// Paused before the write reaches the data; nothing is visible yet.
    BeforeApply,
    /// The data changed (listeners see it) but the ack is withheld.
    BeforeAck,
}

/// Wraps a [`MemoryStore`] so tests decide when writes land, when they are
/// acknowledged, and when snapshots reach listeners.
pub struct HeldStore {
    inner: MemoryStore,
    hold: Mutex<Hold>,
    arrived: Notify,
    release: Notify,
    snapshots_paused: watch::Sender<bool>,
}

impl HeldStore {
    pub fn new() -> Self {
        let (snapshots_paused, _) = watch::channel(false);
        Self {
            inner: MemoryStore::new(),
            hold: Mutex::new(Hold::Nothing),
            arrived: Notify::new(),
            release: Notify::new(),
            snapshots_paused,
        }
    }

    /// Direct access, bypassing holds. Stands in for another client.
    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    pub fn hold_writes(&self, hold: Hold) {
        *self.hold.lock() = hold;
    }

    /// Resolves once a held write reached its pause point.
    pub async fn write_arrived(&self) {
        timeout(Duration::from_secs(2), self.arrived.notified())
            .await
            .expect("held write never arrived");
    }

    pub fn release(&self) {
        self.release.notify_one();
    }

    pub fn pause_snapshots(&self, paused: bool) {
        self.snapshots_paused.send_replace(paused);
    }

    async fn held<T, F>(&self, write: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let hold = *self.hold.lock();
        match hold {
            Hold::Nothing => write.await,
            Hold::BeforeApply => {
                self.arrived.notify_one();
                self.release.notified().await;
                write.await
            }
            Hold::BeforeAck => {
                let result = write.await;
                self.arrived.notify_one();
                self.release.notified().await;
                result
            }
        }
    }
}

#[async_trait]
impl RemoteStore for HeldStore {
    async fn create(&self, session: &Session, fields: Fields) -> Result<String, StoreError> {
        self.held(self.inner.create(session, fields)).await
    }

    async fn update(&self, session: &Session, id: &str, fields: Fields) -> Result<(), StoreError> {
        self.held(self.inner.update(session, id, fields)).await
    }

    async fn update_keyed(
        &self,
        session: &Session,
        id: &str,
        field: &str,
        ops: Vec<KeyedOp>,
    ) -> Result<(), StoreError> {
        self.held(self.inner.update_keyed(session, id, field, ops)).await
    }

    async fn delete(&self, session: &Session, id: &str) -> Result<(), StoreError> {
        self.held(self.inner.delete(session, id)).await
    }

    fn listen(&self, session: &Session, query: TaskQuery) -> SnapshotReceiver {
        let mut upstream = self.inner.listen(session, query);
        let mut paused = self.snapshots_paused.subscribe();
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            while let Some(message) = upstream.recv().await {
                let resumed = paused.wait_for(|paused| !*paused).await.is_ok();
                if !resumed || tx.send(message).await.is_err() {
                    break;
                }
            }
        });
        rx
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.inner.health_check().await
    }
}

pub async fn wait_feed(
    rx: &mut watch::Receiver<TaskFeed>,
    check: impl FnMut(&TaskFeed) -> bool,
) -> TaskFeed {
    timeout(Duration::from_secs(2), rx.wait_for(check))
        .await
        .expect("timed out waiting for feed")
        .expect("feed closed")
        .clone()
}

/// Gives spawned tasks a chance to run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
