use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{AppError, StoreError};
use crate::models::task::ACTIVITIES_FIELD;
use crate::models::{Activity, ActivityId, Task, TaskId, TaskPatch};
use crate::session::{self, Session, UserId};
use crate::store::{Document, Fields, KeyedOp, RemoteStore, SnapshotResult, TaskQuery};

type UpdateFn = Box<dyn FnMut(Vec<Task>) + Send>;
type ErrorFn = Box<dyn FnOnce(AppError) + Send>;

struct Callbacks {
    on_update: UpdateFn,
    on_error: ErrorFn,
}

/// Callbacks of one subscription. They are taken out while one of them runs,
/// so a callback may unsubscribe or drop its own handle.
#[derive(Default)]
struct Slot {
    callbacks: Option<Callbacks>,
    closed: bool,
}

impl Slot {
    fn close(&mut self) {
        self.closed = true;
        self.callbacks = None;
    }
}

type SharedSlot = Arc<ReentrantMutex<RefCell<Slot>>>;

/// Cancels a live task subscription.
///
/// Unsubscribing is synchronous and idempotent: once [`Unsubscribe::unsubscribe`]
/// returns, neither callback runs again. Dropping the handle unsubscribes.
#[must_use = "dropping the handle closes the subscription"]
pub struct Unsubscribe {
    slot: Option<SharedSlot>,
    forwarder: Option<JoinHandle<()>>,
}

impl Unsubscribe {
    pub fn noop() -> Self {
        Self {
            slot: None,
            forwarder: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.slot
            .as_ref()
            .is_some_and(|slot| !slot.lock().borrow().closed)
    }

    pub fn unsubscribe(&mut self) {
        if let Some(slot) = self.slot.take() {
            // Waits for a callback running on another thread.
            slot.lock().borrow_mut().close();
            debug!("task subscription closed");
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Task CRUD and live queries against the remote store, scoped by an
/// explicitly passed session.
#[derive(Clone)]
pub struct TaskRepository {
    store: Arc<dyn RemoteStore>,
}

impl TaskRepository {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self { store }
    }

    pub async fn create_task(
        &self,
        session: Option<&Session>,
        title: &str,
    ) -> Result<TaskId, AppError> {
        let session = session::require(session)?;
        let title = non_empty(title, "Task title cannot be empty")?;

        let fields = Task::new_document_fields(title, session.user_id());
        let id = self
            .store
            .create(session, fields)
            .await
            .map_err(|e| write_failed("create task", e))?;
        info!("task {} created for {}", id, session.user_id());
        Ok(TaskId::new(id))
    }

    /// Opens the live task query for the session's user.
    ///
    /// `on_update` receives the complete ordered task list on every change.
    /// `on_error` runs at most once; the subscription is finished after it.
    /// Without a session `on_error` gets `Unauthenticated` before this
    /// returns, and the returned handle is a no-op.
    pub fn subscribe_tasks<U, E>(
        &self,
        session: Option<&Session>,
        on_update: U,
        on_error: E,
    ) -> Unsubscribe
    where
        U: FnMut(Vec<Task>) + Send + 'static,
        E: FnOnce(AppError) + Send + 'static,
    {
        let session = match session::require(session) {
            Ok(session) => session,
            Err(err) => {
                error!("cannot subscribe to tasks without a signed-in user");
                on_error(err);
                return Unsubscribe::noop();
            }
        };

        let mut snapshots = self
            .store
            .listen(session, TaskQuery::owned_by(session.user_id().clone()));
        let slot: SharedSlot = Arc::new(ReentrantMutex::new(RefCell::new(Slot {
            callbacks: Some(Callbacks {
                on_update: Box::new(on_update),
                on_error: Box::new(on_error),
            }),
            closed: false,
        })));
        let forwarder_slot = slot.clone();
        let user = session.user_id().clone();

        let forwarder = tokio::spawn(async move {
            while let Some(snapshot) = snapshots.recv().await {
                if !deliver(&forwarder_slot, snapshot, &user) {
                    break;
                }
            }
        });

        Unsubscribe {
            slot: Some(slot),
            forwarder: Some(forwarder),
        }
    }

    pub async fn snapshot_tasks(&self, session: Option<&Session>) -> Result<Vec<Task>, AppError> {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let update_tx = tx.clone();
        let mut handle = self.subscribe_tasks(
            session,
            move |tasks| {
                if let Some(tx) = update_tx.lock().take() {
                    let _ = tx.send(Ok(tasks));
                }
            },
            move |err| {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(Err(err));
                }
            },
        );
        let result = rx.await.unwrap_or(Err(AppError::InternalServerError));
        handle.unsubscribe();
        result
    }

    /// Merges `patch` into the task. Ownership is checked by the store.
    pub async fn update_task(
        &self,
        session: Option<&Session>,
        task_id: &TaskId,
        patch: TaskPatch,
    ) -> Result<(), AppError> {
        let session = session::require(session)?;
        let mut patch = patch;
        if let Some(title) = patch.title.take() {
            patch.title = Some(non_empty(&title, "Task title cannot be empty")?.to_string());
        }
        if let Some(activities) = patch.activities.as_deref() {
            let mut seen = HashSet::new();
            for activity in activities {
                non_empty(&activity.name, "Activity name cannot be empty")?;
                let id = non_empty(activity.id.as_str(), "Activity id cannot be empty")?;
                if !seen.insert(id) {
                    return Err(AppError::BadRequest(format!("Duplicate activity id {}", id)));
                }
            }
        }
        if patch.is_empty() {
            debug!("empty patch for task {}, nothing to write", task_id);
            return Ok(());
        }

        let fields = patch.into_fields()?;
        self.store
            .update(session, task_id.as_str(), fields)
            .await
            .map_err(|e| write_failed("update task", e))?;
        info!("task {} updated", task_id);
        Ok(())
    }

    pub async fn delete_task(&self, session: Option<&Session>, task_id: &TaskId) -> Result<(), AppError> {
        let session = session::require(session)?;
        self.store
            .delete(session, task_id.as_str())
            .await
            .map_err(|e| write_failed("delete task", e))?;
        info!("task {} deleted", task_id);
        Ok(())
    }

    pub async fn add_activity(
        &self,
        session: Option<&Session>,
        task_id: &TaskId,
        name: &str,
    ) -> Result<Activity, AppError> {
        let session = session::require(session)?;
        let activity = Activity::new(non_empty(name, "Activity name cannot be empty")?);

        let element = activity_fields(&activity)?;
        self.apply_activity_ops(session, task_id, vec![KeyedOp::Upsert(element)])
            .await?;
        info!("activity {} added to task {}", activity.id, task_id);
        Ok(activity)
    }

    pub async fn set_activity_completed(
        &self,
        session: Option<&Session>,
        task_id: &TaskId,
        activity_id: &ActivityId,
        completed: bool,
    ) -> Result<(), AppError> {
        let session = session::require(session)?;
        let mut fields = Fields::new();
        fields.insert("completed".to_string(), json!(completed));
        self.apply_activity_ops(
            session,
            task_id,
            vec![KeyedOp::Merge {
                key: activity_id.as_str().to_string(),
                fields,
            }],
        )
        .await
    }

    pub async fn remove_activity(
        &self,
        session: Option<&Session>,
        task_id: &TaskId,
        activity_id: &ActivityId,
    ) -> Result<(), AppError> {
        let session = session::require(session)?;
        self.apply_activity_ops(
            session,
            task_id,
            vec![KeyedOp::Remove {
                key: activity_id.as_str().to_string(),
            }],
        )
        .await
    }

    async fn apply_activity_ops(
        &self,
        session: &Session,
        task_id: &TaskId,
        ops: Vec<KeyedOp>,
    ) -> Result<(), AppError> {
        self.store
            .update_keyed(session, task_id.as_str(), ACTIVITIES_FIELD, ops)
            .await
            .map_err(|e| write_failed("update activities", e))
    }
}

/// Hands one channel message to the callbacks. Returns false once the
/// subscription is finished, either closed by the owner or failed.
fn deliver(slot: &ReentrantMutex<RefCell<Slot>>, snapshot: SnapshotResult, user: &UserId) -> bool {
    let guard = slot.lock();
    let Some(mut callbacks) = guard.borrow_mut().callbacks.take() else {
        return false;
    };
    match snapshot {
        Ok(docs) => {
            let tasks = decode_snapshot(docs);
            debug!("snapshot for {}: {} tasks", user, tasks.len());
            (callbacks.on_update)(tasks);
            let mut slot = guard.borrow_mut();
            if slot.closed {
                return false;
            }
            slot.callbacks = Some(callbacks);
            true
        }
        Err(err) => {
            error!("task subscription for {} failed: {}", user, err);
            guard.borrow_mut().close();
            (callbacks.on_error)(AppError::subscription(err));
            false
        }
    }
}

fn non_empty<'a>(value: &'a str, message: &str) -> Result<&'a str, AppError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::BadRequest(message.to_string()));
    }
    Ok(trimmed)
}

fn activity_fields(activity: &Activity) -> Result<Fields, AppError> {
    match serde_json::to_value(activity).map_err(StoreError::from)? {
        Value::Object(fields) => Ok(fields),
        _ => Err(AppError::InternalServerError),
    }
}

fn write_failed(action: &str, err: StoreError) -> AppError {
    error!("failed to {}: {}", action, err);
    AppError::StoreWrite(err)
}

fn decode_snapshot(docs: Vec<Document>) -> Vec<Task> {
    docs.into_iter()
        .filter_map(|doc| {
            let id = doc.id.clone();
            match Task::try_from(doc) {
                Ok(task) => Some(task),
                Err(err) => {
                    warn!("skipping malformed task document {}: {}", id, err);
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::*;
    use crate::store::memory::{ChannelFault, MemoryStore};

    fn setup() -> (Arc<MemoryStore>, TaskRepository) {
        let store = Arc::new(MemoryStore::new());
        let repo = TaskRepository::new(store.clone());
        (store, repo)
    }

    async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for callback")
            .expect("channel closed")
    }

    fn channel_subscription(
        repo: &TaskRepository,
        session: Option<&Session>,
    ) -> (
        Unsubscribe,
        mpsc::UnboundedReceiver<Vec<Task>>,
        mpsc::UnboundedReceiver<AppError>,
    ) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let handle = repo.subscribe_tasks(
            session,
            move |tasks| {
                let _ = update_tx.send(tasks);
            },
            move |err| {
                let _ = error_tx.send(err);
            },
        );
        (handle, update_rx, error_rx)
    }

    #[tokio::test]
    async fn test_operations_require_session() {
        let (store, repo) = setup();
        let id = TaskId::new("a");

        assert!(matches!(repo.create_task(None, "x").await, Err(AppError::Unauthenticated)));
        assert!(matches!(
            repo.update_task(None, &id, TaskPatch::completed(true)).await,
            Err(AppError::Unauthenticated)
        ));
        assert!(matches!(repo.delete_task(None, &id).await, Err(AppError::Unauthenticated)));
        assert!(matches!(
            repo.add_activity(None, &id, "step").await,
            Err(AppError::Unauthenticated)
        ));
        assert_eq!(store.write_attempts(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_without_session_fails_immediately() {
        let (_store, repo) = setup();
        let (handle, _updates, mut errors) = channel_subscription(&repo, None);
        assert!(matches!(errors.try_recv(), Ok(AppError::Unauthenticated)));
        assert!(!handle.is_active());
    }

    #[tokio::test]
    async fn test_created_task_starts_empty() {
        let (_store, repo) = setup();
        let session = Session::new("u1");

        let id = repo.create_task(Some(&session), "  Buy milk ").await.expect("create");
        let tasks = repo.snapshot_tasks(Some(&session)).await.expect("snapshot");

        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, id);
        assert_eq!(tasks[0].title, "Buy milk");
        assert!(!tasks[0].completed);
        assert!(tasks[0].activities.is_empty());
        assert_eq!(tasks[0].user_id.as_str(), "u1");
    }

    #[tokio::test]
    async fn test_empty_title_rejected_without_write() {
        let (store, repo) = setup();
        let session = Session::new("u1");
        assert!(matches!(
            repo.create_task(Some(&session), "   ").await,
            Err(AppError::BadRequest(_))
        ));
        assert_eq!(store.write_attempts(), 0);
    }

    #[tokio::test]
    async fn test_subscription_only_sees_own_tasks() {
        let (_store, repo) = setup();
        let alice = Session::new("alice");
        let bob = Session::new("bob");
        repo.create_task(Some(&alice), "alice task").await.expect("create");
        repo.create_task(Some(&bob), "bob task").await.expect("create");

        let tasks = repo.snapshot_tasks(Some(&bob)).await.expect("snapshot");
        assert_eq!(tasks.len(), 1);
        assert!(tasks.iter().all(|t| t.user_id.as_str() == "bob"));
    }

    #[tokio::test]
    async fn test_toggle_completed_keeps_activities() {
        let (_store, repo) = setup();
        let session = Session::new("u1");
        let id = repo.create_task(Some(&session), "plan").await.expect("create");
        repo.add_activity(Some(&session), &id, "step1").await.expect("add");

        repo.update_task(Some(&session), &id, TaskPatch::completed(true))
            .await
            .expect("toggle");
        let tasks = repo.snapshot_tasks(Some(&session)).await.expect("snapshot");
        assert!(tasks[0].completed);
        assert_eq!(tasks[0].activities.len(), 1);
        assert_eq!(tasks[0].activities[0].name, "step1");

        repo.update_task(Some(&session), &id, TaskPatch::activities(vec![]))
            .await
            .expect("replace activities");
        let tasks = repo.snapshot_tasks(Some(&session)).await.expect("snapshot");
        assert!(tasks[0].completed);
        assert!(tasks[0].activities.is_empty());
    }

    #[tokio::test]
    async fn test_activity_list_needs_unique_ids() {
        let (store, repo) = setup();
        let session = Session::new("u1");
        let id = repo.create_task(Some(&session), "plan").await.expect("create");
        let writes = store.write_attempts();

        let one = Activity {
            id: ActivityId::new("x"),
            name: "one".to_string(),
            completed: false,
        };
        let two = Activity {
            name: "two".to_string(),
            ..one.clone()
        };
        let result = repo
            .update_task(Some(&session), &id, TaskPatch::activities(vec![one.clone(), two]))
            .await;
        assert!(matches!(result, Err(AppError::BadRequest(_))));

        let blank = Activity {
            id: ActivityId::new("  "),
            ..one.clone()
        };
        let result = repo
            .update_task(Some(&session), &id, TaskPatch::activities(vec![blank]))
            .await;
        assert!(matches!(result, Err(AppError::BadRequest(_))));
        assert_eq!(store.write_attempts(), writes);

        repo.update_task(Some(&session), &id, TaskPatch::activities(vec![one]))
            .await
            .expect("unique ids");
        repo.set_activity_completed(Some(&session), &id, &ActivityId::new("x"), true)
            .await
            .expect("toggle");
        let task = repo.snapshot_tasks(Some(&session)).await.expect("snapshot").remove(0);
        assert_eq!(task.progress(), 100);
    }

    #[tokio::test]
    async fn test_activity_operations() {
        let (_store, repo) = setup();
        let session = Session::new("u1");
        let id = repo.create_task(Some(&session), "plan").await.expect("create");

        let first = repo.add_activity(Some(&session), &id, "step1").await.expect("add");
        let second = repo.add_activity(Some(&session), &id, "step2").await.expect("add");
        repo.set_activity_completed(Some(&session), &id, &first.id, true)
            .await
            .expect("toggle");

        let task = repo.snapshot_tasks(Some(&session)).await.expect("snapshot").remove(0);
        assert_eq!(task.activities.len(), 2);
        assert_eq!(task.activities[0].id, first.id);
        assert!(task.activities[0].completed);
        assert_eq!(task.progress(), 50);

        repo.remove_activity(Some(&session), &id, &first.id).await.expect("remove");
        let task = repo.snapshot_tasks(Some(&session)).await.expect("snapshot").remove(0);
        assert_eq!(task.activities, vec![second]);
    }

    #[tokio::test]
    async fn test_write_rejected_by_store() {
        let (store, repo) = setup();
        let alice = Session::new("alice");
        let bob = Session::new("bob");
        let id = repo.create_task(Some(&alice), "mine").await.expect("create");

        let result = repo.delete_task(Some(&bob), &id).await;
        assert!(matches!(result, Err(AppError::StoreWrite(StoreError::PermissionDenied))));

        store.set_offline(true);
        let result = repo.update_task(Some(&alice), &id, TaskPatch::title("new")).await;
        assert!(matches!(result, Err(AppError::StoreWrite(StoreError::Unavailable(_)))));
    }

    #[tokio::test]
    async fn test_updates_are_full_snapshots() {
        let (_store, repo) = setup();
        let session = Session::new("u1");
        let (_handle, mut updates, _errors) = channel_subscription(&repo, Some(&session));
        assert!(next(&mut updates).await.is_empty());

        repo.create_task(Some(&session), "one").await.expect("create");
        assert_eq!(next(&mut updates).await.len(), 1);

        repo.create_task(Some(&session), "two").await.expect("create");
        let tasks = next(&mut updates).await;
        let titles: Vec<&str> = tasks.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["two", "one"]);
    }

    #[tokio::test]
    async fn test_channel_error_terminates_subscription() {
        let (store, repo) = setup();
        let session = Session::new("u1");
        let (handle, mut updates, mut errors) = channel_subscription(&repo, Some(&session));
        next(&mut updates).await;

        store.break_listeners(ChannelFault::PermissionDenied);
        let err = next(&mut errors).await;
        assert!(matches!(
            err,
            AppError::Subscription { source: StoreError::PermissionDenied, .. }
        ));
        assert!(!handle.is_active());

        store.restore_listeners();
        repo.create_task(Some(&session), "after").await.expect("create");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_twice_is_quiet() {
        let (_store, repo) = setup();
        let session = Session::new("u1");
        let (mut handle, mut updates, mut errors) = channel_subscription(&repo, Some(&session));
        next(&mut updates).await;

        handle.unsubscribe();
        handle.unsubscribe();
        assert!(!handle.is_active());

        repo.create_task(Some(&session), "later").await.expect("create");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(updates.try_recv().is_err());
        assert!(errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_callback_can_drop_its_own_handle() {
        let (_store, repo) = setup();
        let session = Session::new("u1");
        let own_handle: Arc<Mutex<Option<Unsubscribe>>> = Arc::new(Mutex::new(None));
        let (update_tx, mut updates) = mpsc::unbounded_channel();

        let in_callback = own_handle.clone();
        let handle = repo.subscribe_tasks(
            Some(&session),
            move |tasks: Vec<Task>| {
                let _ = update_tx.send(tasks.len());
                in_callback.lock().take();
            },
            |err| panic!("unexpected subscription error: {err}"),
        );
        *own_handle.lock() = Some(handle);

        assert_eq!(next(&mut updates).await, 0);
        assert!(own_handle.lock().is_none());

        repo.create_task(Some(&session), "later").await.expect("create");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(updates.try_recv().is_err());
    }
}
