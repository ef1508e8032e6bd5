use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

use crate::models::{ActivityId, Task, TaskId, TaskPatch};
use crate::repository::TaskRepository;
use crate::session::Session;

const NOTICE_BUFFER: usize = 32;

/// Input control that is disabled while its write is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Control {
    Create,
    Update,
    Delete,
    Activity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TitleEdit {
    /// Empty or identical title; nothing was written.
    Unchanged,
    Saved,
    Failed,
}

type ControlKey = (Option<TaskId>, Control);

/// Counts in-flight writes per control. Independent of the live query:
/// a control is re-enabled when its own request finishes, whether or not
/// a snapshot reflecting the write has arrived.
#[derive(Debug, Default)]
pub struct WriteTracker {
    in_flight: Mutex<HashMap<ControlKey, usize>>,
}

impl WriteTracker {
    pub fn begin(self: &Arc<Self>, task: Option<&TaskId>, control: Control) -> WriteGuard {
        let key = (task.cloned(), control);
        *self.in_flight.lock().entry(key.clone()).or_insert(0) += 1;
        WriteGuard {
            tracker: self.clone(),
            key,
        }
    }

    pub fn is_busy(&self, task: Option<&TaskId>, control: Control) -> bool {
        self.in_flight
            .lock()
            .contains_key(&(task.cloned(), control))
    }

    pub fn task_busy(&self, task: &TaskId) -> bool {
        self.in_flight
            .lock()
            .keys()
            .any(|(id, _)| id.as_ref() == Some(task))
    }
}

pub struct WriteGuard {
    tracker: Arc<WriteTracker>,
    key: ControlKey,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        let mut in_flight = self.tracker.in_flight.lock();
        if let Some(count) = in_flight.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                in_flight.remove(&self.key);
            }
        }
    }
}

/// Dashboard handlers. Each one reports success as a `bool` and turns
/// failures into notices; nothing propagates to the caller. No retries.
pub struct TaskActions {
    repo: TaskRepository,
    tracker: Arc<WriteTracker>,
    notices: broadcast::Sender<Notice>,
}

impl TaskActions {
    pub fn new(repo: TaskRepository) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_BUFFER);
        Self {
            repo,
            tracker: Arc::new(WriteTracker::default()),
            notices,
        }
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    pub fn is_busy(&self, task: Option<&TaskId>, control: Control) -> bool {
        self.tracker.is_busy(task, control)
    }

    pub fn controls_disabled(&self, task: &TaskId) -> bool {
        self.tracker.task_busy(task)
    }

    pub async fn add_task(&self, session: Option<&Session>, title: &str) -> bool {
        let title = title.trim();
        if title.is_empty() {
            self.error("Task title cannot be empty.");
            return false;
        }
        let _guard = self.tracker.begin(None, Control::Create);
        match self.repo.create_task(session, title).await {
            Ok(_) => {
                self.success("Task added!");
                true
            }
            Err(err) => {
                warn!("add task failed: {}", err);
                self.error("Failed to add task. Please try again.");
                false
            }
        }
    }

    pub async fn toggle_task(&self, session: Option<&Session>, task: &Task, completed: bool) -> bool {
        let _guard = self.tracker.begin(Some(&task.id), Control::Update);
        match self
            .repo
            .update_task(session, &task.id, TaskPatch::completed(completed))
            .await
        {
            Ok(()) => true,
            Err(err) => {
                warn!("toggle task {} failed: {}", task.id, err);
                self.error("Failed to update task status.");
                false
            }
        }
    }

    pub async fn rename_task(&self, session: Option<&Session>, task: &Task, title: &str) -> TitleEdit {
        let title = title.trim();
        if title.is_empty() || title == task.title {
            return TitleEdit::Unchanged;
        }
        let _guard = self.tracker.begin(Some(&task.id), Control::Update);
        match self
            .repo
            .update_task(session, &task.id, TaskPatch::title(title))
            .await
        {
            Ok(()) => {
                self.success("Task title updated.");
                TitleEdit::Saved
            }
            Err(err) => {
                warn!("rename task {} failed: {}", task.id, err);
                self.error("Failed to update title.");
                TitleEdit::Failed
            }
        }
    }

    pub async fn delete_task(&self, session: Option<&Session>, task: &Task) -> bool {
        let _guard = self.tracker.begin(Some(&task.id), Control::Delete);
        match self.repo.delete_task(session, &task.id).await {
            Ok(()) => {
                self.success("Task deleted.");
                true
            }
            Err(err) => {
                warn!("delete task {} failed: {}", task.id, err);
                self.error("Failed to delete task.");
                false
            }
        }
    }

    pub async fn add_activity(&self, session: Option<&Session>, task: &Task, name: &str) -> bool {
        let name = name.trim();
        if name.is_empty() {
            return false;
        }
        let _guard = self.tracker.begin(Some(&task.id), Control::Activity);
        match self.repo.add_activity(session, &task.id, name).await {
            Ok(_) => {
                self.success("Activity added.");
                true
            }
            Err(err) => {
                warn!("add activity to {} failed: {}", task.id, err);
                self.error("Failed to add activity.");
                false
            }
        }
    }

    pub async fn toggle_activity(
        &self,
        session: Option<&Session>,
        task: &Task,
        activity_id: &ActivityId,
        completed: bool,
    ) -> bool {
        let _guard = self.tracker.begin(Some(&task.id), Control::Activity);
        match self
            .repo
            .set_activity_completed(session, &task.id, activity_id, completed)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                warn!("toggle activity {} failed: {}", activity_id, err);
                self.error("Failed to update activity status.");
                false
            }
        }
    }

    pub async fn delete_activity(
        &self,
        session: Option<&Session>,
        task: &Task,
        activity_id: &ActivityId,
    ) -> bool {
        let _guard = self.tracker.begin(Some(&task.id), Control::Activity);
        match self.repo.remove_activity(session, &task.id, activity_id).await {
            Ok(()) => {
                self.success("Activity deleted.");
                true
            }
            Err(err) => {
                warn!("delete activity {} failed: {}", activity_id, err);
                self.error("Failed to delete activity.");
                false
            }
        }
    }

    fn success(&self, message: &str) {
        self.publish(NoticeLevel::Success, message);
    }

    fn error(&self, message: &str) {
        self.publish(NoticeLevel::Error, message);
    }

    fn publish(&self, level: NoticeLevel, message: &str) {
        // No receivers is fine: notices are transient.
        let _ = self.notices.send(Notice {
            level,
            message: message.to_string(),
        });
    }
}
