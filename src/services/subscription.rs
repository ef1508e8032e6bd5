use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::models::Task;
use crate::repository::{TaskRepository, Unsubscribe};
use crate::session::Session;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    #[default]
    Idle,
    Loading,
    Live,
    /// Live query failed. Stays here until the session changes.
    Errored,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskFeed {
    pub state: SubscriptionState,
    pub tasks: Vec<Task>,
    pub error: Option<String>,
}

#[derive(Default)]
struct Active {
    session: Option<Session>,
    handle: Option<Unsubscribe>,
}

/// Owns the single live task subscription of a signed-in session.
///
/// The previous subscription is always closed before a new one opens, and
/// closed on every exit path (session change, logout, unmount, drop).
pub struct SubscriptionManager {
    repo: TaskRepository,
    feed: Arc<watch::Sender<TaskFeed>>,
    active: Mutex<Active>,
}

impl SubscriptionManager {
    pub fn new(repo: TaskRepository) -> Self {
        let (feed, _) = watch::channel(TaskFeed::default());
        Self {
            repo,
            feed: Arc::new(feed),
            active: Mutex::new(Active::default()),
        }
    }

    pub fn watch(&self) -> watch::Receiver<TaskFeed> {
        self.feed.subscribe()
    }

    pub fn feed(&self) -> TaskFeed {
        self.feed.borrow().clone()
    }

    pub fn state(&self) -> SubscriptionState {
        self.feed.borrow().state
    }

    pub fn session(&self) -> Option<Session> {
        self.active.lock().session.clone()
    }

    /// Reacts to the signed-in user changing. Setting the current session
    /// again does nothing, including from `Errored`.
    pub fn set_session(&self, session: Option<Session>) {
        let mut active = self.active.lock();
        if active.session == session {
            return;
        }
        self.teardown(&mut active);

        let Some(session) = session else {
            return;
        };
        info!("opening task subscription for {}", session.user_id());
        self.feed.send_replace(TaskFeed {
            state: SubscriptionState::Loading,
            ..TaskFeed::default()
        });

        let update_feed = self.feed.clone();
        let error_feed = self.feed.clone();
        let handle = self.repo.subscribe_tasks(
            Some(&session),
            move |tasks| {
                update_feed.send_modify(|feed| {
                    feed.state = SubscriptionState::Live;
                    feed.tasks = tasks;
                    feed.error = None;
                });
            },
            move |err| {
                warn!("task feed errored: {}", err);
                error_feed.send_modify(|feed| {
                    feed.state = SubscriptionState::Errored;
                    feed.error = Some(err.to_string());
                });
            },
        );
        active.session = Some(session);
        active.handle = Some(handle);
    }

    pub fn end_session(&self) {
        self.set_session(None);
    }

    pub fn unmount(&self) {
        let mut active = self.active.lock();
        self.teardown(&mut active);
    }

    fn teardown(&self, active: &mut Active) {
        if let Some(mut handle) = active.handle.take() {
            handle.unsubscribe();
            if let Some(session) = &active.session {
                info!("closed task subscription for {}", session.user_id());
            }
        }
        active.session = None;
        self.feed.send_replace(TaskFeed::default());
    }
}
