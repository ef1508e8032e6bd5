//! Derived dashboard state. Nothing here is stored; every value is
//! recomputed from the current task list.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::models::Task;
use crate::services::subscription::{SubscriptionState, TaskFeed};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskFilter {
    #[default]
    All,
    Pending,
    Completed,
}

impl TaskFilter {
    pub const ALL: [TaskFilter; 3] = [TaskFilter::All, TaskFilter::Pending, TaskFilter::Completed];

    pub fn matches(self, task: &Task) -> bool {
        match self {
            TaskFilter::All => true,
            TaskFilter::Pending => !task.completed,
            TaskFilter::Completed => task.completed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskFilter::All => "all",
            TaskFilter::Pending => "pending",
            TaskFilter::Completed => "completed",
        }
    }
}

impl fmt::Display for TaskFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(TaskFilter::All),
            "pending" => Ok(TaskFilter::Pending),
            "completed" => Ok(TaskFilter::Completed),
            other => Err(format!("unknown filter: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub all: usize,
    pub pending: usize,
    pub completed: usize,
}

impl TaskCounts {
    pub fn from_tasks(tasks: &[Task]) -> Self {
        let all = tasks.len();
        let pending = tasks.iter().filter(|t| !t.completed).count();
        Self {
            all,
            pending,
            completed: all - pending,
        }
    }

    pub fn get(&self, filter: TaskFilter) -> usize {
        match filter {
            TaskFilter::All => self.all,
            TaskFilter::Pending => self.pending,
            TaskFilter::Completed => self.completed,
        }
    }
}

/// Tasks passing `filter`, in their existing order.
pub fn filtered_tasks(tasks: &[Task], filter: TaskFilter) -> Vec<&Task> {
    tasks.iter().filter(|t| filter.matches(t)).collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskCard {
    #[serde(flatten)]
    pub task: Task,
    pub progress: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardView {
    pub state: SubscriptionState,
    pub filter: TaskFilter,
    pub counts: TaskCounts,
    pub tasks: Vec<TaskCard>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DashboardView {
    pub fn build(feed: &TaskFeed, filter: TaskFilter) -> Self {
        let tasks = filtered_tasks(&feed.tasks, filter)
            .into_iter()
            .map(|task| TaskCard {
                progress: task.progress(),
                task: task.clone(),
            })
            .collect();

        Self {
            state: feed.state,
            filter,
            counts: TaskCounts::from_tasks(&feed.tasks),
            tasks,
            error: feed.error.clone(),
        }
    }

    /// True once tasks have loaded and none match the filter.
    pub fn is_empty(&self) -> bool {
        self.state == SubscriptionState::Live && self.tasks.is_empty()
    }
}
