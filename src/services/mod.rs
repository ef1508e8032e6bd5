pub mod subscription;
pub mod task_actions;

pub use subscription::{SubscriptionManager, SubscriptionState, TaskFeed};
pub use task_actions::{Control, Notice, NoticeLevel, TaskActions, TitleEdit, WriteTracker};
