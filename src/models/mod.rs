pub mod activity;
pub mod task;

pub use activity::{Activity, ActivityId, NewActivityRequest, UpdateActivityRequest};
pub use task::{NewTaskRequest, NewTaskResponse, Task, TaskId, TaskPatch};
