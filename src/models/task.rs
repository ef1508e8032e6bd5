use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};

use crate::error::StoreError;
use crate::models::Activity;
use crate::session::UserId;
use crate::store::{CREATED_AT_FIELD, Document, Fields, OWNER_FIELD};

pub const ACTIVITIES_FIELD: &str = "activities";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub completed: bool,
    pub activities: Vec<Activity>,
}

impl Task {
    pub fn completed_activity_count(&self) -> usize {
        self.activities.iter().filter(|a| a.completed).count()
    }

    /// Percentage of completed activities, rounded half up. 0 without activities.
    pub fn progress(&self) -> u8 {
        let total = self.activities.len();
        if total == 0 {
            return 0;
        }
        let done = self.completed_activity_count();
        ((200 * done + total) / (2 * total)) as u8
    }

    /// Fields written for a freshly created task. `createdAt` is stamped by the store.
    pub(crate) fn new_document_fields(title: &str, owner: &UserId) -> Fields {
        let mut fields = Fields::new();
        fields.insert("title".to_string(), json!(title));
        fields.insert(OWNER_FIELD.to_string(), json!(owner.as_str()));
        fields.insert("completed".to_string(), json!(false));
        fields.insert(ACTIVITIES_FIELD.to_string(), json!([]));
        fields
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskFields {
    title: String,
    user_id: UserId,
    created_at: DateTime<Utc>,
    #[serde(default)]
    completed: bool,
    #[serde(default, deserialize_with = "null_as_empty")]
    activities: Vec<Activity>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<Activity>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<Vec<Activity>>::deserialize(deserializer).map(Option::unwrap_or_default)
}

impl TryFrom<Document> for Task {
    type Error = StoreError;

    fn try_from(doc: Document) -> Result<Self, Self::Error> {
        if !doc.data.contains_key(CREATED_AT_FIELD) {
            return Err(StoreError::InvalidDocument(format!(
                "task {} has no {}",
                doc.id, CREATED_AT_FIELD
            )));
        }
        let fields: TaskFields = serde_json::from_value(Value::Object(doc.data))?;
        Ok(Task {
            id: TaskId::new(doc.id),
            title: fields.title,
            user_id: fields.user_id,
            created_at: fields.created_at,
            completed: fields.completed,
            activities: fields.activities,
        })
    }
}

/// Partial update merged into a task document. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activities: Option<Vec<Activity>>,
}

impl TaskPatch {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    pub fn completed(completed: bool) -> Self {
        Self {
            completed: Some(completed),
            ..Self::default()
        }
    }

    /// Whole-sequence replacement. Concurrent replacements are last-write-wins.
    pub fn activities(activities: Vec<Activity>) -> Self {
        Self {
            activities: Some(activities),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.completed.is_none() && self.activities.is_none()
    }

    pub(crate) fn into_fields(self) -> Result<Fields, StoreError> {
        match serde_json::to_value(self)? {
            Value::Object(fields) => Ok(fields),
            other => Err(StoreError::InvalidDocument(format!(
                "patch serialized to {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTaskRequest {
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTaskResponse {
    pub id: TaskId,
}
