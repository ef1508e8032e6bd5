use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tokio::sync::{Mutex, watch};
use tracing::info;

use crate::error::StoreError;
use crate::session::Session;

use super::{
    CREATED_AT_FIELD, Document, Fields, KeyedOp, OWNER_FIELD, RemoteStore, SnapshotReceiver,
    SnapshotResult, TaskQuery, apply_keyed_ops, check_create, check_owner, check_patch,
    failed_listener, merge_fields, new_document_id, server_timestamp, spawn_listener,
};

/// Task documents persisted in SQLite, one JSON blob per row.
///
/// Read-modify-write operations are serialized through `write_lock`, so two
/// field merges (or keyed array edits) on the same task never lose each other.
pub struct SqliteStore {
    db: SqlitePool,
    changes: watch::Sender<u64>,
    write_lock: Mutex<()>,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// Private in-memory database. A single connection that never expires,
    /// since every SQLite connection to `:memory:` is its own database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(db: SqlitePool) -> Result<Self, StoreError> {
        sqlx::migrate!("./migrations").run(&db).await?;
        let (changes, _) = watch::channel(0);
        Ok(Self {
            db,
            changes,
            write_lock: Mutex::new(()),
        })
    }

    fn notify(&self) {
        self.changes.send_modify(|version| *version += 1);
    }

    async fn load_owned(&self, session: &Session, id: &str) -> Result<Fields, StoreError> {
        let row = sqlx::query_as::<_, (String, String)>(
            "SELECT user_id, data FROM tasks WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        let (owner, data) = row.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        check_owner(session, &owner)?;
        parse_fields(&data)
    }

    async fn save_data(&self, id: &str, data: &Fields) -> Result<(), StoreError> {
        let data = serde_json::to_string(data)?;
        sqlx::query("UPDATE tasks SET data = ?1 WHERE id = ?2")
            .bind(data)
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}

fn parse_fields(data: &str) -> Result<Fields, StoreError> {
    match serde_json::from_str::<Value>(data)? {
        Value::Object(fields) => Ok(fields),
        _ => Err(StoreError::InvalidDocument("stored data is not an object".to_string())),
    }
}

async fn fetch_snapshot(db: &SqlitePool, owner: &str) -> SnapshotResult {
    let rows = sqlx::query_as::<_, (String, String)>(
        r#"
        SELECT id, data
        FROM tasks
        WHERE user_id = ?1
        ORDER BY created_at DESC, seq DESC
        "#,
    )
    .bind(owner)
    .fetch_all(db)
    .await?;

    rows.into_iter()
        .map(|(id, data)| {
            Ok(Document {
                id,
                data: parse_fields(&data)?,
            })
        })
        .collect()
}

#[async_trait]
impl RemoteStore for SqliteStore {
    async fn create(&self, session: &Session, mut fields: Fields) -> Result<String, StoreError> {
        check_create(session, &fields)?;

        let id = new_document_id();
        let created_at = server_timestamp(Utc::now());
        fields.insert(CREATED_AT_FIELD.to_string(), json!(created_at));
        let owner = fields
            .get(OWNER_FIELD)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let data = serde_json::to_string(&fields)?;

        sqlx::query(
            r#"
            INSERT INTO tasks (id, user_id, created_at, data)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(&id)
        .bind(&owner)
        .bind(&created_at)
        .bind(data)
        .execute(&self.db)
        .await?;

        info!("stored task document {} for {}", id, owner);
        self.notify();
        Ok(id)
    }

    async fn update(&self, session: &Session, id: &str, fields: Fields) -> Result<(), StoreError> {
        check_patch(&fields)?;
        {
            let _guard = self.write_lock.lock().await;
            let mut data = self.load_owned(session, id).await?;
            merge_fields(&mut data, fields);
            self.save_data(id, &data).await?;
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
        if field == OWNER_FIELD || field == CREATED_AT_FIELD {
            return Err(StoreError::PermissionDenied);
        }
        {
            let _guard = self.write_lock.lock().await;
            let mut data = self.load_owned(session, id).await?;
            apply_keyed_ops(&mut data, field, ops)?;
            self.save_data(id, &data).await?;
        }
        self.notify();
        Ok(())
    }

    async fn delete(&self, session: &Session, id: &str) -> Result<(), StoreError> {
        {
            let _guard = self.write_lock.lock().await;
            self.load_owned(session, id).await?;
            sqlx::query("DELETE FROM tasks WHERE id = ?1")
                .bind(id)
                .execute(&self.db)
                .await?;
        }
        self.notify();
        Ok(())
    }

    fn listen(&self, session: &Session, query: TaskQuery) -> SnapshotReceiver {
        if session.user_id() != &query.owner {
            return failed_listener(StoreError::PermissionDenied);
        }
        let db = self.db.clone();
        let owner = query.owner.as_str().to_string();
        spawn_listener(self.changes.subscribe(), move || {
            let db = db.clone();
            let owner = owner.clone();
            async move { fetch_snapshot(&db, &owner).await }
        })
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("select 1").execute(&self.db).await?;
        Ok(())
    }
}
