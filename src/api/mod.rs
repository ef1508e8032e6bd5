use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::extract::{FromRequestParts, Path, Query};
use axum::http::request::Parts;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{patch, post};
use axum::{Router, extract::State, http::StatusCode, routing::get};
use serde::Deserialize;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::{Stream, StreamExt};
use tracing::debug;

use crate::error::AppError;
use crate::models::*;
use crate::services::{SubscriptionManager, SubscriptionState, TaskFeed};
use crate::session::Session;
use crate::state::AppState;
use crate::view::{DashboardView, TaskFilter};

/// Set by the authenticating proxy in front of the service.
pub const USER_HEADER: &str = "x-user-id";

/// Session taken from [`USER_HEADER`]; `None` when absent or blank.
pub struct CurrentSession(pub Option<Session>);

impl<S> FromRequestParts<S> for CurrentSession
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let session = parts
            .headers
            .get(USER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(Session::new);
        Ok(Self(session))
    }
}

#[derive(Deserialize)]
struct FilterParams {
    #[serde(default)]
    filter: TaskFilter,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/stream", get(stream_tasks))
        .route("/tasks/{id}", patch(update_task).delete(delete_task))
        .route("/tasks/{id}/activities", post(add_activity))
        .route(
            "/tasks/{id}/activities/{activity_id}",
            patch(update_activity).delete(delete_activity),
        )
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Result<StatusCode, AppError> {
    state.store.health_check().await?;
    Ok(StatusCode::OK)
}

async fn list_tasks(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Query(params): Query<FilterParams>,
) -> Result<Json<DashboardView>, AppError> {
    let tasks = state.repo.snapshot_tasks(session.as_ref()).await?;
    let feed = TaskFeed {
        state: SubscriptionState::Live,
        tasks,
        error: None,
    };
    Ok(Json(DashboardView::build(&feed, params.filter)))
}

async fn stream_tasks(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Query(params): Query<FilterParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let session = session.ok_or(AppError::Unauthenticated)?;
    debug!("dashboard stream opened for {}", session.user_id());

    let manager = Arc::new(SubscriptionManager::new(state.repo.clone()));
    manager.set_session(Some(session));
    let filter = params.filter;

    let stream = WatchStream::new(manager.watch()).map(move |feed| {
        // The subscription lives exactly as long as this stream.
        let _manager = &manager;
        let view = DashboardView::build(&feed, filter);
        Ok(Event::default()
            .event("dashboard")
            .json_data(&view)
            .unwrap_or_else(|e| Event::default().event("error").data(e.to_string())))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn create_task(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Json(req): Json<NewTaskRequest>,
) -> Result<(StatusCode, Json<NewTaskResponse>), AppError> {
    let id = state.repo.create_task(session.as_ref(), &req.title).await?;
    Ok((StatusCode::CREATED, Json(NewTaskResponse { id })))
}

async fn update_task(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Path(id): Path<String>,
    Json(patch): Json<TaskPatch>,
) -> Result<StatusCode, AppError> {
    state
        .repo
        .update_task(session.as_ref(), &TaskId::new(id), patch)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_task(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.repo.delete_task(session.as_ref(), &TaskId::new(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn add_activity(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Path(id): Path<String>,
    Json(req): Json<NewActivityRequest>,
) -> Result<(StatusCode, Json<Activity>), AppError> {
    let activity = state
        .repo
        .add_activity(session.as_ref(), &TaskId::new(id), &req.name)
        .await?;
    Ok((StatusCode::CREATED, Json(activity)))
}

async fn update_activity(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Path((id, activity_id)): Path<(String, String)>,
    Json(req): Json<UpdateActivityRequest>,
) -> Result<StatusCode, AppError> {
    state
        .repo
        .set_activity_completed(
            session.as_ref(),
            &TaskId::new(id),
            &ActivityId::new(activity_id),
            req.completed,
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_activity(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Path((id, activity_id)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    state
        .repo
        .remove_activity(session.as_ref(), &TaskId::new(id), &ActivityId::new(activity_id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
