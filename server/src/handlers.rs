// Copyright (c) 2025 sbksba
//
// This software is licensed under the terms of the MIT License.
// See the LICENSE file in the project root for the full license text.
use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::NaiveDate;
use common::{
    CreateTaskPayload, NewTask, TaskError, TaskField, TaskStatus, TaskView, UpdateTaskPayload,
    format_task_time, normalize_name, parse_task_time,
};
use serde::Deserialize;
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::store::TaskStore;

/// Shared state of the HTTP API.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TaskStore>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub prefix: String,
}

fn views(tasks: Vec<common::Task>) -> Json<Vec<TaskView>> {
    Json(tasks.into_iter().map(TaskView::from).collect())
}

/// Handler for listing every task of a user.
pub async fn list_tasks(
    State(state): State<AppState>,
    Path(owner): Path<i64>,
) -> Result<Json<Vec<TaskView>>, AppError> {
    let tasks = state.store.get_tasks_for_owner(owner, None).await?;
    info!("Retrieved {} tasks for user {}.", tasks.len(), owner);
    Ok(views(tasks))
}

/// Handler for listing today's and overdue tasks of a user.
pub async fn list_today(
    State(state): State<AppState>,
    Path(owner): Path<i64>,
) -> Result<Json<Vec<TaskView>>, AppError> {
    let today = state.clock.now().date();
    let tasks = state.store.get_tasks_for_owner(owner, Some(today)).await?;
    info!("Retrieved {} tasks due by {} for user {}.", tasks.len(), today, owner);
    Ok(views(tasks))
}

/// Handler for listing the tasks of a user on one day.
pub async fn list_by_date(
    State(state): State<AppState>,
    Path((owner, date)): Path<(i64, NaiveDate)>,
) -> Result<Json<Vec<TaskView>>, AppError> {
    let tasks = state.store.get_tasks_by_date(owner, date).await?;
    Ok(views(tasks))
}

/// Handler for searching the tasks of a user by name prefix.
pub async fn search_tasks(
    State(state): State<AppState>,
    Path(owner): Path<i64>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<TaskView>>, AppError> {
    let tasks = state.store.find_by_name_prefix(owner, &params.prefix).await?;
    Ok(views(tasks))
}

/// Handler for creating a new task.
pub async fn create_task(
    State(state): State<AppState>,
    Path(owner): Path<i64>,
    Json(payload): Json<CreateTaskPayload>,
) -> Result<(StatusCode, Json<TaskView>), AppError> {
    debug!("Received request to create task for user: {}", owner);

    let name = normalize_name(&payload.name);
    if name.is_empty() {
        error!("Validation failed: task name is empty.");
        return Err(TaskError::EmptyName.into());
    }
    let scheduled_time = parse_task_time(&payload.time)?;
    let scheduled_date = payload.date.unwrap_or_else(|| state.clock.now().date());

    let id = state
        .store
        .insert(NewTask {
            owner,
            name,
            scheduled_date,
            scheduled_time,
            recurrence: payload.recurrence.unwrap_or_default(),
        })
        .await?;

    let task = state
        .store
        .get_task(id)
        .await?
        .ok_or_else(|| AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "Created task vanished."))?;

    info!("Task created successfully with ID: {}", id);

    // Return a 201 Created status with the new task as JSON.
    Ok((StatusCode::CREATED, Json(task.into())))
}

/// Handler for fetching a single task.
pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> Result<Json<TaskView>, AppError> {
    let task = state
        .store
        .get_task(task_id)
        .await?
        .ok_or_else(|| not_found(task_id))?;
    Ok(Json(task.into()))
}

/// Handler for editing the name, date, time or recurrence of a task.
///
/// Only the fields present in the payload are written, one column at a time,
/// so a concurrent overdue mark on an untouched field is never overwritten.
/// A task rescheduled back into the future is no longer overdue.
pub async fn update_task(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
    Json(payload): Json<UpdateTaskPayload>,
) -> Result<Json<TaskView>, AppError> {
    debug!("Received request to update task {}", task_id);

    let rescheduled = payload.date.is_some() || payload.time.is_some();
    let mut changes = Vec::new();
    if let Some(name) = payload.name {
        changes.push((TaskField::Name, TaskField::Name.canonicalize(&name)?));
    }
    if let Some(date) = payload.date {
        changes.push((TaskField::Date, date.to_string()));
    }
    if let Some(time) = payload.time {
        changes.push((TaskField::Time, format_task_time(parse_task_time(&time)?)));
    }
    if let Some(recurrence) = payload.recurrence {
        changes.push((TaskField::Recurrence, recurrence.as_str().to_string()));
    }

    for (field, value) in &changes {
        if !state.store.update_field(task_id, *field, value).await? {
            return Err(not_found(task_id));
        }
    }

    let mut task = state
        .store
        .get_task(task_id)
        .await?
        .ok_or_else(|| not_found(task_id))?;

    if rescheduled && task.is_overdue() && task.seconds_until(state.clock.now()) >= 0 {
        if !state
            .store
            .update_field(task_id, TaskField::Status, TaskStatus::Pending.as_str())
            .await?
        {
            return Err(not_found(task_id));
        }
        task.status = TaskStatus::Pending;
    }

    info!("Task {} updated ({} fields).", task_id, changes.len());
    Ok(Json(task.into()))
}

/// Handler for completing (permanently deleting) a task.
pub async fn complete_task(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> Result<StatusCode, AppError> {
    debug!("Attempting to complete task with ID: {}", task_id);

    if state.store.delete(task_id).await? {
        info!("Task with ID {} completed.", task_id);
        Ok(StatusCode::NO_CONTENT)
    } else {
        error!("Task with ID {} not found for completion.", task_id);
        Err(not_found(task_id))
    }
}

fn not_found(task_id: i64) -> AppError {
    AppError::new(
        StatusCode::NOT_FOUND,
        &format!("Task with ID {task_id} not found."),
    )
}

// --- Error Handling ---

/// Error returned by every handler, rendered as `{"error": "..."}`.
#[derive(Debug)]
pub struct AppError {
    code: StatusCode,
    message: String,
}

impl AppError {
    fn new(code: StatusCode, message: &str) -> Self {
        Self {
            code,
            message: message.to_string(),
        }
    }
}

/// Validation problems are the caller's fault.
impl From<TaskError> for AppError {
    fn from(err: TaskError) -> Self {
        Self::new(StatusCode::BAD_REQUEST, &err.to_string())
    }
}

/// Store errors are internal, unless they wrap a validation error.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(task_err) = err.downcast_ref::<TaskError>() {
            return task_err.clone().into();
        }
        tracing::error!("Internal server error: {:?}", err);
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "An internal error occurred.",
        )
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::error!(
            "Responding with error: status_code={}, message={}",
            self.code.as_u16(),
            self.message
        );
        (
            self.code,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}
