// Copyright (c) 2025 sbksba
//
// This software is licensed under the terms of the MIT License.
// See the LICENSE file in the project root for the full license text.
use crate::handlers::{self, AppState};
use axum::{
    Router,
    routing::{get, post},
};

/// Creates and configures the application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Tasks of one user
        .route(
            "/api/users/{owner}/tasks",
            post(handlers::create_task).get(handlers::list_tasks),
        )
        .route("/api/users/{owner}/tasks/today", get(handlers::list_today))
        .route(
            "/api/users/{owner}/tasks/by-date/{date}",
            get(handlers::list_by_date),
        )
        .route("/api/users/{owner}/tasks/search", get(handlers::search_tasks))
        // Single task by id; DELETE marks it completed and removes it
        .route(
            "/api/tasks/{id}",
            get(handlers::get_task)
                .patch(handlers::update_task)
                .delete(handlers::complete_task),
        )
        .with_state(state)
}
