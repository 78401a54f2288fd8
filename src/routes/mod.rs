use std::sync::Arc;

use axum::{routing::get, Router};

use crate::AppState;

pub mod calendar;
pub mod health;
pub mod sensors;
pub mod snapshot;

/// Read-only HTTP view over the published snapshot and calendar.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Snapshot, poll status, manual refresh, sensor values
        .nest("/api", snapshot::router().merge(sensors::router()))
        // Projected on-call calendar
        .nest("/api/calendar", calendar::router())
        .with_state(state)
}
