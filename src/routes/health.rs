use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::services::poller::PollState;
use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
    pub poll_state: PollState,
    pub last_success: Option<String>,
}

/// Liveness plus a coarse view of the poller. `degraded` still answers 200;
/// a rejected token answers 503 since no refresh will ever succeed.
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let poll = state.poller.status().await;

    let (code, status) = if poll.auth_failed {
        (StatusCode::SERVICE_UNAVAILABLE, "unauthorized")
    } else if poll.degraded {
        (StatusCode::OK, "degraded")
    } else {
        (StatusCode::OK, "healthy")
    };

    let response = HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        poll_state: poll.state,
        last_success: poll.last_success.map(|t| t.to_rfc3339()),
    };

    (code, Json(response))
}
