use std::sync::Arc;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::models::Snapshot;
use crate::services::poller::{PollStatus, RefreshOutcome};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/snapshot", get(get_snapshot))
        .route("/status", get(get_status))
        .route("/refresh", post(refresh_now))
}

#[derive(Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    status: PollStatus,
    interval_seconds: u64,
    user_id: String,
    services: usize,
    incidents: usize,
}

#[derive(Serialize)]
struct RefreshResponse {
    outcome: RefreshOutcome,
    status: PollStatus,
}

/// The latest published snapshot, as-is. Never triggers a fetch.
async fn get_snapshot(State(state): State<Arc<AppState>>) -> Json<Snapshot> {
    Json(state.poller.current_snapshot().as_ref().clone())
}

async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let snapshot = state.poller.current_snapshot();
    Json(StatusResponse {
        status: state.poller.status().await,
        interval_seconds: state.poller.interval().as_secs(),
        user_id: snapshot.user_id.clone(),
        services: snapshot.services.len(),
        incidents: snapshot.incidents.len(),
    })
}

/// Run one refresh now. Overlaps with a running cycle are reported as skipped.
async fn refresh_now(State(state): State<Arc<AppState>>) -> AppResult<Json<RefreshResponse>> {
    let outcome = state.poller.refresh_once().await;
    let status = state.poller.status().await;

    match outcome {
        RefreshOutcome::Published | RefreshOutcome::Skipped => {
            Ok(Json(RefreshResponse { outcome, status }))
        }
        RefreshOutcome::Failed => Err(AppError::ServiceUnavailable(
            status
                .last_error
                .unwrap_or_else(|| "refresh failed".to_string()),
        )),
        RefreshOutcome::Halted => Err(AppError::Auth(
            status
                .last_error
                .unwrap_or_else(|| "token rejected".to_string()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use crate::routes::{build_router, test_support::send};
    use crate::services::testing::{self, Failure, FakePagerDuty};
    use http::StatusCode;
    use std::sync::Arc;

    fn api() -> Arc<FakePagerDuty> {
        Arc::new(
            FakePagerDuty::new()
                .with_object("users/me", testing::user("U1", &[("T1", "Platform")]))
                .with_collection("services", vec![testing::service("S1", "API", &["T1"])])
                .with_collection(
                    "incidents",
                    vec![testing::incident("I1", "S1", "triggered", "high", "U1")],
                ),
        )
    }

    #[tokio::test]
    async fn snapshot_is_placeholder_before_first_load() {
        let state = testing::app_state(api());
        let (status, body) = send(build_router(state), "GET", "/api/snapshot").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user_id"], "");
        assert!(body["fetched_at"].is_null());
    }

    #[tokio::test]
    async fn snapshot_reflects_published_data() {
        let state = testing::app_state(api());
        state.poller.initialize().await.unwrap();

        let (_, body) = send(build_router(state.clone()), "GET", "/api/snapshot").await;
        assert_eq!(body["user_id"], "U1");
        assert_eq!(body["incidents"][0]["id"], "I1");

        let (_, status) = send(build_router(state), "GET", "/api/status").await;
        assert_eq!(status["state"], "ready");
        assert_eq!(status["incidents"], 1);
        assert_eq!(status["interval_seconds"], 60);
    }

    #[tokio::test]
    async fn refresh_reports_outcome() {
        let fake = api();
        let state = testing::app_state(fake.clone());

        let (status, body) = send(build_router(state.clone()), "POST", "/api/refresh").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "published");

        fake.fail("incidents", Failure::Transient);
        let (status, body) = send(build_router(state.clone()), "POST", "/api/refresh").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["code"], "SERVICE_UNAVAILABLE");
        assert_eq!(state.poller.current_snapshot().incidents.len(), 1);
    }

    #[tokio::test]
    async fn rejected_token_maps_to_bad_gateway() {
        let fake = api();
        fake.fail("users/me", Failure::Auth);
        let state = testing::app_state(fake);

        let (status, body) = send(build_router(state), "POST", "/api/refresh").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"]["code"], "AUTH_ERROR");
    }
}
