use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::models::OnCallWindow;
use crate::services::sensors::{self, SensorReading};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sensors", get(list_sensors))
        .route("/sensors/:key", get(get_sensor))
        .route("/oncall", get(get_on_call))
}

#[derive(Serialize)]
struct SensorsResponse {
    fetched_at: Option<DateTime<Utc>>,
    sensors: Vec<SensorReading>,
}

#[derive(Serialize)]
struct OnCallResponse {
    user_id: String,
    on_call: bool,
    next_on_call_start: Option<DateTime<Utc>>,
    windows: Vec<OnCallWindow>,
}

async fn list_sensors(State(state): State<Arc<AppState>>) -> Json<SensorsResponse> {
    let snapshot = state.poller.current_snapshot();
    Json(SensorsResponse {
        fetched_at: snapshot.fetched_at,
        sensors: sensors::read_sensors(&snapshot, Utc::now()),
    })
}

async fn get_sensor(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> AppResult<Json<SensorReading>> {
    let snapshot = state.poller.current_snapshot();
    sensors::read_sensor(&snapshot, &key, Utc::now())
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("sensor {}", key)))
}

async fn get_on_call(State(state): State<Arc<AppState>>) -> Json<OnCallResponse> {
    let snapshot = state.poller.current_snapshot();
    let now = Utc::now();
    Json(OnCallResponse {
        user_id: snapshot.user_id.clone(),
        on_call: snapshot.is_on_call(now),
        next_on_call_start: snapshot.next_on_call_start(now),
        windows: snapshot.on_calls.clone(),
    })
}
