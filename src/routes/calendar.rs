use std::sync::Arc;

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::models::CalendarEvent;
use crate::services::aggregator::window_end;
use crate::services::sensors::{calendar_descriptor, CalendarDescriptor};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_events))
        .route("/next", get(next_event))
}

#[derive(Debug, Deserialize)]
struct RangeQuery {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct EventsResponse {
    calendar: CalendarDescriptor,
    /// Held events were served because projecting the range failed.
    stale: bool,
    events: Vec<CalendarEvent>,
}

#[derive(Serialize)]
struct NextEventResponse {
    calendar: CalendarDescriptor,
    event: Option<CalendarEvent>,
}

/// Project the requested range (default: now .. now + look-ahead) from the
/// current snapshot. The held events belong to the background projection and
/// are only read here, as the fallback when upstream fails.
async fn list_events(
    State(state): State<Arc<AppState>>,
    Query(range): Query<RangeQuery>,
) -> AppResult<Json<EventsResponse>> {
    let start = range.start.unwrap_or_else(Utc::now);
    let end = match range.end {
        Some(end) => end,
        None => window_end(start, state.config.poll.horizon())
            .map_err(|_| AppError::BadRequest("start is out of range".to_string()))?,
    };
    if end < start {
        return Err(AppError::BadRequest(
            "end must not be before start".to_string(),
        ));
    }

    let snapshot = state.poller.current_snapshot();
    let calendar = calendar_descriptor(&snapshot);

    if snapshot.is_placeholder() {
        return Ok(Json(EventsResponse {
            calendar,
            stale: true,
            events: state.calendar.events_between(start, end).await,
        }));
    }

    match state.calendar.fetch_events(&snapshot, start, end).await {
        Ok(events) => Ok(Json(EventsResponse {
            calendar,
            stale: false,
            events,
        })),
        Err(e) if e.is_auth() => Err(e),
        Err(e) => {
            tracing::warn!("Serving held calendar events; projection failed: {}", e);
            Ok(Json(EventsResponse {
                calendar,
                stale: true,
                events: state.calendar.events_between(start, end).await,
            }))
        }
    }
}

async fn next_event(State(state): State<Arc<AppState>>) -> Json<NextEventResponse> {
    let snapshot = state.poller.current_snapshot();
    Json(NextEventResponse {
        calendar: calendar_descriptor(&snapshot),
        event: state.calendar.next_event(Utc::now()).await,
    })
}

#[cfg(test)]
mod tests {
    use crate::routes::{build_router, test_support::send};
    use crate::services::testing::{self, Failure, FakePagerDuty};
    use chrono::{Duration, Utc};
    use http::StatusCode;
    use std::sync::Arc;

    fn api() -> Arc<FakePagerDuty> {
        let now = Utc::now();
        let start = (now + Duration::hours(2)).format("%Y-%m-%dT%H:%M:%SZ").to_string();
        let end = (now + Duration::hours(10)).format("%Y-%m-%dT%H:%M:%SZ").to_string();
        Arc::new(
            FakePagerDuty::new()
                .with_object("users/me", testing::user("U1", &[]))
                .with_collection("oncalls", vec![testing::on_call("SCH1", None, None)])
                .with_object(
                    "schedules/SCH1",
                    testing::rendered_schedule(
                        "SCH1",
                        "Primary",
                        vec![
                            testing::entry(Some("E1"), "U1", &start, &end),
                            testing::entry(Some("E2"), "U2", &start, &end),
                        ],
                    ),
                ),
        )
    }

    /// What the background worker does after each publish.
    async fn project_upcoming(state: &crate::AppState) {
        let now = Utc::now();
        state
            .calendar
            .project(&state.poller.current_snapshot(), now, now + Duration::days(14))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn lists_projected_events() {
        let state = testing::app_state(api());
        state.poller.initialize().await.unwrap();

        let (status, body) = send(build_router(state), "GET", "/api/calendar").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stale"], false);
        assert_eq!(body["calendar"]["unique_id"], "pd_oncall_calendar_U1");

        let events = body["events"].as_array().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["summary"], "Primary");
        assert_eq!(events[0]["description"], "Schedule ID: SCH1");
        assert!(events[0]["uid"].as_str().unwrap().ends_with("-E1"));
    }

    #[tokio::test]
    async fn falls_back_to_held_events_on_failure() {
        let fake = api();
        let state = testing::app_state(fake.clone());
        state.poller.initialize().await.unwrap();
        project_upcoming(&state).await;

        fake.fail("schedules/SCH1", Failure::Transient);
        let (status, body) = send(build_router(state.clone()), "GET", "/api/calendar").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stale"], true);
        assert_eq!(body["events"].as_array().unwrap().len(), 1);

        let (_, next) = send(build_router(state), "GET", "/api/calendar/next").await;
        assert!(next["event"]["uid"].as_str().unwrap().starts_with("SCH1-"));
    }

    #[tokio::test]
    async fn past_range_query_does_not_clear_next_shift() {
        let state = testing::app_state(api());
        state.poller.initialize().await.unwrap();
        project_upcoming(&state).await;

        let (_, before) = send(build_router(state.clone()), "GET", "/api/calendar/next").await;
        let uid = before["event"]["uid"].as_str().unwrap().to_string();
        assert!(uid.ends_with("-E1"));

        let (status, body) = send(
            build_router(state.clone()),
            "GET",
            "/api/calendar?start=2020-01-01T00:00:00Z&end=2020-01-02T00:00:00Z",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stale"], false);
        assert!(body["events"].as_array().unwrap().is_empty());

        let (_, after) = send(build_router(state.clone()), "GET", "/api/calendar/next").await;
        assert_eq!(after["event"]["uid"], uid.as_str());
        assert_eq!(state.calendar.events().await.len(), 1);
    }

    #[tokio::test]
    async fn rejects_inverted_range() {
        let state = testing::app_state(api());
        let (status, _) = send(
            build_router(state),
            "GET",
            "/api/calendar?start=2024-05-02T00:00:00Z&end=2024-05-01T00:00:00Z",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn next_is_empty_before_any_projection() {
        let state = testing::app_state(api());
        let (status, body) = send(build_router(state), "GET", "/api/calendar/next").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["event"].is_null());
    }
}
