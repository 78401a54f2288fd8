use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{AppError, AppResult};
use crate::models::{CalendarEvent, RenderedEntry, RenderedSchedule, Snapshot};
use crate::services::pagerduty::{self, ApiRenderedEntry, ApiSchedule, PagerDutyApi};

/// Calendar projector:
///
/// - Fetches the rendered schedule for every schedule the snapshot's on-call
///   windows reference.
/// - Keeps the entries that belong to the snapshot user, collapsed to one
///   event per schedule and calendar day.
/// - Holds the latest projection; a failed projection leaves it untouched.
pub struct CalendarProjector {
    api: Arc<dyn PagerDutyApi>,
    time_zone: String,
    events: RwLock<Vec<CalendarEvent>>,
}

impl CalendarProjector {
    pub fn new(api: Arc<dyn PagerDutyApi>, time_zone: impl Into<String>) -> Self {
        Self {
            api,
            time_zone: time_zone.into(),
            events: RwLock::new(Vec::new()),
        }
    }

    /// Project the snapshot user's on-call shifts overlapping `[start, end]`
    /// and replace the held event list with the result.
    pub async fn project(
        &self,
        snapshot: &Snapshot,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AppResult<Vec<CalendarEvent>> {
        let events = self.fetch_events(snapshot, start, end).await?;
        *self.events.write().await = events.clone();
        Ok(events)
    }

    /// Same projection as [`project`](Self::project), leaving the held list alone.
    pub async fn fetch_events(
        &self,
        snapshot: &Snapshot,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AppResult<Vec<CalendarEvent>> {
        if end < start {
            return Err(AppError::BadRequest(
                "calendar range ends before it starts".to_string(),
            ));
        }

        let schedule_ids = snapshot.schedule_ids();
        debug!(
            "Projecting {} schedule(s) for user {} over {} .. {}",
            schedule_ids.len(),
            snapshot.user_id,
            start,
            end
        );

        let mut schedules = Vec::with_capacity(schedule_ids.len());
        for schedule_id in &schedule_ids {
            let api_schedule = pagerduty::fetch_rendered_schedule(
                self.api.as_ref(),
                schedule_id,
                &self.time_zone,
                start,
                end,
            )
            .await?;
            schedules.push(to_rendered_schedule(api_schedule)?);
        }

        let events = build_events(&snapshot.user_id, &schedules, start, end);
        info!(
            "Projected {} on-call event(s) from {} schedule(s)",
            events.len(),
            schedules.len()
        );
        Ok(events)
    }

    /// Events from the latest successful projection.
    pub async fn events(&self) -> Vec<CalendarEvent> {
        self.events.read().await.clone()
    }

    /// Held events overlapping `[start, end]`.
    pub async fn events_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<CalendarEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.overlaps(start, end))
            .cloned()
            .collect()
    }

    /// The current or next shift: the earliest held event that has not ended.
    pub async fn next_event(&self, now: DateTime<Utc>) -> Option<CalendarEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.end > now)
            .min_by_key(|e| (e.start, e.end))
            .cloned()
    }
}

/// Turn rendered schedules into calendar events for `user_id`.
///
/// One event survives per `(schedule, day)`; when several entries share a key
/// the one rendered last wins. Output is ordered by `(start, uid)`.
pub fn build_events(
    user_id: &str,
    schedules: &[RenderedSchedule],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<CalendarEvent> {
    let mut by_day: BTreeMap<(&str, NaiveDate), CalendarEvent> = BTreeMap::new();

    for schedule in schedules {
        for entry in schedule.entries.iter().filter(|e| e.user_id == user_id) {
            by_day.insert(
                (schedule.id.as_str(), entry.date),
                to_event(schedule, entry),
            );
        }
    }

    let mut events: Vec<CalendarEvent> = by_day
        .into_values()
        .filter(|e| e.overlaps(start, end))
        .collect();
    events.sort_by(|a, b| (a.start, &a.uid).cmp(&(b.start, &b.uid)));
    events
}

fn to_event(schedule: &RenderedSchedule, entry: &RenderedEntry) -> CalendarEvent {
    let slot = entry.id.as_deref().unwrap_or("0");
    CalendarEvent {
        uid: format!("{}-{}-{}", schedule.id, entry.date, slot),
        summary: schedule.name.clone(),
        start: entry.start,
        end: entry.end,
        location: entry.user_name.clone(),
        description: format!("Schedule ID: {}", schedule.id),
    }
}

fn to_rendered_schedule(api: ApiSchedule) -> AppResult<RenderedSchedule> {
    let mut entries = Vec::new();
    for raw in api.rendered_entries() {
        if let Some(entry) = to_rendered_entry(&api.id, raw)? {
            entries.push(entry);
        }
    }

    let name = api
        .name
        .clone()
        .or_else(|| api.summary.clone())
        .unwrap_or_else(|| api.id.clone());

    Ok(RenderedSchedule {
        id: api.id,
        name,
        entries,
    })
}

/// `None` for entries without a user or without both bounds.
fn to_rendered_entry(
    schedule_id: &str,
    raw: &ApiRenderedEntry,
) -> AppResult<Option<RenderedEntry>> {
    let (Some(user), Some(start), Some(end)) = (&raw.user, &raw.start, &raw.end) else {
        debug!("Skipping incomplete entry in schedule {}", schedule_id);
        return Ok(None);
    };

    let start = parse_rendered(schedule_id, start)?;
    let end = parse_rendered(schedule_id, end)?;

    Ok(Some(RenderedEntry {
        id: raw.id.clone(),
        start: start.with_timezone(&Utc),
        end: end.with_timezone(&Utc),
        date: start.date_naive(),
        user_id: user.id.clone(),
        user_name: user.display_name().map(str::to_string),
    }))
}

fn parse_rendered(schedule_id: &str, value: &str) -> AppResult<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(value).map_err(|e| {
        AppError::UnexpectedShape(format!(
            "schedule {} entry has invalid timestamp {:?}: {}",
            schedule_id, value, e
        ))
    })
}
