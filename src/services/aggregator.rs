//! Builds one consistent `Snapshot` per poll cycle.
//!
//! Call order is fixed: user → on-calls → services → incidents. Every later
//! query is scoped by identifiers from an earlier one, and any failure aborts
//! the whole cycle so a partial snapshot never escapes.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::models::{Incident, OnCallWindow, Service, Snapshot, OPEN_STATUSES, UNKNOWN_TEAM};
use crate::services::pagerduty::{
    self, parse_rfc3339, ApiIncident, ApiOnCall, ApiService, PagerDutyApi,
};

/// Strategy that produces a fresh snapshot. The poller only knows this seam.
#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    async fn refresh(&self) -> AppResult<Snapshot>;
}

#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    pub ignored_team_ids: HashSet<String>,
    pub time_zone: String,
    pub horizon: chrono::Duration,
}

impl AggregatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ignored_team_ids: config.pagerduty.ignored_team_ids.clone(),
            time_zone: config.pagerduty.time_zone.clone(),
            horizon: config.poll.horizon(),
        }
    }
}

pub struct Aggregator {
    api: Arc<dyn PagerDutyApi>,
    settings: AggregatorSettings,
}

impl Aggregator {
    pub fn new(api: Arc<dyn PagerDutyApi>, settings: AggregatorSettings) -> Self {
        Self { api, settings }
    }

    pub async fn refresh_at(&self, now: DateTime<Utc>) -> AppResult<Snapshot> {
        let api = self.api.as_ref();

        let user = pagerduty::fetch_current_user(api).await?;
        if user.id.is_empty() {
            return Err(AppError::UnexpectedShape(
                "users/me returned an empty user id".to_string(),
            ));
        }
        let teams: BTreeMap<String, String> = user
            .teams
            .iter()
            .map(|t| {
                (
                    t.id.clone(),
                    t.display_name().unwrap_or(UNKNOWN_TEAM).to_string(),
                )
            })
            .collect();
        debug!("User {} belongs to {} team(s)", user.id, teams.len());

        let until = window_end(now, self.settings.horizon)?;
        let on_calls = pagerduty::fetch_on_calls(
            api,
            &user.id,
            &self.settings.time_zone,
            now,
            until,
        )
        .await?
        .into_iter()
        .map(to_on_call_window)
        .collect::<AppResult<Vec<_>>>()?;

        let team_ids: Vec<String> = teams.keys().cloned().collect();
        let services = if team_ids.is_empty() {
            debug!("User {} has no teams; skipping service lookup", user.id);
            Vec::new()
        } else {
            pagerduty::fetch_services(api, &team_ids)
                .await?
                .into_iter()
                .map(|s| to_service(s, &teams))
                .collect()
        };

        let fetched = services.len();
        let services = exclude_ignored_teams(services, &self.settings.ignored_team_ids);
        if services.len() != fetched {
            debug!(
                "Ignored-team filter removed {} of {} service(s)",
                fetched - services.len(),
                fetched
            );
        }

        let service_ids: Vec<String> = services.iter().map(|s| s.id.clone()).collect();
        let incidents = if service_ids.is_empty() {
            Vec::new()
        } else {
            let incidents = pagerduty::fetch_open_incidents(api, &service_ids)
                .await?
                .into_iter()
                .map(to_incident)
                .collect();
            retain_known_services(incidents, &services)
        };

        info!(
            "Aggregated snapshot for user {}: {} service(s), {} open incident(s), {} on-call window(s)",
            user.id,
            services.len(),
            incidents.len(),
            on_calls.len()
        );

        Ok(Snapshot {
            user_id: user.id,
            user_name: user.name,
            teams,
            services,
            incidents,
            on_calls,
            fetched_at: Some(now),
        })
    }
}

#[async_trait]
impl SnapshotSource for Aggregator {
    async fn refresh(&self) -> AppResult<Snapshot> {
        self.refresh_at(Utc::now()).await
    }
}

/// `now + horizon`, failing instead of overflowing the calendar.
pub fn window_end(now: DateTime<Utc>, horizon: chrono::Duration) -> AppResult<DateTime<Utc>> {
    now.checked_add_signed(horizon).ok_or_else(|| {
        AppError::Config(format!(
            "look-ahead of {} days is out of range",
            horizon.num_days()
        ))
    })
}

/// Drop every service associated with at least one ignored team.
pub fn exclude_ignored_teams(services: Vec<Service>, ignored: &HashSet<String>) -> Vec<Service> {
    if ignored.is_empty() {
        return services;
    }
    services
        .into_iter()
        .filter(|s| {
            !s.team_ids.iter().any(|t| ignored.contains(t))
                && !s.team_id.as_ref().is_some_and(|t| ignored.contains(t))
        })
        .collect()
}

/// Keep only incidents whose service is part of `services`.
fn retain_known_services(incidents: Vec<Incident>, services: &[Service]) -> Vec<Incident> {
    let known: BTreeSet<&str> = services.iter().map(|s| s.id.as_str()).collect();
    incidents
        .into_iter()
        .filter(|i| {
            let keep = known.contains(i.service_id.as_str());
            if !keep {
                warn!(
                    "Dropping incident {} for unrequested service {}",
                    i.id, i.service_id
                );
            }
            keep
        })
        .collect()
}

fn to_service(api: ApiService, teams: &BTreeMap<String, String>) -> Service {
    let team_ids: Vec<String> = api.teams.iter().map(|t| t.id.clone()).collect();
    let primary = team_ids
        .iter()
        .find(|id| teams.contains_key(*id))
        .or_else(|| team_ids.first())
        .cloned();
    let team_name = primary
        .as_ref()
        .and_then(|id| teams.get(id))
        .cloned()
        .unwrap_or_else(|| UNKNOWN_TEAM.to_string());
    let name = api
        .name
        .or(api.summary)
        .unwrap_or_else(|| api.id.clone());

    Service {
        id: api.id,
        name,
        team_id: primary,
        team_name,
        team_ids,
    }
}

fn to_incident(api: ApiIncident) -> Incident {
    if !OPEN_STATUSES.contains(&api.status.as_str()) {
        debug!(
            "Incident {} changed to status '{}' during the cycle",
            api.id, api.status
        );
    }
    Incident {
        id: api.id,
        service_id: api.service.id.clone(),
        service_name: api.service.display_name().map(str::to_string),
        title: api.title,
        description: api.description,
        status: api.status,
        urgency: api.urgency,
        assignees: api
            .assignments
            .into_iter()
            .map(|a| a.assignee.id)
            .collect(),
    }
}

fn parse_bound(value: Option<&str>, field: &str) -> AppResult<Option<DateTime<Utc>>> {
    match value {
        None => Ok(None),
        Some(s) => parse_rfc3339(s).map(Some).ok_or_else(|| {
            AppError::UnexpectedShape(format!("oncalls: invalid {} timestamp '{}'", field, s))
        }),
    }
}

fn to_on_call_window(api: ApiOnCall) -> AppResult<OnCallWindow> {
    Ok(OnCallWindow {
        start: parse_bound(api.start.as_deref(), "start")?,
        end: parse_bound(api.end.as_deref(), "end")?,
        schedule_id: api.schedule.as_ref().map(|s| s.id.clone()),
        schedule_name: api
            .schedule
            .as_ref()
            .and_then(|s| s.display_name().map(str::to_string)),
        escalation_policy_id: api.escalation_policy.map(|p| p.id),
        escalation_level: api.escalation_level.unwrap_or(1),
    })
}
