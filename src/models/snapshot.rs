use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Incident status / urgency values
// ============================================================================

pub const STATUS_TRIGGERED: &str = "triggered";
pub const STATUS_ACKNOWLEDGED: &str = "acknowledged";
pub const URGENCY_HIGH: &str = "high";
pub const URGENCY_LOW: &str = "low";

/// Statuses requested from the incidents endpoint.
pub const OPEN_STATUSES: [&str; 2] = [STATUS_TRIGGERED, STATUS_ACKNOWLEDGED];

/// Team name used when a service's team is not one of the user's teams.
pub const UNKNOWN_TEAM: &str = "Unknown";

// ============================================================================
// Snapshot
// ============================================================================

/// One consistent aggregation result for a single poll cycle.
///
/// Built once by the aggregator and never mutated afterwards; consumers get it
/// behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub user_id: String,
    pub user_name: Option<String>,
    pub teams: BTreeMap<String, String>,
    pub services: Vec<Service>,
    pub incidents: Vec<Incident>,
    pub on_calls: Vec<OnCallWindow>,
    pub fetched_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub team_id: Option<String>,
    pub team_name: String,
    /// Every team associated with the service upstream.
    pub team_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub service_id: String,
    pub service_name: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: String,
    pub urgency: String,
    pub assignees: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnCallWindow {
    pub schedule_id: Option<String>,
    pub schedule_name: Option<String>,
    pub escalation_policy_id: Option<String>,
    /// `None`: started before the query window.
    pub start: Option<DateTime<Utc>>,
    /// `None`: no scheduled end (permanent on-call).
    pub end: Option<DateTime<Utc>>,
    pub escalation_level: u32,
}

impl OnCallWindow {
    /// Half-open containment: `start <= now < end`.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let started = self.start.map_or(true, |start| start <= now);
        let not_ended = self.end.map_or(true, |end| now < end);
        started && not_ended
    }
}

impl Incident {
    pub fn is_assigned_to(&self, user_id: &str) -> bool {
        self.assignees.contains(user_id)
    }
}

impl Snapshot {
    /// Placeholder served before the first successful refresh.
    pub fn empty() -> Self {
        Snapshot {
            user_id: String::new(),
            user_name: None,
            teams: BTreeMap::new(),
            services: Vec::new(),
            incidents: Vec::new(),
            on_calls: Vec::new(),
            fetched_at: None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.fetched_at.is_none()
    }

    pub fn is_on_call(&self, now: DateTime<Utc>) -> bool {
        self.on_calls.iter().any(|w| w.contains(now))
    }

    /// Start of the earliest on-call window that has not begun yet.
    pub fn next_on_call_start(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.on_calls
            .iter()
            .filter_map(|w| w.start)
            .filter(|start| *start > now)
            .min()
    }

    pub fn service(&self, service_id: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.id == service_id)
    }

    pub fn incidents_for_service<'a>(
        &'a self,
        service_id: &'a str,
    ) -> impl Iterator<Item = &'a Incident> + 'a {
        self.incidents
            .iter()
            .filter(move |i| i.service_id == service_id)
    }

    /// Distinct schedule ids referenced by on-call windows, in first-seen order.
    pub fn schedule_ids(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.on_calls
            .iter()
            .filter_map(|w| w.schedule_id.clone())
            .filter(|id| seen.insert(id.clone()))
            .collect()
    }

    /// Every incident references a service of this snapshot.
    pub fn is_referentially_closed(&self) -> bool {
        let ids: BTreeSet<&str> = self.services.iter().map(|s| s.id.as_str()).collect();
        self.incidents
            .iter()
            .all(|i| ids.contains(i.service_id.as_str()))
    }
}
