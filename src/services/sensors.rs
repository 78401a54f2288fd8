//! Read-only display values derived from a snapshot.
//!
//! The sensor set is an explicit table of `(key, SensorRule)` pairs rebuilt
//! from each snapshot; evaluating a rule only reads the snapshot it is given.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::models::{
    Incident, Snapshot, STATUS_ACKNOWLEDGED, STATUS_TRIGGERED, UNKNOWN_TEAM, URGENCY_HIGH,
    URGENCY_LOW,
};

pub const TOTAL_INCIDENTS: &str = "total_incidents";
pub const ASSIGNED_INCIDENTS: &str = "assigned_incidents";
pub const ON_CALL: &str = "on_call";
const SERVICE_PREFIX: &str = "service_";

const INCIDENTS_UNIT: &str = "incidents";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorRule {
    TotalIncidents,
    AssignedIncidents,
    ServiceIncidents { service_id: String },
    OnCall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Sensor,
    BinarySensor,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    pub key: String,
    pub kind: SensorKind,
    pub name: String,
    pub unique_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<&'static str>,
    pub state: Value,
    pub attributes: Map<String, Value>,
}

/// Calendar entity identity for the snapshot user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CalendarDescriptor {
    pub name: &'static str,
    pub unique_id: String,
}

pub fn calendar_descriptor(snapshot: &Snapshot) -> CalendarDescriptor {
    CalendarDescriptor {
        name: "PagerDuty On-Call Schedule",
        unique_id: format!("pd_oncall_calendar_{}", snapshot.user_id),
    }
}

/// Sensor table for one snapshot, in display order.
pub fn sensor_table(snapshot: &Snapshot) -> Vec<(String, SensorRule)> {
    let mut table = vec![
        (TOTAL_INCIDENTS.to_string(), SensorRule::TotalIncidents),
        (ASSIGNED_INCIDENTS.to_string(), SensorRule::AssignedIncidents),
    ];
    table.extend(snapshot.services.iter().map(|service| {
        (
            format!("{}{}", SERVICE_PREFIX, service.id),
            SensorRule::ServiceIncidents {
                service_id: service.id.clone(),
            },
        )
    }));
    table.push((ON_CALL.to_string(), SensorRule::OnCall));
    table
}

pub fn read_sensors(snapshot: &Snapshot, now: DateTime<Utc>) -> Vec<SensorReading> {
    sensor_table(snapshot)
        .into_iter()
        .filter_map(|(key, rule)| rule.evaluate(key, snapshot, now))
        .collect()
}

pub fn read_sensor(snapshot: &Snapshot, key: &str, now: DateTime<Utc>) -> Option<SensorReading> {
    sensor_table(snapshot)
        .into_iter()
        .find(|(k, _)| k == key)
        .and_then(|(key, rule)| rule.evaluate(key, snapshot, now))
}

impl SensorRule {
    /// `None` when the rule refers to something the snapshot no longer has.
    pub fn evaluate(
        &self,
        key: String,
        snapshot: &Snapshot,
        now: DateTime<Utc>,
    ) -> Option<SensorReading> {
        let user_id = snapshot.user_id.as_str();

        let reading = match self {
            SensorRule::TotalIncidents => SensorReading {
                name: "PagerDuty Total Incidents".to_string(),
                unique_id: format!("pagerduty_total_incidents_{}", user_id),
                kind: SensorKind::Sensor,
                unit: Some(INCIDENTS_UNIT),
                state: json!(snapshot.incidents.len()),
                attributes: breakdown(snapshot.incidents.iter()),
                key,
            },
            SensorRule::AssignedIncidents => {
                let assigned: Vec<&Incident> = snapshot
                    .incidents
                    .iter()
                    .filter(|i| i.is_assigned_to(user_id))
                    .collect();
                let details: Vec<Value> = assigned
                    .iter()
                    .map(|i| {
                        json!({
                            "impacted_service": i.service_name.as_deref().unwrap_or(i.service_id.as_str()),
                            "title": i.title,
                            "description": i.description,
                            "status": i.status,
                        })
                    })
                    .collect();

                let mut attributes = breakdown(assigned.iter().copied());
                attributes.insert("assigned_incidents".to_string(), Value::Array(details));

                SensorReading {
                    name: "PagerDuty Assigned Incidents".to_string(),
                    unique_id: format!("pagerduty_assigned_incidents_{}", user_id),
                    kind: SensorKind::Sensor,
                    unit: Some(INCIDENTS_UNIT),
                    state: json!(assigned.len()),
                    attributes,
                    key,
                }
            }
            SensorRule::ServiceIncidents { service_id } => {
                let service = snapshot.service(service_id)?;
                let incidents: Vec<&Incident> =
                    snapshot.incidents_for_service(service_id).collect();

                let (name, unique_id) = match service.team_id.as_deref() {
                    Some(team_id) if service.team_name != UNKNOWN_TEAM => (
                        format!("PD-{}-{}", service.team_name, service.name),
                        format!("pagerduty_{}_{}", team_id, service.id),
                    ),
                    _ => (
                        format!("PD-{}", service.name),
                        format!("pagerduty_{}", service.id),
                    ),
                };

                let mut attributes = breakdown(incidents.iter().copied());
                attributes.insert("service_id".to_string(), json!(service.id));
                attributes.insert("team".to_string(), json!(service.team_name));

                SensorReading {
                    name,
                    unique_id,
                    kind: SensorKind::Sensor,
                    unit: Some(INCIDENTS_UNIT),
                    state: json!(incidents.len()),
                    attributes,
                    key,
                }
            }
            SensorRule::OnCall => {
                let schedules: Vec<&str> = snapshot
                    .on_calls
                    .iter()
                    .filter(|w| w.contains(now))
                    .filter_map(|w| w.schedule_name.as_deref().or(w.schedule_id.as_deref()))
                    .collect();

                let mut attributes = Map::new();
                attributes.insert(
                    "next_on_call_start".to_string(),
                    json!(snapshot.next_on_call_start(now)),
                );
                attributes.insert("schedules".to_string(), json!(schedules));

                SensorReading {
                    name: "PagerDuty On Call Status".to_string(),
                    unique_id: format!("pagerduty_oncall_{}", user_id),
                    kind: SensorKind::BinarySensor,
                    unit: None,
                    state: json!(snapshot.is_on_call(now)),
                    attributes,
                    key,
                }
            }
        };

        Some(reading)
    }
}

/// Urgency and status counters shared by the incident sensors.
fn breakdown<'a>(incidents: impl Iterator<Item = &'a Incident>) -> Map<String, Value> {
    let (mut low, mut high, mut triggered, mut acknowledged) = (0u64, 0u64, 0u64, 0u64);
    for incident in incidents {
        match incident.urgency.as_str() {
            URGENCY_LOW => low += 1,
            URGENCY_HIGH => high += 1,
            _ => {}
        }
        match incident.status.as_str() {
            STATUS_TRIGGERED => triggered += 1,
            STATUS_ACKNOWLEDGED => acknowledged += 1,
            _ => {}
        }
    }

    let mut map = Map::new();
    map.insert("urgency_low".to_string(), json!(low));
    map.insert("urgency_high".to_string(), json!(high));
    map.insert("status_triggered".to_string(), json!(triggered));
    map.insert("status_acknowledged".to_string(), json!(acknowledged));
    map
}
