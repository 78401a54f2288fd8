//! In-memory `PagerDutyApi` used by unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::services::init;
use crate::services::pagerduty::{PagerDutyApi, Params};
use crate::AppState;

#[derive(Debug, Clone, Copy)]
pub enum Failure {
    Auth,
    Transient,
}

#[derive(Default)]
pub struct FakePagerDuty {
    objects: Mutex<HashMap<String, Value>>,
    collections: Mutex<HashMap<String, Vec<Value>>>,
    failures: Mutex<HashMap<String, Failure>>,
    calls: Mutex<Vec<(String, Params)>>,
}

impl FakePagerDuty {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object(self, path: &str, body: Value) -> Self {
        self.objects.lock().unwrap().insert(path.to_string(), body);
        self
    }

    pub fn with_collection(self, path: &str, items: Vec<Value>) -> Self {
        self.set_collection(path, items);
        self
    }

    pub fn set_collection(&self, path: &str, items: Vec<Value>) {
        self.collections
            .lock()
            .unwrap()
            .insert(path.to_string(), items);
    }

    pub fn set_object(&self, path: &str, body: Value) {
        self.objects.lock().unwrap().insert(path.to_string(), body);
    }

    pub fn fail(&self, path: &str, failure: Failure) {
        self.failures
            .lock()
            .unwrap()
            .insert(path.to_string(), failure);
    }

    pub fn heal(&self, path: &str) {
        self.failures.lock().unwrap().remove(path);
    }

    pub fn calls(&self) -> Vec<(String, Params)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called(&self, path: &str) -> bool {
        self.calls.lock().unwrap().iter().any(|(p, _)| p == path)
    }

    fn record(&self, path: &str, params: &[(String, String)]) -> AppResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push((path.to_string(), params.to_vec()));
        match self.failures.lock().unwrap().get(path) {
            Some(Failure::Auth) => Err(AppError::Auth(format!("GET {} returned 401", path))),
            Some(Failure::Transient) => Err(AppError::TransientFetch(format!(
                "GET {} timed out",
                path
            ))),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PagerDutyApi for FakePagerDuty {
    async fn get(&self, path: &str, params: &[(String, String)]) -> AppResult<Value> {
        self.record(path, params)?;
        self.objects
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| AppError::TransientFetch(format!("GET {} returned 404", path)))
    }

    async fn get_all(&self, path: &str, params: &[(String, String)]) -> AppResult<Vec<Value>> {
        self.record(path, params)?;
        Ok(self
            .collections
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .unwrap_or_default())
    }
}

// ============================================================================
// Fixture builders
// ============================================================================

pub fn user(id: &str, teams: &[(&str, &str)]) -> Value {
    let teams: Vec<Value> = teams
        .iter()
        .map(|(id, name)| json!({ "id": id, "type": "team", "summary": name, "name": name }))
        .collect();
    json!({ "user": { "id": id, "name": "Ada Lovelace", "teams": teams } })
}

pub fn service(id: &str, name: &str, team_ids: &[&str]) -> Value {
    let teams: Vec<Value> = team_ids
        .iter()
        .map(|id| json!({ "id": id, "type": "team_reference" }))
        .collect();
    json!({ "id": id, "name": name, "summary": name, "teams": teams })
}

pub fn incident(id: &str, service_id: &str, status: &str, urgency: &str, assignee: &str) -> Value {
    json!({
        "id": id,
        "status": status,
        "urgency": urgency,
        "title": format!("Incident {}", id),
        "description": "Disk full",
        "service": { "id": service_id, "summary": format!("Service {}", service_id) },
        "assignments": [ { "assignee": { "id": assignee, "summary": "Ada Lovelace" } } ]
    })
}

pub fn on_call(schedule_id: &str, start: Option<&str>, end: Option<&str>) -> Value {
    json!({
        "escalation_level": 1,
        "start": start,
        "end": end,
        "schedule": { "id": schedule_id, "summary": format!("Schedule {}", schedule_id) },
        "escalation_policy": { "id": "EP1", "summary": "Default" }
    })
}

pub fn rendered_schedule(id: &str, name: &str, entries: Vec<Value>) -> Value {
    json!({
        "schedule": {
            "id": id,
            "name": name,
            "final_schedule": { "rendered_schedule_entries": entries },
            "schedule_layers": []
        }
    })
}

pub fn entry(id: Option<&str>, user_id: &str, start: &str, end: &str) -> Value {
    json!({
        "id": id,
        "start": start,
        "end": end,
        "user": { "id": user_id, "summary": "Ada Lovelace" }
    })
}

/// Application state wired around a fake gateway with default settings.
pub fn app_state(api: Arc<FakePagerDuty>) -> Arc<AppState> {
    let config = Config::default();
    let (poller, calendar) = init::wire(api, &config);
    Arc::new(AppState {
        config,
        poller,
        calendar,
    })
}
