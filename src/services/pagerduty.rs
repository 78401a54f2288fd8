use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::config::PagerDutyConfig;
use crate::error::{AppError, AppResult};
use crate::models::OPEN_STATUSES;

const PAGE_LIMIT: usize = 100;
/// Classic pagination stops accepting offsets past 10k.
const MAX_PAGES: usize = 100;
const ACCEPT_HEADER: &str = "application/vnd.pagerduty+json;version=2";

/// Query parameters; keys may repeat (`team_ids[]`).
pub type Params = Vec<(String, String)>;

pub fn param(key: &str, value: impl Into<String>) -> (String, String) {
    (key.to_string(), value.into())
}

/// Narrow REST capability the poller is built on.
///
/// `get` returns the raw response body; `get_all` follows offset pagination
/// and returns the concatenated collection named by the last path segment.
#[async_trait]
pub trait PagerDutyApi: Send + Sync + 'static {
    async fn get(&self, path: &str, params: &[(String, String)]) -> AppResult<Value>;

    async fn get_all(&self, path: &str, params: &[(String, String)]) -> AppResult<Vec<Value>>;
}

// ============================================================================
// User Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct UserResponse {
    pub user: ApiUser,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiUser {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub teams: Vec<ApiReference>,
}

/// Reference object (`{id, type, summary}`), sometimes expanded with `name`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiReference {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

impl ApiReference {
    pub fn display_name(&self) -> Option<&str> {
        self.name.as_deref().or(self.summary.as_deref())
    }
}

// ============================================================================
// Service / Incident Types
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ApiService {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub teams: Vec<ApiReference>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiIncident {
    pub id: String,
    pub status: String,
    #[serde(default = "unknown")]
    pub urgency: String,
    pub service: ApiReference,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub assignments: Vec<ApiAssignment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiAssignment {
    pub assignee: ApiReference,
}

fn unknown() -> String {
    "unknown".to_string()
}

// ============================================================================
// On-call / Schedule Types
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ApiOnCall {
    #[serde(default)]
    pub escalation_level: Option<u32>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub schedule: Option<ApiReference>,
    #[serde(default)]
    pub escalation_policy: Option<ApiReference>,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleResponse {
    pub schedule: ApiSchedule,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiSchedule {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub final_schedule: Option<ApiScheduleLayer>,
    #[serde(default)]
    pub schedule_layers: Vec<ApiScheduleLayer>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiScheduleLayer {
    #[serde(default)]
    pub rendered_schedule_entries: Vec<ApiRenderedEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiRenderedEntry {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub user: Option<ApiReference>,
}

impl ApiSchedule {
    /// Final rendered entries, falling back to the first layer when the final
    /// schedule was not rendered.
    pub fn rendered_entries(&self) -> &[ApiRenderedEntry] {
        match self.final_schedule.as_ref() {
            Some(layer) if !layer.rendered_schedule_entries.is_empty() => {
                &layer.rendered_schedule_entries
            }
            _ => self
                .schedule_layers
                .first()
                .map(|l| l.rendered_schedule_entries.as_slice())
                .unwrap_or(&[]),
        }
    }
}

/// Decode a JSON value into a wire type, reporting failures as shape errors.
pub fn decode<T: DeserializeOwned>(value: Value, what: &str) -> AppResult<T> {
    serde_json::from_value(value)
        .map_err(|e| AppError::UnexpectedShape(format!("{}: {}", what, e)))
}

/// Parse an RFC3339 timestamp into UTC. Returns None if parsing fails.
pub fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn format_rfc3339(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

// ============================================================================
// Endpoint helpers
// ============================================================================

/// `GET /users/me` with team memberships embedded.
pub async fn fetch_current_user(api: &dyn PagerDutyApi) -> AppResult<ApiUser> {
    let body = api
        .get("users/me", &[param("include[]", "teams")])
        .await?;
    let response: UserResponse = decode(body, "users/me")?;
    Ok(response.user)
}

/// `GET /oncalls` for one user across `[since, until]`.
pub async fn fetch_on_calls(
    api: &dyn PagerDutyApi,
    user_id: &str,
    time_zone: &str,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
) -> AppResult<Vec<ApiOnCall>> {
    let params = vec![
        param("user_ids[]", user_id),
        param("time_zone", time_zone),
        param("since", format_rfc3339(since)),
        param("until", format_rfc3339(until)),
    ];
    api.get_all("oncalls", &params)
        .await?
        .into_iter()
        .map(|v| decode(v, "oncalls"))
        .collect()
}

/// `GET /services` filtered to the given teams.
pub async fn fetch_services(
    api: &dyn PagerDutyApi,
    team_ids: &[String],
) -> AppResult<Vec<ApiService>> {
    let mut params: Params = team_ids
        .iter()
        .map(|id| param("team_ids[]", id.as_str()))
        .collect();
    params.push(param("include[]", "teams"));
    api.get_all("services", &params)
        .await?
        .into_iter()
        .map(|v| decode(v, "services"))
        .collect()
}

/// `GET /incidents` for the given services, open statuses only.
pub async fn fetch_open_incidents(
    api: &dyn PagerDutyApi,
    service_ids: &[String],
) -> AppResult<Vec<ApiIncident>> {
    let mut params: Params = service_ids
        .iter()
        .map(|id| param("service_ids[]", id.as_str()))
        .collect();
    params.extend(OPEN_STATUSES.iter().map(|s| param("statuses[]", *s)));
    api.get_all("incidents", &params)
        .await?
        .into_iter()
        .map(|v| decode(v, "incidents"))
        .collect()
}

/// `GET /schedules/{id}` rendered for `[since, until]`.
pub async fn fetch_rendered_schedule(
    api: &dyn PagerDutyApi,
    schedule_id: &str,
    time_zone: &str,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
) -> AppResult<ApiSchedule> {
    let path = format!("schedules/{}", urlencoding::encode(schedule_id));
    let params = vec![
        param("time_zone", time_zone),
        param("since", format_rfc3339(since)),
        param("until", format_rfc3339(until)),
    ];
    let body = api.get(&path, &params).await?;
    let response: ScheduleResponse = decode(body, "schedules")?;
    Ok(response.schedule)
}

// ============================================================================
// reqwest-backed client
// ============================================================================

#[derive(Debug, Clone)]
pub struct PagerDutyClient {
    client: Client,
    base_url: String,
    api_token: String,
    max_retries: usize,
    initial_backoff: StdDuration,
}

impl PagerDutyClient {
    pub fn new(config: &PagerDutyConfig) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| AppError::Internal(e.into()))?;

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            max_retries: config.max_retries.max(1),
            initial_backoff: StdDuration::from_secs(1),
        })
    }

    #[cfg(test)]
    pub fn with_initial_backoff(mut self, backoff: StdDuration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, path: &str, params: &[(String, String)]) -> reqwest::RequestBuilder {
        self.client
            .get(self.url(path))
            .header("Authorization", format!("Token token={}", self.api_token))
            .header("Accept", ACCEPT_HEADER)
            .query(params)
    }

    /// Send a request, retrying on 429/5xx and network errors.
    ///
    /// Non-retryable statuses are returned to the caller untouched.
    async fn send_with_backoff<F>(&self, make_request: F) -> AppResult<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut backoff = self.initial_backoff;
        let max_backoff = StdDuration::from_secs(30);

        for attempt in 0..self.max_retries {
            match (make_request)().send().await {
                Ok(resp) => {
                    if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS
                        || resp.status().is_server_error()
                    {
                        let status = resp.status();
                        if attempt + 1 >= self.max_retries {
                            let err_text = resp.text().await.unwrap_or_default();
                            return Err(AppError::TransientFetch(format!(
                                "status {} after {} attempts: {}",
                                status,
                                attempt + 1,
                                err_text
                            )));
                        }

                        // Respect Retry-After header if present
                        let mut wait = backoff;
                        if let Some(h) = resp.headers().get("retry-after") {
                            if let Ok(s) = h.to_str() {
                                if let Ok(parsed) = s.parse::<u64>() {
                                    wait = StdDuration::from_secs(parsed).min(max_backoff);
                                }
                            }
                        }

                        tracing::warn!(
                            "Transient PagerDuty error (status: {}). Retrying in {:?} (attempt {}/{})",
                            status,
                            wait,
                            attempt + 1,
                            self.max_retries
                        );

                        tokio::time::sleep(wait).await;
                        backoff = std::cmp::min(backoff * 2, max_backoff);
                        continue;
                    }

                    return Ok(resp);
                }
                Err(e) => {
                    if attempt + 1 >= self.max_retries {
                        let kind = if e.is_timeout() { "timed out" } else { "failed" };
                        return Err(AppError::TransientFetch(format!(
                            "request {} after {} attempts: {}",
                            kind,
                            attempt + 1,
                            e
                        )));
                    }
                    tracing::warn!(
                        "PagerDuty request failed: {}. Retrying in {:?} (attempt {}/{})",
                        e,
                        backoff,
                        attempt + 1,
                        self.max_retries
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, max_backoff);
                }
            }
        }

        Err(AppError::TransientFetch(
            "Exceeded PagerDuty retry attempts".to_string(),
        ))
    }

    async fn get_json(&self, path: &str, params: &[(String, String)]) -> AppResult<Value> {
        let response = self.send_with_backoff(|| self.request(path, params)).await?;
        let status = response.status();

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::Auth(format!(
                "GET {} returned {}: {}",
                path, status, error_text
            )));
        }

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::TransientFetch(format!(
                "GET {} returned {}: {}",
                path, status, error_text
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| AppError::UnexpectedShape(format!("GET {}: invalid JSON: {}", path, e)))
    }
}

/// Collection key for a list endpoint: the last path segment.
fn collection_key(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
}

#[async_trait]
impl PagerDutyApi for PagerDutyClient {
    async fn get(&self, path: &str, params: &[(String, String)]) -> AppResult<Value> {
        tracing::debug!("GET {}", path);
        self.get_json(path, params).await
    }

    async fn get_all(&self, path: &str, params: &[(String, String)]) -> AppResult<Vec<Value>> {
        let key = collection_key(path);
        let mut items = Vec::new();
        let mut offset = 0usize;

        for page in 0..MAX_PAGES {
            let mut page_params = params.to_vec();
            page_params.push(param("limit", PAGE_LIMIT.to_string()));
            page_params.push(param("offset", offset.to_string()));

            let mut body = self.get_json(path, &page_params).await?;

            let batch = match body.get_mut(key).map(Value::take) {
                Some(Value::Array(batch)) => batch,
                _ => {
                    return Err(AppError::UnexpectedShape(format!(
                        "GET {}: missing '{}' array",
                        path, key
                    )))
                }
            };
            let more = body.get("more").and_then(Value::as_bool).unwrap_or(false);

            tracing::debug!(
                "GET {} page {} returned {} item(s), more={}",
                path,
                page + 1,
                batch.len(),
                more
            );

            let fetched = batch.len();
            items.extend(batch);

            if !more || fetched == 0 {
                return Ok(items);
            }
            offset += fetched;
        }

        tracing::warn!(
            "GET {} stopped after {} pages; results may be truncated",
            path,
            MAX_PAGES
        );
        Ok(items)
    }
}
