use std::collections::HashSet;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

const PAGERDUTY_US_API_URL: &str = "https://api.pagerduty.com";
const PAGERDUTY_EU_API_URL: &str = "https://api.eu.pagerduty.com";

/// Upper bound for `LOOKAHEAD_DAYS`; keeps on-call and schedule payloads bounded.
pub const MAX_LOOKAHEAD_DAYS: i64 = 90;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub pagerduty: PagerDutyConfig,
    pub poll: PollConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Which PagerDuty service region the account lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiRegion {
    Us,
    Eu,
}

impl ApiRegion {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "us" | "" => Some(ApiRegion::Us),
            "eu" => Some(ApiRegion::Eu),
            _ => None,
        }
    }

    pub fn base_url(&self) -> &'static str {
        match self {
            ApiRegion::Us => PAGERDUTY_US_API_URL,
            ApiRegion::Eu => PAGERDUTY_EU_API_URL,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PagerDutyConfig {
    pub api_token: String,
    pub region: ApiRegion,
    /// Base URL used for REST calls. Defaults to the region URL; read from
    /// `PAGERDUTY_API_URL` when set.
    pub api_url: String,
    /// Team ids whose services are hidden from every snapshot.
    pub ignored_team_ids: HashSet<String>,
    /// Time zone passed to on-call and schedule queries (IANA name).
    pub time_zone: String,
    pub request_timeout_seconds: u64,
    /// Attempts per REST call on 429/5xx and network errors.
    pub max_retries: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollConfig {
    pub interval_seconds: u64,
    /// Look-ahead for on-call windows and rendered schedules.
    pub lookahead_days: i64,
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.max(1))
    }

    pub fn horizon(&self) -> chrono::Duration {
        chrono::Duration::days(self.lookahead_days.clamp(1, MAX_LOOKAHEAD_DAYS))
    }
}

impl PagerDutyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds.max(1))
    }
}

/// Parse a comma-separated team id list into a set, dropping blanks.
pub fn parse_team_list(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse a numeric setting; unset or blank means `default`.
pub fn parse_number<T: FromStr>(name: &str, raw: Option<&str>, default: T) -> Result<T, ConfigError> {
    match raw.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name.to_string())),
    }
}

fn env_number<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    parse_number(name, env::var(name).ok().as_deref(), default)
}

/// Parse `LOOKAHEAD_DAYS`, accepting `1..=MAX_LOOKAHEAD_DAYS`.
pub fn parse_lookahead_days(raw: &str) -> Result<i64, ConfigError> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .filter(|days| (1..=MAX_LOOKAHEAD_DAYS).contains(days))
        .ok_or_else(|| ConfigError::InvalidValue("LOOKAHEAD_DAYS".to_string()))
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let region = match env::var("PAGERDUTY_API_REGION") {
            Ok(v) => ApiRegion::parse(&v)
                .ok_or_else(|| ConfigError::InvalidValue("PAGERDUTY_API_REGION".to_string()))?,
            Err(_) => ApiRegion::Us,
        };

        let api_url = match env::var("PAGERDUTY_API_URL") {
            Ok(v) if !v.trim().is_empty() => {
                url::Url::parse(v.trim())
                    .map_err(|_| ConfigError::InvalidValue("PAGERDUTY_API_URL".to_string()))?;
                v.trim().trim_end_matches('/').to_string()
            }
            _ => region.base_url().to_string(),
        };

        Ok(Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PORT".to_string()))?,
            },
            pagerduty: PagerDutyConfig {
                api_token: env::var("PAGERDUTY_API_TOKEN")
                    .ok()
                    .filter(|t| !t.trim().is_empty())
                    .ok_or_else(|| ConfigError::MissingEnv("PAGERDUTY_API_TOKEN".to_string()))?,
                region,
                api_url,
                ignored_team_ids: env::var("PAGERDUTY_IGNORED_TEAMS")
                    .map(|v| parse_team_list(&v))
                    .unwrap_or_default(),
                time_zone: env::var("PAGERDUTY_TIME_ZONE").unwrap_or_else(|_| "UTC".to_string()),
                request_timeout_seconds: env_number("PAGERDUTY_REQUEST_TIMEOUT_SECONDS", 30)?,
                max_retries: env_number("PAGERDUTY_MAX_RETRIES", 3)?,
            },
            poll: PollConfig {
                interval_seconds: env::var("POLL_INTERVAL_SECONDS")
                    .unwrap_or_else(|_| "60".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("POLL_INTERVAL_SECONDS".to_string()))?,
                lookahead_days: parse_lookahead_days(
                    &env::var("LOOKAHEAD_DAYS").unwrap_or_else(|_| "14".to_string()),
                )?,
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            pagerduty: PagerDutyConfig {
                api_token: String::new(),
                region: ApiRegion::Us,
                api_url: PAGERDUTY_US_API_URL.to_string(),
                ignored_team_ids: HashSet::new(),
                time_zone: "UTC".to_string(),
                request_timeout_seconds: 30,
                max_retries: 3,
            },
            poll: PollConfig {
                interval_seconds: 60,
                lookahead_days: 14,
            },
        }
    }
}
