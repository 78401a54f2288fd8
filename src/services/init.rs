//! Initialization helpers for the application:
//! - PagerDuty client + aggregator + poller wiring
//! - background worker spawn helpers
//!
//! This module keeps the composition details out of `main.rs`.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{broadcast, watch};

use crate::config::Config;
use crate::models::Snapshot;
use crate::services::aggregator::{window_end, Aggregator, AggregatorSettings};
use crate::services::calendar::CalendarProjector;
use crate::services::pagerduty::{PagerDutyApi, PagerDutyClient};
use crate::services::poller::Poller;

/// Build the poller and calendar projector for one configured token.
///
/// Both share a single PagerDuty client.
pub fn build_pipeline(config: &Config) -> Result<(Arc<Poller>, Arc<CalendarProjector>)> {
    tracing::info!(
        "Using PagerDuty API at {} (time zone {})",
        config.pagerduty.api_url,
        config.pagerduty.time_zone
    );
    if !config.pagerduty.ignored_team_ids.is_empty() {
        tracing::info!(
            "Ignoring services of {} team(s)",
            config.pagerduty.ignored_team_ids.len()
        );
    }

    let api: Arc<dyn PagerDutyApi> = Arc::new(PagerDutyClient::new(&config.pagerduty)?);
    Ok(wire(api, config))
}

/// Wire the pipeline around any gateway implementation.
pub fn wire(api: Arc<dyn PagerDutyApi>, config: &Config) -> (Arc<Poller>, Arc<CalendarProjector>) {
    let aggregator = Aggregator::new(api.clone(), AggregatorSettings::from_config(config));
    let poller = Arc::new(Poller::new(Arc::new(aggregator), config.poll.interval()));
    let calendar = Arc::new(CalendarProjector::new(
        api,
        config.pagerduty.time_zone.clone(),
    ));
    (poller, calendar)
}

/// Spawn background workers:
/// - the poll loop, refreshing the snapshot every interval
/// - calendar projection, re-run whenever a new snapshot is published
///
/// These are spawned as `tokio::spawn` tasks. The function returns a vector of
/// `JoinHandle<()>`s so callers can await task shutdown. Each worker listens
/// for a shutdown notification via a `tokio::sync::broadcast::Sender<()>`.
pub fn spawn_background_workers(
    state: Arc<crate::AppState>,
    shutdown: broadcast::Sender<()>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();

    // Poll worker
    {
        let poller = state.poller.clone();
        handles.push(tokio::spawn(poller.run(shutdown.subscribe())));
    }

    // Calendar projection worker
    {
        let mut shutdown_rx = shutdown.subscribe();
        let updates = state.poller.subscribe();
        let calendar = state.calendar.clone();
        let horizon = state.config.poll.horizon();
        handles.push(tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_rx.recv() => {}
                _ = project_on_publish(calendar, updates, horizon) => {}
            }
            tracing::info!("Calendar projection worker shutting down");
        }));
    }

    handles
}

/// Re-project the calendar for `[now, now + horizon]` on every publish.
///
/// Returns when the poller is dropped.
async fn project_on_publish(
    calendar: Arc<CalendarProjector>,
    mut updates: watch::Receiver<Arc<Snapshot>>,
    horizon: chrono::Duration,
) {
    loop {
        let snapshot = updates.borrow_and_update().clone();
        if !snapshot.is_placeholder() {
            let now = Utc::now();
            let projected = match window_end(now, horizon) {
                Ok(end) => calendar.project(&snapshot, now, end).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = projected {
                tracing::warn!("Calendar projection failed; keeping previous events: {}", e);
            }
        }

        if updates.changed().await.is_err() {
            break;
        }
    }
}
