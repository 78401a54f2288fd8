//! Poll scheduler: runs the snapshot source on a fixed interval and publishes
//! each successful result.
//!
//! The published value is an `Arc<Snapshot>` inside a `watch` channel, so a
//! publish is one atomic swap and every subscriber is woken. Failures stay
//! behind this boundary: readers always get the last good snapshot (or the
//! empty placeholder).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::{AppError, AppResult};
use crate::models::Snapshot;
use crate::services::aggregator::SnapshotSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollState {
    Uninitialized,
    Ready,
    Refreshing,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollStatus {
    pub state: PollState,
    /// Set when the latest refresh failed; cleared by the next success.
    pub degraded: bool,
    /// Token rejected upstream; polling has stopped.
    pub auth_failed: bool,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

impl Default for PollStatus {
    fn default() -> Self {
        Self {
            state: PollState::Uninitialized,
            degraded: false,
            auth_failed: false,
            last_success: None,
            last_error: None,
            consecutive_failures: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshOutcome {
    Published,
    /// Another refresh was already in flight.
    Skipped,
    Failed,
    /// Authentication failed; the loop will not retry.
    Halted,
}

pub struct Poller {
    source: Arc<dyn SnapshotSource>,
    interval: Duration,
    published: watch::Sender<Arc<Snapshot>>,
    in_flight: Mutex<()>,
    status: RwLock<PollStatus>,
}

impl Poller {
    pub fn new(source: Arc<dyn SnapshotSource>, interval: Duration) -> Self {
        let (published, _) = watch::channel(Arc::new(Snapshot::empty()));
        Self {
            source,
            interval,
            published,
            in_flight: Mutex::new(()),
            status: RwLock::new(PollStatus::default()),
        }
    }

    /// Latest published snapshot. Never waits on the network.
    pub fn current_snapshot(&self) -> Arc<Snapshot> {
        self.published.borrow().clone()
    }

    /// Receiver that is notified on every publish.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.published.subscribe()
    }

    pub async fn status(&self) -> PollStatus {
        self.status.read().await.clone()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// First load, awaited at startup.
    ///
    /// An authentication failure is returned to the caller. Any other failure
    /// leaves the poller ready but degraded, serving the empty placeholder
    /// until the background loop succeeds.
    pub async fn initialize(&self) -> AppResult<()> {
        info!("Loading initial PagerDuty snapshot");
        let _guard = self.in_flight.lock().await;

        match self.source.refresh().await {
            Ok(snapshot) => {
                self.publish(snapshot).await;
                Ok(())
            }
            Err(e) if e.is_auth() => {
                let mut status = self.status.write().await;
                status.auth_failed = true;
                status.degraded = true;
                status.last_error = Some(e.to_string());
                error!("Initial PagerDuty load rejected: {}", e);
                Err(e)
            }
            Err(e) => {
                self.record_failure(&e).await;
                self.status.write().await.state = PollState::Ready;
                warn!("Initial PagerDuty load failed; continuing degraded: {}", e);
                Ok(())
            }
        }
    }

    /// Run one refresh unless another one is in flight.
    pub async fn refresh_once(&self) -> RefreshOutcome {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!("Refresh already in flight; skipping tick");
            return RefreshOutcome::Skipped;
        };

        if self.status.read().await.auth_failed {
            return RefreshOutcome::Halted;
        }

        let previous_state = {
            let mut status = self.status.write().await;
            let previous = status.state;
            status.state = PollState::Refreshing;
            previous
        };

        match self.source.refresh().await {
            Ok(snapshot) => {
                self.publish(snapshot).await;
                RefreshOutcome::Published
            }
            Err(e) => {
                let auth = e.is_auth();
                self.record_failure(&e).await;
                let mut status = self.status.write().await;
                status.state = if previous_state == PollState::Uninitialized {
                    PollState::Uninitialized
                } else {
                    PollState::Ready
                };
                if auth {
                    status.auth_failed = true;
                    RefreshOutcome::Halted
                } else {
                    RefreshOutcome::Failed
                }
            }
        }
    }

    /// Background loop. The initial load is expected to have run already, so
    /// the first refresh happens one interval after start.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Poller shutting down");
                    break;
                }
                _ = ticker.tick() => {}
            }

            if self.refresh_once().await == RefreshOutcome::Halted {
                error!("PagerDuty token rejected; polling stopped until the token is replaced");
                break;
            }
        }
    }

    async fn publish(&self, snapshot: Snapshot) {
        let fetched_at = snapshot.fetched_at.unwrap_or_else(Utc::now);
        self.published.send_replace(Arc::new(snapshot));

        let mut status = self.status.write().await;
        if status.degraded {
            info!(
                "PagerDuty refresh recovered after {} failure(s)",
                status.consecutive_failures
            );
        }
        status.state = PollState::Ready;
        status.degraded = false;
        status.last_success = Some(fetched_at);
        status.last_error = None;
        status.consecutive_failures = 0;
    }

    async fn record_failure(&self, e: &AppError) {
        match e {
            AppError::UnexpectedShape(msg) => {
                error!("PagerDuty response did not match the expected contract: {}", msg)
            }
            AppError::Auth(msg) => error!("PagerDuty authentication failed: {}", msg),
            other => warn!("PagerDuty refresh failed: {}", other),
        }

        let mut status = self.status.write().await;
        status.degraded = true;
        status.last_error = Some(e.to_string());
        status.consecutive_failures = status.consecutive_failures.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::aggregator::{Aggregator, AggregatorSettings};
    use crate::services::testing::{self, Failure, FakePagerDuty};
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Source that replays a script of results.
    struct Scripted {
        results: std::sync::Mutex<VecDeque<AppResult<Snapshot>>>,
        delay: Duration,
    }

    impl Scripted {
        fn new(results: Vec<AppResult<Snapshot>>) -> Self {
            Self {
                results: std::sync::Mutex::new(results.into()),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl SnapshotSource for Scripted {
        async fn refresh(&self) -> AppResult<Snapshot> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(AppError::TransientFetch("script exhausted".into())))
        }
    }

    fn snapshot(user: &str) -> Snapshot {
        Snapshot {
            user_id: user.to_string(),
            fetched_at: Some(Utc::now()),
            ..Snapshot::empty()
        }
    }

    fn aggregator(api: Arc<FakePagerDuty>) -> Arc<dyn SnapshotSource> {
        Arc::new(Aggregator::new(
            api,
            AggregatorSettings {
                ignored_team_ids: Default::default(),
                time_zone: "UTC".to_string(),
                horizon: chrono::Duration::days(14),
            },
        ))
    }

    #[tokio::test]
    async fn failed_cycle_keeps_previous_snapshot() {
        let api = Arc::new(
            FakePagerDuty::new()
                .with_object("users/me", testing::user("U1", &[("T1", "Platform")]))
                .with_collection("services", vec![testing::service("S1", "API", &["T1"])])
                .with_collection(
                    "incidents",
                    vec![testing::incident("I1", "S1", "triggered", "high", "U1")],
                ),
        );
        let poller = Poller::new(aggregator(api.clone()), Duration::from_secs(60));

        poller.initialize().await.unwrap();
        let first = poller.current_snapshot();
        assert_eq!(first.incidents.len(), 1);

        api.fail("incidents", Failure::Transient);
        assert_eq!(poller.refresh_once().await, RefreshOutcome::Failed);

        let after = poller.current_snapshot();
        assert!(Arc::ptr_eq(&first, &after));
        assert_eq!(*first, *after);

        let status = poller.status().await;
        assert!(status.degraded);
        assert_eq!(status.state, PollState::Ready);
        assert_eq!(status.consecutive_failures, 1);

        api.heal("incidents");
        assert_eq!(poller.refresh_once().await, RefreshOutcome::Published);
        assert!(!poller.status().await.degraded);
    }

    #[tokio::test]
    async fn first_load_failure_serves_placeholder() {
        let poller = Poller::new(
            Arc::new(Scripted::new(vec![
                Err(AppError::TransientFetch("timeout".into())),
                Ok(snapshot("U1")),
            ])),
            Duration::from_secs(60),
        );

        poller.initialize().await.unwrap();
        assert!(poller.current_snapshot().is_placeholder());
        assert!(poller.status().await.degraded);

        assert_eq!(poller.refresh_once().await, RefreshOutcome::Published);
        assert_eq!(poller.current_snapshot().user_id, "U1");
    }

    #[tokio::test]
    async fn auth_failure_on_first_load_is_surfaced() {
        let poller = Poller::new(
            Arc::new(Scripted::new(vec![Err(AppError::Auth("401".into()))])),
            Duration::from_secs(60),
        );
        let err = poller.initialize().await.unwrap_err();
        assert!(err.is_auth());
        assert_eq!(poller.status().await.state, PollState::Uninitialized);
    }

    #[tokio::test]
    async fn auth_failure_halts_polling() {
        let poller = Poller::new(
            Arc::new(Scripted::new(vec![
                Ok(snapshot("U1")),
                Err(AppError::Auth("token revoked".into())),
                Ok(snapshot("U2")),
            ])),
            Duration::from_secs(60),
        );
        poller.initialize().await.unwrap();
        assert_eq!(poller.refresh_once().await, RefreshOutcome::Halted);
        assert_eq!(poller.refresh_once().await, RefreshOutcome::Halted);
        assert_eq!(poller.current_snapshot().user_id, "U1");
        assert!(poller.status().await.auth_failed);
    }

    #[tokio::test]
    async fn overlapping_refresh_is_skipped() {
        let mut source = Scripted::new(vec![Ok(snapshot("U1")), Ok(snapshot("U2"))]);
        source.delay = Duration::from_millis(50);
        let poller = Arc::new(Poller::new(Arc::new(source), Duration::from_secs(60)));

        let (a, b) = tokio::join!(poller.refresh_once(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            poller.refresh_once().await
        });

        assert_eq!(a, RefreshOutcome::Published);
        assert_eq!(b, RefreshOutcome::Skipped);
        assert_eq!(poller.current_snapshot().user_id, "U1");
    }

    #[tokio::test]
    async fn subscribers_see_each_publish() {
        let poller = Poller::new(
            Arc::new(Scripted::new(vec![Ok(snapshot("U1")), Ok(snapshot("U2"))])),
            Duration::from_secs(60),
        );
        let mut rx = poller.subscribe();

        poller.initialize().await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().user_id, "U1");

        poller.refresh_once().await;
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().user_id, "U2");
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_refreshes_on_interval_until_shutdown() {
        let poller = Arc::new(Poller::new(
            Arc::new(Scripted::new(vec![
                Ok(snapshot("U1")),
                Ok(snapshot("U2")),
                Ok(snapshot("U3")),
            ])),
            Duration::from_secs(60),
        ));
        poller.initialize().await.unwrap();

        let (tx, rx) = broadcast::channel(1);
        let mut updates = poller.subscribe();
        let handle = tokio::spawn(poller.clone().run(rx));

        updates.changed().await.unwrap();
        assert_eq!(updates.borrow_and_update().user_id, "U2");

        tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
