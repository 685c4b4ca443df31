//! Adaptive session poller.
//!
//! One task per session view fetches snapshots sequentially, so at most one
//! request is ever in flight and responses are handed over in issue order.
//! Stopping drops the in-flight request; nothing it returns is delivered.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anketa_types::PollSnapshot;
use async_trait::async_trait;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::{ClientError, SessionApi};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    pub active_interval: Duration,
    pub idle_interval: Duration,
    pub degraded_interval: Duration,
    pub hidden_interval: Duration,
    pub backoff_ceiling: Duration,
    /// No activity for longer than this switches to `idle_interval`.
    pub idle_threshold: Duration,
    /// Consecutive failures before a warning and `degraded_interval`.
    pub warning_threshold: u32,
    /// Consecutive failures before `backoff_ceiling`.
    pub backoff_threshold: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            active_interval: Duration::from_secs(2),
            idle_interval: Duration::from_secs(5),
            degraded_interval: Duration::from_secs(15),
            hidden_interval: Duration::from_secs(30),
            backoff_ceiling: Duration::from_secs(60),
            idle_threshold: Duration::from_secs(60),
            warning_threshold: 3,
            backoff_threshold: 5,
        }
    }
}

/// Picks the delay before the next cycle; the first matching rule wins.
pub fn select_poll_interval(
    config: &PollerConfig,
    hidden: bool,
    consecutive_failures: u32,
    idle_for: Duration,
) -> Duration {
    if hidden {
        return config.hidden_interval;
    }
    if consecutive_failures >= config.backoff_threshold {
        return config.backoff_ceiling;
    }
    if consecutive_failures >= config.warning_threshold {
        return config.degraded_interval;
    }
    if idle_for > config.idle_threshold {
        return config.idle_interval;
    }
    config.active_interval
}

/// View visibility and user activity, shared between the view and its poller.
#[derive(Debug)]
pub struct PollerSignals {
    hidden: AtomicBool,
    last_activity: Mutex<Instant>,
    wake: Notify,
}

impl Default for PollerSignals {
    fn default() -> Self {
        Self {
            hidden: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
            wake: Notify::new(),
        }
    }
}

impl PollerSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Becoming visible again triggers an immediate cycle.
    pub fn set_hidden(&self, hidden: bool) {
        let was_hidden = self.hidden.swap(hidden, Ordering::SeqCst);
        if was_hidden && !hidden {
            self.wake.notify_one();
        }
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden.load(Ordering::SeqCst)
    }

    pub fn record_activity(&self) {
        match self.last_activity.lock() {
            Ok(mut last) => *last = Instant::now(),
            Err(poisoned) => *poisoned.into_inner() = Instant::now(),
        }
    }

    pub fn idle_for(&self) -> Duration {
        let last = match self.last_activity.lock() {
            Ok(last) => *last,
            Err(poisoned) => *poisoned.into_inner(),
        };
        last.elapsed()
    }
}

/// Receives poll results on the poller task.
#[async_trait]
pub trait PollObserver: Send + Sync {
    /// Called right before each fetch is issued.
    fn on_cycle_start(&self) {}
    async fn on_snapshot(&self, snapshot: PollSnapshot);
    /// Called once per failure streak when it reaches the warning threshold.
    async fn on_warning(&self, consecutive_failures: u32, error: &ClientError);
    /// The session is gone; the poller has stopped for good.
    async fn on_not_found(&self);
}

#[derive(Debug, Default)]
struct PollCycleStats {
    consecutive_failures: AtomicU32,
    cycles: AtomicU64,
}

#[derive(Debug)]
pub struct PollerHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    stats: Arc<PollCycleStats>,
}

impl PollerHandle {
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.stats.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Completed fetch cycles, successful or not.
    pub fn cycles(&self) -> u64 {
        self.stats.cycles.load(Ordering::SeqCst)
    }

    /// Cancels the in-flight fetch and the pending timer. Never fails.
    pub async fn shutdown(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

pub fn start_session_poller(
    api: Arc<dyn SessionApi>,
    session_id: &str,
    config: PollerConfig,
    signals: Arc<PollerSignals>,
    observer: Arc<dyn PollObserver>,
) -> PollerHandle {
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let stats = Arc::new(PollCycleStats::default());
    let task = tokio::spawn(run_poll_loop(
        api,
        session_id.to_string(),
        config,
        signals,
        observer,
        Arc::clone(&stats),
        shutdown_rx,
    ));
    PollerHandle {
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
        stats,
    }
}

async fn run_poll_loop(
    api: Arc<dyn SessionApi>,
    session_id: String,
    config: PollerConfig,
    signals: Arc<PollerSignals>,
    observer: Arc<dyn PollObserver>,
    stats: Arc<PollCycleStats>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut consecutive_failures = 0_u32;
    let mut warned = false;
    tracing::debug!(session_id = %session_id, "poller started");

    loop {
        observer.on_cycle_start();
        let result = tokio::select! {
            result = api.poll(&session_id) => result,
            _ = &mut shutdown_rx => break,
        };
        stats.cycles.fetch_add(1, Ordering::SeqCst);

        match result {
            Ok(snapshot) => {
                consecutive_failures = 0;
                warned = false;
                let terminal = snapshot.status.is_terminal();
                observer.on_snapshot(snapshot).await;
                if terminal {
                    tracing::debug!(session_id = %session_id, "poller stopped on terminal status");
                    break;
                }
            }
            Err(ClientError::NotFound(_)) => {
                tracing::info!(session_id = %session_id, "session not found; polling stopped");
                observer.on_not_found().await;
                break;
            }
            Err(error) if !error.counts_as_failure() => {}
            Err(error) => {
                consecutive_failures = consecutive_failures.saturating_add(1);
                tracing::debug!(
                    session_id = %session_id,
                    consecutive_failures,
                    error = %error,
                    "poll cycle failed"
                );
                if consecutive_failures >= config.warning_threshold && !warned {
                    warned = true;
                    observer.on_warning(consecutive_failures, &error).await;
                }
            }
        }
        stats
            .consecutive_failures
            .store(consecutive_failures, Ordering::SeqCst);

        let interval = select_poll_interval(
            &config,
            signals.is_hidden(),
            consecutive_failures,
            signals.idle_for(),
        );
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = signals.wake.notified() => {}
            _ = &mut shutdown_rx => break,
        }
    }
}
