//! Background idle sweeping and orderly shutdown.
//!
//! Startup is lazy: nothing runs until the first acquisition, except the idle
//! sweeper if one is started. Shutdown refuses new acquisitions, stops the
//! sweeper, then drains the pool cache with a deadline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::client::ClientFactory;
use crate::pool::PoolCache;

/// Outcome of draining the pool cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Entries closed after their leases were released.
    pub closed: usize,
    /// Entries force-closed at the deadline.
    pub forced: usize,
    /// Time spent draining.
    pub elapsed: Duration,
}

impl DrainReport {
    /// Check if every entry was closed without forcing.
    pub fn is_clean(&self) -> bool {
        self.forced == 0
    }
}

/// Periodically closes idle pools.
///
/// Dropping the sweeper aborts its task; [`IdleSweeper::stop`] lets a sweep
/// in progress finish first.
pub struct IdleSweeper {
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl IdleSweeper {
    /// Spawn a sweeper that runs every `period`, first after one period.
    pub fn spawn<F: ClientFactory>(pools: PoolCache<F>, period: Duration) -> Self {
        let (stop, mut stopped) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(period = ?period, "Idle sweeper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = pools.sweep_idle().await;
                        if evicted == 0 {
                            debug!("No idle tenant pools to close");
                        }
                    }
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }

            debug!("Idle sweeper stopped");
        });

        Self {
            stop,
            task: Some(task),
        }
    }

    /// Stop the sweeper and wait for it to exit.
    pub async fn stop(mut self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Check if the sweeper task is still running.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for IdleSweeper {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for IdleSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleSweeper")
            .field("running", &self.is_running())
            .finish()
    }
}

/// Owns the sweeper and runs shutdown exactly once.
#[derive(Debug, Default)]
pub struct LifecycleManager {
    shutdown_started: AtomicBool,
    sweeper: Mutex<Option<IdleSweeper>>,
}

impl LifecycleManager {
    /// Create a lifecycle manager with no sweeper.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the idle sweeper. Returns `false` if one is already running or
    /// shutdown has begun.
    pub fn start_sweeper<F: ClientFactory>(&self, pools: &PoolCache<F>) -> bool {
        if self.is_shutting_down() {
            return false;
        }

        let mut sweeper = self.sweeper.lock();
        if sweeper.as_ref().is_some_and(IdleSweeper::is_running) {
            return false;
        }
        *sweeper = Some(IdleSweeper::spawn(pools.clone(), pools.config().sweep_interval));
        true
    }

    /// Check if shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_started.load(Ordering::Acquire)
    }

    /// Refuse new acquisitions, stop the sweeper and drain.
    ///
    /// Entries still referenced after `drain_timeout` are force-closed and
    /// logged; shutdown still completes. Calls after the first return an empty
    /// report immediately.
    pub async fn shutdown<F: ClientFactory>(
        &self,
        pools: &PoolCache<F>,
        drain_timeout: Duration,
    ) -> DrainReport {
        if self.shutdown_started.swap(true, Ordering::AcqRel) {
            debug!("Shutdown already started");
            return DrainReport::default();
        }

        let deadline = Instant::now() + drain_timeout;
        info!(
            drain_timeout = ?drain_timeout,
            open_pools = pools.open_pools(),
            "Shutting down tenant connection manager"
        );
        pools.begin_shutdown();

        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.stop().await;
        }

        let report = pools
            .drain(deadline.saturating_duration_since(Instant::now()))
            .await;

        if !report.is_clean() {
            warn!(
                forced = report.forced,
                drain_timeout = ?drain_timeout,
                "Drain timeout reached; in-use tenant pools were force-closed"
            );
        }
        info!(
            closed = report.closed,
            forced = report.forced,
            elapsed = ?report.elapsed,
            "Tenant connection manager shut down"
        );
        report
    }
}
