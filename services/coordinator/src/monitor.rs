//! Background monitor worker.
//!
//! Runs the lifecycle monitor cycle on a periodic interval until shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::lifecycle::AgentLifecycleManager;

/// Shortest period the loop will tick at.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Worker that drives [`AgentLifecycleManager::tick`].
pub struct MonitorWorker {
    lifecycle: Arc<AgentLifecycleManager>,
    interval: Duration,
}

impl MonitorWorker {
    /// Create a worker ticking at the manager's check interval, raised to
    /// [`MIN_INTERVAL`] if shorter.
    pub fn new(lifecycle: Arc<AgentLifecycleManager>) -> Self {
        let configured = lifecycle.config().check_interval;
        let interval = configured.max(MIN_INTERVAL);
        if interval != configured {
            warn!(
                configured_ms = configured.as_millis() as u64,
                interval_ms = interval.as_millis() as u64,
                "Check interval too short, clamping"
            );
        }
        Self { lifecycle, interval }
    }

    /// Run the monitor loop until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Starting agent monitor"
        );

        let mut interval = tokio::time::interval(self.interval);
        // Don't immediately tick on startup - wait for first interval
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    // Individual errors are logged where they occur.
                    let report = self.lifecycle.tick().await;
                    if !report.errors.is_empty() {
                        warn!(errors = report.errors.len(), "Monitor cycle finished with errors");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Agent monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Spawn the loop onto the runtime.
    pub fn spawn(self) -> MonitorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move { self.run(shutdown_rx).await });
        MonitorHandle { shutdown_tx, join }
    }
}

/// Handle to a spawned monitor loop.
pub struct MonitorHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn is_running(&self) -> bool {
        !self.join.is_finished()
    }

    /// Signal shutdown and wait for the current cycle to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "Agent monitor task panicked");
        }
    }
}
