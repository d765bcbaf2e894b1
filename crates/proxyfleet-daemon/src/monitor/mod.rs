//! Periodic health and accounting tasks.
//!
//! Four interval jobs run for the daemon's lifetime: local engine
//! liveness, peer reconciliation, per-user usage accounting, and node
//! usage accounting. Each carries the shutdown watch channel and exits
//! promptly when it flips.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::orchestration::{ManagerError, Orchestrator};

/// Periods of the monitor jobs.
#[derive(Debug, Clone, Copy)]
pub struct MonitorIntervals {
    pub liveness: Duration,
    pub reconcile: Duration,
    pub user_usage: Duration,
    pub node_usage: Duration,
}

impl Default for MonitorIntervals {
    fn default() -> Self {
        Self {
            liveness: Duration::from_secs(15),
            reconcile: Duration::from_secs(15),
            user_usage: Duration::from_secs(10),
            node_usage: Duration::from_secs(10),
        }
    }
}

/// Spawn all monitor jobs. The returned handles finish once `shutdown`
/// flips to `true` (or its sender is dropped).
pub fn spawn_monitors(
    orchestrator: Arc<Orchestrator>,
    intervals: MonitorIntervals,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let liveness = {
        let orchestrator = Arc::clone(&orchestrator);
        spawn_job("engine-liveness", intervals.liveness, shutdown.clone(), move || {
            let orchestrator = Arc::clone(&orchestrator);
            async move { orchestrator.ensure_local_engine().await }
        })
    };
    let reconcile = {
        let orchestrator = Arc::clone(&orchestrator);
        spawn_job("node-reconcile", intervals.reconcile, shutdown.clone(), move || {
            let orchestrator = Arc::clone(&orchestrator);
            async move { orchestrator.reconcile_nodes().await }
        })
    };
    let user_usage = {
        let orchestrator = Arc::clone(&orchestrator);
        spawn_job("user-usage", intervals.user_usage, shutdown.clone(), move || {
            let orchestrator = Arc::clone(&orchestrator);
            async move { orchestrator.collect_user_usage().await }
        })
    };
    let node_usage = {
        let orchestrator = Arc::clone(&orchestrator);
        spawn_job("node-usage", intervals.node_usage, shutdown, move || {
            let orchestrator = Arc::clone(&orchestrator);
            async move { orchestrator.collect_node_usage().await }
        })
    };
    vec![liveness, reconcile, user_usage, node_usage]
}

fn spawn_job<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut job: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), ManagerError>> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = job().await {
                        warn!(job = name, error = %e, "Periodic job failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(job = name, "Monitor stopping");
                        return;
                    }
                }
            }
        }
    })
}
