//! Background maintenance: waitlist expiry and index rebuilds.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::core::MatchEngine;
use crate::runtime::Spawn;
use crate::util::clock::now_ms;

/// Result of one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Waitlist entries expired.
    pub expired: usize,
    /// Graph size when the index was rebuilt.
    pub rebuilt: Option<usize>,
}

/// Periodically expires overdue entries and rebuilds the index when enough
/// changes accumulated.
pub struct ExpirySweeper {
    engine: Arc<MatchEngine>,
    interval: Duration,
    shutdown_tx: watch::Sender<bool>,
}

impl ExpirySweeper {
    /// Create a sweeper running every `interval`.
    pub fn new(engine: Arc<MatchEngine>, interval: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            engine,
            interval,
            shutdown_tx,
        }
    }

    /// One maintenance pass at `now_ms`.
    pub fn sweep_once(&self, now_ms: u128) -> SweepReport {
        sweep(&self.engine, now_ms)
    }

    /// Start the periodic loop on `spawner`. The first pass runs immediately.
    pub fn start<S: Spawn>(&self, spawner: &S) {
        let engine = Arc::clone(&self.engine);
        let interval = self.interval;
        let mut shutdown = self.shutdown_tx.subscribe();
        spawner.spawn(async move {
            if *shutdown.borrow() {
                return;
            }
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let engine = Arc::clone(&engine);
                        let pass = tokio::task::spawn_blocking(move || sweep(&engine, now_ms()));
                        if let Err(e) = pass.await {
                            tracing::error!(error = %e, "sweep pass panicked");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::info!("expiry sweeper shutting down");
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Stop the loop after the current pass.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

fn sweep(engine: &MatchEngine, now_ms: u128) -> SweepReport {
    let expired = engine.expire_overdue(now_ms);
    let rebuilt = engine.maybe_rebuild_index();
    if expired > 0 || rebuilt.is_some() {
        tracing::debug!(expired, ?rebuilt, "sweep pass");
    }
    SweepReport { expired, rebuilt }
}
