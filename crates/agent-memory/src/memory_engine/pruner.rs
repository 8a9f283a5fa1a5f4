//! Periodic retirement of patterns that keep failing.
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::memory_engine::pattern_store::PatternStore;

pub struct PatternPruner {
    patterns: Arc<PatternStore>,
    interval: Duration,
    min_observations: u32,
    threshold: f64,
}

impl PatternPruner {
    pub fn new(patterns: Arc<PatternStore>, interval: Duration, min_observations: u32, threshold: f64) -> Self {
        Self { patterns, interval, min_observations, threshold }
    }

    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    /// Prune on every tick until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            "Pattern pruner running every {:?} (min observations {}, threshold {:.2})",
            self.interval, self.min_observations, self.threshold
        );
        // A zero period would panic inside `interval`.
        let mut tick = interval(self.interval.max(Duration::from_millis(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.prune_once().await {
                        warn!("Pattern prune cycle failed: {}", e);
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
        info!("Pattern pruner stopped");
    }

    pub async fn prune_once(&self) -> Result<Vec<String>> {
        let retired = self.patterns.retire_low_confidence(self.min_observations, self.threshold).await?;
        if retired.is_empty() {
            debug!("Prune cycle found nothing to retire");
        } else {
            info!("Retired {} low-confidence patterns", retired.len());
        }
        Ok(retired)
    }
}
