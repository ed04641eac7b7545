//! Periodic triggering of aggregation rounds.

use std::{future::Future, time::Duration};

use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::{
    ledger::Ledger,
    state_machine::{Coordinator, RoundOutcome},
    storage::{keys, KeyValueStore},
};

/// Visits every known model in a fixed interval and runs a round for each model with at least
/// `threshold` pending updates.
#[derive(Debug)]
pub struct Scheduler<S> {
    store: S,
    ledger: Ledger<S>,
    coordinator: Coordinator<S>,
    threshold: u64,
    interval: Duration,
}

impl<S> Scheduler<S>
where
    S: KeyValueStore,
{
    pub fn new(store: S, coordinator: Coordinator<S>, threshold: u64, interval: Duration) -> Self {
        Self {
            ledger: Ledger::new(store.clone()),
            store,
            coordinator,
            threshold,
            interval,
        }
    }

    /// Runs the scheduler until `shutdown` resolves.
    pub async fn run<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!(
            "scheduling rounds every {:?} at {} pending updates",
            self.interval, self.threshold
        );
        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutting down the scheduler");
                    return;
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    /// Visits every known model once and returns the outcomes of the rounds that ran.
    ///
    /// Failures are logged and do not stop the visit of the remaining models.
    pub async fn tick(&mut self) -> Vec<(String, RoundOutcome)> {
        let models = match self.store.set_members(keys::MODELS).await {
            Ok(models) => models,
            Err(e) => {
                warn!("listing the known models failed: {}", e);
                return Vec::new();
            }
        };

        let mut outcomes = Vec::new();
        for model in models {
            let pending = match self.ledger.count_pending(&model).await {
                Ok(pending) => pending,
                Err(e) => {
                    warn!("counting the pending updates of {} failed: {}", model, e);
                    continue;
                }
            };
            if pending < self.threshold {
                debug!("{} has {} pending updates", model, pending);
                continue;
            }
            match self.coordinator.trigger(&model).await {
                Ok(outcome) => outcomes.push((model, outcome)),
                Err(e) => error!("round of {} failed: {}", model, e),
            }
        }
        outcomes
    }
}
