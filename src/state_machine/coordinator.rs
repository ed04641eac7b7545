//! The [`Coordinator`] that runs aggregation rounds.

use std::time::Duration;

use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    aggregator::{self, WeightedUpdate, WeightingStrategy},
    ledger::{Ledger, LedgerEntry},
    registry::Registry,
    settings::{AggregationSettings, RetentionSettings},
    state_machine::{PhaseName, RoundError, RoundOutcome},
    storage::{
        keys::{EntryState, ModelKeys},
        KeyValueStore,
        LockToken,
    },
};

/// Runs aggregation rounds on top of the ledger and the registry.
#[derive(Debug, Clone)]
pub struct Coordinator<S> {
    store: S,
    ledger: Ledger<S>,
    registry: Registry<S>,
    min_participants: u64,
    weighting: WeightingStrategy,
    lock_ttl: Duration,
}

impl<S> Coordinator<S>
where
    S: KeyValueStore,
{
    pub fn new(store: S, aggregation: &AggregationSettings, retention: &RetentionSettings) -> Self {
        Self {
            ledger: Ledger::new(store.clone()),
            registry: Registry::new(store.clone(), retention),
            store,
            min_participants: aggregation.min_participants,
            weighting: aggregation.weighting,
            lock_ttl: retention.lock_ttl(),
        }
    }

    /// Runs one aggregation round of `model_name`.
    ///
    /// Returns [`RoundOutcome::InProgress`] without doing anything if another round of the
    /// model holds the lock.
    pub async fn trigger(&mut self, model_name: &str) -> Result<RoundOutcome, RoundError> {
        let span = info_span!("round", model = model_name);
        async move {
            let lock = ModelKeys::new(model_name).lock();
            let token = match self
                .store
                .acquire_lock(&lock, self.lock_ttl)
                .await
                .map_err(RoundError::Lock)?
            {
                Some(token) => token,
                None => {
                    info!("another round is in progress");
                    return Ok(RoundOutcome::InProgress);
                }
            };

            let outcome = self.run(model_name).await;
            self.release(&lock, &token).await;
            debug!("entering phase {}", PhaseName::Idle);
            outcome
        }
        .instrument(span)
        .await
    }

    async fn run(&mut self, model_name: &str) -> Result<RoundOutcome, RoundError> {
        debug!("entering phase {}", PhaseName::Promoting);
        self.ledger
            .promote(model_name)
            .await
            .map_err(RoundError::Promote)?;
        let entries = self
            .ledger
            .list_entries(model_name, EntryState::Processing)
            .await
            .map_err(RoundError::ReadProcessing)?;

        debug!("entering phase {}", PhaseName::Deciding);
        let participants = entries.len() as u64;
        if participants < self.min_participants {
            return self.revert(model_name, &entries).await;
        }

        debug!("entering phase {}", PhaseName::Aggregating);
        let weighted: Vec<WeightedUpdate> = entries
            .iter()
            .map(|entry| self.weighting.weigh(&entry.update))
            .collect();
        let result = aggregator::aggregate(model_name, &weighted)?;
        debug!(
            "aggregated {} updates in {} ms",
            participants, result.metadata.duration_ms
        );

        debug!("entering phase {}", PhaseName::Committing);
        let consumed: Vec<String> = entries.iter().map(|entry| entry.key.clone()).collect();
        let model = self
            .registry
            .commit(model_name, &result, &consumed)
            .await
            .map_err(RoundError::Commit)?;

        info!(
            "committed version {} from {} participants",
            model.version, participants
        );
        Ok(RoundOutcome::Aggregated {
            version: model.version,
            participants,
        })
    }

    async fn revert(
        &mut self,
        model_name: &str,
        entries: &[LedgerEntry],
    ) -> Result<RoundOutcome, RoundError> {
        debug!("entering phase {}", PhaseName::Reverting);
        self.ledger
            .revert(model_name, entries)
            .await
            .map_err(RoundError::Revert)?;
        info!(
            "not enough participants: {} of {}",
            entries.len(),
            self.min_participants
        );
        Ok(RoundOutcome::NotEnoughParticipants {
            participants: entries.len() as u64,
        })
    }

    async fn release(&mut self, lock: &str, token: &LockToken) {
        match self.store.release_lock(lock, token).await {
            Ok(true) => {}
            Ok(false) => warn!("the round lock expired before the round finished"),
            Err(e) => error!("releasing the round lock failed: {}", e),
        }
    }
}
