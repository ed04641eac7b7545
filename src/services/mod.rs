//! The boundary operations of the coordinator.
//!
//! A transport layer maps its requests onto the operations of [`Services`]:
//!
//! - [`Services::submit_update`]: verifies, deduplicates and enqueues a signed update
//! - [`Services::trigger_aggregation`]: runs an aggregation round of a model
//! - [`Services::read_model`]: reads a model version together with the version history
//! - [`Services::read_metrics`]: reads the aggregation parameters and ingestion counters
//!
//! Every operation is bounded by the configured request timeout.

pub mod auth;
mod error;

pub use self::{
    auth::{Authenticator, Caller, DevAuthenticator, Role},
    error::{RejectedReason, ServiceError},
};

use std::{future::Future, panic, time::Duration};

use serde::Serialize;
use tokio::{task::JoinHandle, time};
use tracing::{debug, info, warn};

use crate::{
    crypto,
    ledger::Ledger,
    message::{is_identifier, WeightUpdate},
    registry::{ModelVersion, Registry},
    settings::{AggregationSettings, RetentionSettings, SecuritySettings},
    state_machine::{Coordinator, RoundOutcome, Scheduler},
    storage::{keys, KeyValueStore},
};

/// The acknowledgement of an accepted update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Accepted {
    pub accepted: bool,
    /// The ledger key of the update.
    pub key: String,
}

/// A model version together with the history of its model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelView {
    #[serde(flatten)]
    pub model: ModelVersion,
    /// The most recent version ids, newest first.
    pub history: Vec<u64>,
}

/// Aggregation parameters and counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub active_model_count: u64,
    pub min_participants: u64,
    pub aggregation_threshold: u64,
    /// The pending updates of the requested model.
    pub pending: u64,
}

/// The boundary operations on top of a key-value store.
#[derive(Debug, Clone)]
pub struct Services<S> {
    store: S,
    ledger: Ledger<S>,
    registry: Registry<S>,
    coordinator: Coordinator<S>,
    security: SecuritySettings,
    aggregation: AggregationSettings,
    pending_ttl: Duration,
}

impl<S> Services<S>
where
    S: KeyValueStore,
{
    pub fn new(
        store: S,
        security: SecuritySettings,
        aggregation: AggregationSettings,
        retention: RetentionSettings,
    ) -> Self {
        Self {
            ledger: Ledger::new(store.clone()),
            registry: Registry::new(store.clone(), &retention),
            coordinator: Coordinator::new(store.clone(), &aggregation, &retention),
            store,
            security,
            aggregation,
            pending_ttl: retention.pending_ttl(),
        }
    }

    /// Checks if the store is ready to process requests.
    pub async fn is_ready(&mut self) -> Result<(), ServiceError> {
        self.store
            .is_ready()
            .await
            .map_err(ServiceError::StoreUnavailable)
    }

    /// Creates a [`Scheduler`] that triggers rounds on the same store.
    pub fn scheduler(&self) -> Scheduler<S> {
        Scheduler::new(
            self.store.clone(),
            self.coordinator.clone(),
            self.aggregation.threshold,
            self.aggregation.interval(),
        )
    }

    /// Accepts a signed update.
    ///
    /// `raw` must be the exact bytes the signature was computed over. The checks run in this
    /// order, and the first failing one rejects the update:
    ///
    /// 1. the caller has the site or the admin role
    /// 2. the payload size is within the limit
    /// 3. the signature matches the raw payload
    /// 4. the payload is a valid update
    /// 5. the timestamp is within the freshness window
    /// 6. the nonce has not been used within the freshness window
    ///
    /// Only an update that passes all checks is written to the ledger. The nonce reservation
    /// and the write run as a detached task that a timeout does not interrupt. An update whose
    /// request timed out is either enqueued, in which case a retry reports a replay, or its
    /// nonce is released again and a retry is accepted.
    pub async fn submit_update(
        &mut self,
        raw: &[u8],
        signature_hex: &str,
        caller: &Caller,
    ) -> Result<Accepted, ServiceError> {
        let timeout = self.aggregation.request_timeout();
        let result = bounded(timeout, async {
            let update = self.verify(raw, signature_hex, caller)?;
            let ingestion = tokio::spawn(ingest(
                self.ledger.clone(),
                update,
                caller.identity.clone(),
                self.security.freshness_window(),
                self.pending_ttl,
            ));
            detached(ingestion).await
        })
        .await;
        match &result {
            Ok(accepted) => info!("accepted update {} from {}", accepted.key, caller.identity),
            Err(e) => warn!("rejected update from {}: {}", caller.identity, e),
        }
        result
    }

    fn verify(
        &self,
        raw: &[u8],
        signature_hex: &str,
        caller: &Caller,
    ) -> Result<WeightUpdate, ServiceError> {
        caller.require_any(&[Role::Site, Role::Admin])?;

        if raw.len() > self.security.max_payload_bytes {
            return Err(RejectedReason::PayloadTooLarge.into());
        }
        if !crypto::verify(raw, signature_hex, self.security.hmac_secret.expose()) {
            return Err(RejectedReason::BadSignature.into());
        }
        let update = WeightUpdate::parse(raw).map_err(|e| {
            debug!("malformed update: {}", e);
            ServiceError::from(RejectedReason::MalformedPayload)
        })?;
        if !crypto::is_recent(update.timestamp, self.security.freshness_window_ms) {
            return Err(RejectedReason::StaleTimestamp.into());
        }
        Ok(update)
    }

    /// Runs an aggregation round of `model_name`. Requires the admin role.
    ///
    /// The round runs as a detached task. If the request times out, the round still runs to
    /// its end and releases the model lock.
    pub async fn trigger_aggregation(
        &mut self,
        model_name: &str,
        caller: &Caller,
    ) -> Result<RoundOutcome, ServiceError> {
        caller.require_any(&[Role::Admin])?;
        check_model_name(model_name)?;
        let timeout = self.aggregation.request_timeout();
        let mut coordinator = self.coordinator.clone();
        let model = model_name.to_string();
        let round = tokio::spawn(async move {
            Ok::<_, ServiceError>(coordinator.trigger(&model).await?)
        });
        let outcome = bounded(timeout, detached(round)).await?;
        info!(
            "round of {} triggered by {}: {:?}",
            model_name, caller.identity, outcome
        );
        Ok(outcome)
    }

    /// Reads a version of `model_name`, or the latest one if `version` is `None`.
    ///
    /// # Errors
    /// Fails with [`ServiceError::NotFound`] if there is no such version, which includes a
    /// latest pointer that has expired.
    pub async fn read_model(
        &mut self,
        model_name: &str,
        version: Option<u64>,
    ) -> Result<ModelView, ServiceError> {
        check_model_name(model_name)?;
        let timeout = self.aggregation.request_timeout();
        bounded(timeout, async {
            let model = self
                .registry
                .read(model_name, version)
                .await
                .map_err(ServiceError::StoreUnavailable)?
                .ok_or(ServiceError::NotFound)?;
            let history = self
                .registry
                .history(model_name)
                .await
                .map_err(ServiceError::StoreUnavailable)?;
            Ok(ModelView { model, history })
        })
        .await
    }

    /// Reads the aggregation parameters and the number of pending updates of `model_name`.
    pub async fn read_metrics(&mut self, model_name: &str) -> Result<Metrics, ServiceError> {
        check_model_name(model_name)?;
        let timeout = self.aggregation.request_timeout();
        bounded(timeout, async {
            let active_model_count = self
                .store
                .set_cardinality(keys::MODELS)
                .await
                .map_err(ServiceError::StoreUnavailable)?;
            let pending = self
                .ledger
                .count_pending(model_name)
                .await
                .map_err(ServiceError::StoreUnavailable)?;
            Ok(Metrics {
                active_model_count,
                min_participants: self.aggregation.min_participants,
                aggregation_threshold: self.aggregation.threshold,
                pending,
            })
        })
        .await
    }
}

fn check_model_name(model_name: &str) -> Result<(), ServiceError> {
    if model_name.len() <= 64 && is_identifier(model_name) {
        Ok(())
    } else {
        Err(ServiceError::InvalidModelName(model_name.to_string()))
    }
}

/// Reserves the nonce of `update` and enqueues it. The nonce is released again if the update
/// cannot be enqueued.
async fn ingest<S: KeyValueStore>(
    mut ledger: Ledger<S>,
    mut update: WeightUpdate,
    uploaded_by: String,
    nonce_ttl: Duration,
    pending_ttl: Duration,
) -> Result<Accepted, ServiceError> {
    let model_name = update.model_name.clone();
    let site_id = update.site_id.clone();
    let reserved = ledger
        .reserve_nonce(&model_name, &site_id, &update.nonce, nonce_ttl)
        .await
        .map_err(ServiceError::StoreUnavailable)?;
    if !reserved {
        return Err(RejectedReason::Replay.into());
    }

    update.stamp(chrono::Utc::now().timestamp_millis(), &uploaded_by);
    match ledger
        .enqueue_pending(&model_name, &site_id, &update, pending_ttl)
        .await
    {
        Ok(key) => Ok(Accepted {
            accepted: true,
            key,
        }),
        Err(e) => {
            // free the nonce again so that the same request can be retried
            if let Err(e) = ledger
                .release_nonce(&model_name, &site_id, &update.nonce)
                .await
            {
                warn!("releasing nonce {} failed: {}", update.nonce, e);
            }
            Err(ServiceError::StoreUnavailable(e))
        }
    }
}

/// Awaits a detached task. Dropping the returned future does not stop the task.
async fn detached<T>(task: JoinHandle<Result<T, ServiceError>>) -> Result<T, ServiceError> {
    match task.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => panic::resume_unwind(e.into_panic()),
        Err(_) => Err(ServiceError::Cancelled),
    }
}

async fn bounded<T, F>(timeout: Duration, operation: F) -> Result<T, ServiceError>
where
    F: Future<Output = Result<T, ServiceError>>,
{
    time::timeout(timeout, operation)
        .await
        .unwrap_or(Err(ServiceError::Timeout))
}
