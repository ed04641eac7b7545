//! The model version registry.
//!
//! Every committed aggregation becomes an immutable [`ModelVersion`] stored under its own key.
//! Next to it the registry maintains a `latest` pointer, which is a cache that may expire, and a
//! bounded newest-first history of version ids. Versions that drop out of the history are not
//! deleted, they expire with the version time to live.

use std::time::Duration;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    aggregator::{AggregationMetadata, AggregationResult},
    message::Layers,
    settings::RetentionSettings,
    storage::{
        keys::{self, ModelKeys},
        Command,
        KeyValueStore,
        StorageResult,
    },
};

/// How often a commit bumps its version id after losing a race for it.
const MAX_VERSION_CLAIMS: u64 = 64;

/// An immutable aggregated model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelVersion {
    pub model_name: String,
    pub version: u64,
    pub weights: Layers,
    pub metadata: AggregationMetadata,
    /// Unix time of the commit, in milliseconds.
    pub created_at: i64,
}

/// The owner of the version, latest and history keys of every model.
#[derive(Debug, Clone)]
pub struct Registry<S> {
    store: S,
    version_ttl: Duration,
    latest_ttl: Duration,
    history_len: usize,
}

impl<S> Registry<S>
where
    S: KeyValueStore,
{
    pub fn new(store: S, retention: &RetentionSettings) -> Self {
        Self {
            store,
            version_ttl: retention.version_ttl(),
            latest_ttl: retention.latest_ttl(),
            history_len: retention.history_len,
        }
    }

    /// Commits `result` as the next version of `model_name` and deletes the `consumed` ledger
    /// entries it was aggregated from.
    ///
    /// The version id is the current time in milliseconds, but never less than one above the
    /// newest version in the history, so ids stay strictly increasing when the clock steps
    /// backwards. The id is claimed with a conditional write on the version key. If another
    /// writer holds that id already, the next id is tried.
    ///
    /// The latest pointer, the history and the deletion of `consumed` are one atomic write. If it
    /// fails, the claimed version record is left behind unlisted and the entries stay in place.
    pub async fn commit(
        &mut self,
        model_name: &str,
        result: &AggregationResult,
        consumed: &[String],
    ) -> StorageResult<ModelVersion> {
        let keys = ModelKeys::new(model_name);
        let created_at = chrono::Utc::now().timestamp_millis();
        let floor = self.head(model_name).await?.map_or(0, |head| head + 1);
        let first = (created_at.max(0) as u64).max(floor);

        let mut claimed = None;
        for version in first..first + MAX_VERSION_CLAIMS {
            let model = ModelVersion {
                model_name: model_name.to_string(),
                version,
                weights: result.weights.clone(),
                metadata: result.metadata.clone(),
                created_at,
            };
            let data = serde_json::to_string(&model)?;
            if self
                .store
                .set_if_absent(&keys.version(version), &data, self.version_ttl)
                .await?
            {
                claimed = Some((model, data));
                break;
            }
            debug!("version {} of {} already taken", version, model_name);
        }
        let (model, data) = claimed.ok_or_else(|| {
            anyhow!(
                "failed to claim a version id for {} in {} attempts",
                model_name,
                MAX_VERSION_CLAIMS
            )
        })?;

        let mut commands = vec![
            Command::SetEx {
                key: keys.latest(),
                value: data,
                ttl: self.latest_ttl,
            },
            Command::ListPush {
                key: keys.history(),
                value: model.version.to_string(),
            },
            Command::ListTrim {
                key: keys.history(),
                start: 0,
                stop: self.history_len as isize - 1,
            },
            Command::SetAdd {
                key: keys::MODELS.to_string(),
                member: model_name.to_string(),
            },
        ];
        commands.extend(consumed.iter().map(|key| Command::Del { key: key.clone() }));
        self.store.pipeline(commands).await?;
        info!("committed version {} of {}", model.version, model_name);
        Ok(model)
    }

    /// Reads a version of `model_name`, or the latest one if `version` is `None`.
    pub async fn read(
        &mut self,
        model_name: &str,
        version: Option<u64>,
    ) -> StorageResult<Option<ModelVersion>> {
        let keys = ModelKeys::new(model_name);
        let key = match version {
            Some(version) => keys.version(version),
            None => keys.latest(),
        };
        match self.store.get(&key).await? {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    /// Returns the most recent version ids of `model_name`, newest first.
    pub async fn history(&mut self, model_name: &str) -> StorageResult<Vec<u64>> {
        let history = self
            .store
            .list_range(&ModelKeys::new(model_name).history(), 0, -1)
            .await?;
        Ok(history
            .iter()
            .filter_map(|version| version.parse().ok())
            .collect())
    }

    async fn head(&mut self, model_name: &str) -> StorageResult<Option<u64>> {
        let head = self
            .store
            .list_range(&ModelKeys::new(model_name).history(), 0, 0)
            .await?;
        Ok(head.first().and_then(|version| version.parse().ok()))
    }
}
