use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing_subscriber::*;

use crate::{
    aggregator::WeightingStrategy,
    crypto,
    services::{Caller, Role, Services},
    settings::{AggregationSettings, RetentionSettings, Secret, SecuritySettings},
    storage::{memory::MemoryStore, Command, KeyValueStore, LockToken, Reply, StorageResult},
};

pub const SECRET: &str = "test-secret";
pub const MODEL: &str = "mnist";

pub fn enable_logging() {
    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(true)
        .try_init();
}

pub fn security() -> SecuritySettings {
    SecuritySettings {
        hmac_secret: Secret::new(SECRET),
        freshness_window_ms: 300_000,
        max_payload_bytes: 64 * 1024,
    }
}

pub fn aggregation(min_participants: u64, weighting: WeightingStrategy) -> AggregationSettings {
    AggregationSettings {
        min_participants,
        threshold: min_participants,
        weighting,
        interval_secs: 30,
        request_timeout_ms: 1000,
    }
}

pub fn services<S: KeyValueStore>(store: S, min_participants: u64) -> Services<S> {
    Services::new(
        store,
        security(),
        aggregation(min_participants, WeightingStrategy::DataSize),
        RetentionSettings::default(),
    )
}

pub fn site() -> Caller {
    Caller::new("site-uploader", [Role::Site])
}

pub fn admin() -> Caller {
    Caller::new("operator", [Role::Admin])
}

pub fn now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// The compact JSON of an update, as a site would send it.
pub fn payload(
    site_id: &str,
    samples: u64,
    layer0: &[f64],
    nonce: &str,
    timestamp: i64,
) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "siteId": site_id,
        "modelName": MODEL,
        "weights": { "layer0": layer0 },
        "dataSampleCount": samples,
        "timestamp": timestamp,
        "nonce": nonce,
    }))
    .unwrap()
}

pub fn signature(raw: &[u8]) -> String {
    crypto::sign(raw, SECRET.as_bytes())
}

/// A store that fails every request, optionally after stalling for an hour.
#[derive(Debug, Clone)]
pub struct BrokenStore {
    pub stall: bool,
}

impl BrokenStore {
    async fn fail<T>(&self) -> StorageResult<T> {
        if self.stall {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        anyhow::bail!("connection refused")
    }
}

#[async_trait]
impl KeyValueStore for BrokenStore {
    async fn set_if_absent(&mut self, _: &str, _: &str, _: Duration) -> StorageResult<bool> {
        self.fail().await
    }

    async fn get(&mut self, _: &str) -> StorageResult<Option<String>> {
        self.fail().await
    }

    async fn set(&mut self, _: &str, _: &str) -> StorageResult<()> {
        self.fail().await
    }

    async fn set_ex(&mut self, _: &str, _: &str, _: Duration) -> StorageResult<()> {
        self.fail().await
    }

    async fn rename(&mut self, _: &str, _: &str) -> StorageResult<bool> {
        self.fail().await
    }

    async fn scan_prefix(&mut self, _: &str) -> StorageResult<Vec<String>> {
        self.fail().await
    }

    async fn pipeline(&mut self, _: Vec<Command>) -> StorageResult<Vec<Reply>> {
        self.fail().await
    }

    async fn list_range(&mut self, _: &str, _: isize, _: isize) -> StorageResult<Vec<String>> {
        self.fail().await
    }

    async fn set_cardinality(&mut self, _: &str) -> StorageResult<u64> {
        self.fail().await
    }

    async fn set_members(&mut self, _: &str) -> StorageResult<Vec<String>> {
        self.fail().await
    }

    async fn acquire_lock(&mut self, _: &str, _: Duration) -> StorageResult<Option<LockToken>> {
        self.fail().await
    }

    async fn release_lock(&mut self, _: &str, _: &LockToken) -> StorageResult<bool> {
        self.fail().await
    }

    async fn is_ready(&mut self) -> StorageResult<()> {
        self.fail().await
    }
}

pub fn memory() -> MemoryStore {
    MemoryStore::new()
}

/// How long a [`FaultyPipelines`] store holds back an affected pipeline.
pub const STALL: Duration = Duration::from_secs(5);

/// A [`MemoryStore`] whose pipelines that touch a key containing `marker` are held back by
/// `stall` and then either fail or go through.
#[derive(Debug, Clone)]
pub struct FaultyPipelines {
    pub inner: MemoryStore,
    pub marker: &'static str,
    pub stall: Duration,
    pub fail: bool,
}

impl FaultyPipelines {
    /// Holds back affected pipelines by [`STALL`] and then applies them.
    pub fn stalling(inner: MemoryStore, marker: &'static str) -> Self {
        Self {
            inner,
            marker,
            stall: STALL,
            fail: false,
        }
    }

    /// Holds back affected pipelines by [`STALL`] and then fails them.
    pub fn stalling_then_failing(inner: MemoryStore, marker: &'static str) -> Self {
        Self {
            fail: true,
            ..Self::stalling(inner, marker)
        }
    }

    /// Fails affected pipelines right away.
    pub fn failing(inner: MemoryStore, marker: &'static str) -> Self {
        Self {
            stall: Duration::ZERO,
            ..Self::stalling_then_failing(inner, marker)
        }
    }

    fn affects(&self, commands: &[Command]) -> bool {
        commands.iter().any(|command| {
            let key = match command {
                Command::Rename { src, .. } => src,
                Command::Del { key }
                | Command::SetEx { key, .. }
                | Command::ListPush { key, .. }
                | Command::ListTrim { key, .. }
                | Command::SetAdd { key, .. } => key,
            };
            key.contains(self.marker)
        })
    }
}

#[async_trait]
impl KeyValueStore for FaultyPipelines {
    async fn set_if_absent(
        &mut self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> StorageResult<bool> {
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn get(&mut self, key: &str) -> StorageResult<Option<String>> {
        self.inner.get(key).await
    }

    async fn set(&mut self, key: &str, value: &str) -> StorageResult<()> {
        self.inner.set(key, value).await
    }

    async fn set_ex(&mut self, key: &str, value: &str, ttl: Duration) -> StorageResult<()> {
        self.inner.set_ex(key, value, ttl).await
    }

    async fn rename(&mut self, src: &str, dst: &str) -> StorageResult<bool> {
        self.inner.rename(src, dst).await
    }

    async fn scan_prefix(&mut self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.scan_prefix(prefix).await
    }

    async fn pipeline(&mut self, commands: Vec<Command>) -> StorageResult<Vec<Reply>> {
        if self.affects(&commands) {
            if !self.stall.is_zero() {
                tokio::time::sleep(self.stall).await;
            }
            if self.fail {
                anyhow::bail!("connection reset");
            }
        }
        self.inner.pipeline(commands).await
    }

    async fn list_range(
        &mut self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> StorageResult<Vec<String>> {
        self.inner.list_range(key, start, stop).await
    }

    async fn set_cardinality(&mut self, key: &str) -> StorageResult<u64> {
        self.inner.set_cardinality(key).await
    }

    async fn set_members(&mut self, key: &str) -> StorageResult<Vec<String>> {
        self.inner.set_members(key).await
    }

    async fn acquire_lock(
        &mut self,
        key: &str,
        ttl: Duration,
    ) -> StorageResult<Option<LockToken>> {
        self.inner.acquire_lock(key, ttl).await
    }

    async fn release_lock(&mut self, key: &str, token: &LockToken) -> StorageResult<bool> {
        self.inner.release_lock(key, token).await
    }

    async fn is_ready(&mut self) -> StorageResult<()> {
        self.inner.is_ready().await
    }
}
