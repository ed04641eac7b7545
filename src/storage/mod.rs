//! Storage API.
//!
//! The coordinator keeps no shared state in process. Everything that concurrent ingestion
//! handlers and aggregation rounds need to agree on lives in a key-value store reached through
//! the [`KeyValueStore`] capability defined here.

pub mod keys;
pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use derive_more::{Display, From, Into};

/// The error type for storage operations that are not directly related to application domain.
/// These include, for example IO errors like broken pipe, connection refused, timeouts, etc.
pub type StorageError = anyhow::Error;

/// The result of the storage operation.
pub type StorageResult<T> = Result<T, StorageError>;

/// An opaque token proving ownership of a store-held lock.
#[derive(Debug, Clone, PartialEq, Eq, Display, From, Into)]
pub struct LockToken(String);

impl LockToken {
    /// Creates a new random lock token.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

/// A single command of a pipelined batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Moves `src` to `dst`, keeping the remaining time to live. A missing `src` is a no-op.
    Rename { src: String, dst: String },
    /// Deletes `key`. A missing key is a no-op.
    Del { key: String },
    /// Sets `key` to `value`, expiring after `ttl`.
    SetEx {
        key: String,
        value: String,
        ttl: Duration,
    },
    /// Pushes `value` to the head of the list at `key`, unless it already is the head. A resent
    /// pipeline therefore does not push the same value twice.
    ListPush { key: String, value: String },
    /// Trims the list at `key` to the inclusive range `start..=stop`.
    ListTrim { key: String, start: isize, stop: isize },
    /// Adds `member` to the set at `key`.
    SetAdd { key: String, member: String },
}

/// The reply of a single pipelined [`Command`].
///
/// Commands that report a count (`Rename`, `Del`, `SetAdd`) reply with that count, `ListPush`
/// replies with the list length and commands that only acknowledge (`SetEx`, `ListTrim`) reply
/// with `1`.
pub type Reply = i64;

#[async_trait]
/// An abstract key-value store.
///
/// All keys that belong to one model share a partition tag (see [`keys`]) so that multi-key
/// primitives like [`KeyValueStore::rename`] stay atomic on partitioned backends.
pub trait KeyValueStore
where
    Self: Clone + Send + Sync + 'static,
{
    /// Sets `key` to `value` only if `key` does not exist yet.
    ///
    /// # Behavior
    ///
    /// - If the key did not exist, set it with the given expiry and return
    ///   `StorageResult::Ok(true)`.
    /// - If the key already exists, leave it untouched and return `StorageResult::Ok(false)`.
    async fn set_if_absent(&mut self, key: &str, value: &str, ttl: Duration)
        -> StorageResult<bool>;

    /// Returns the value of `key`, or `StorageResult::Ok(None)` if it does not exist.
    async fn get(&mut self, key: &str) -> StorageResult<Option<String>>;

    /// Sets `key` to `value` without an expiry, overriding any previous value.
    async fn set(&mut self, key: &str, value: &str) -> StorageResult<()>;

    /// Sets `key` to `value` with an expiry, overriding any previous value.
    async fn set_ex(&mut self, key: &str, value: &str, ttl: Duration) -> StorageResult<()>;

    /// Renames `src` to `dst`.
    ///
    /// # Behavior
    ///
    /// - If `src` exists, move it (with its remaining expiry) and return `StorageResult::Ok(true)`.
    /// - If `src` does not exist, return `StorageResult::Ok(false)`.
    async fn rename(&mut self, src: &str, dst: &str) -> StorageResult<bool>;

    /// Returns all keys that start with `prefix`, in no particular order.
    async fn scan_prefix(&mut self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Executes a batch of commands in one round trip and returns one [`Reply`] per command.
    ///
    /// The batch is best-effort: a transport failure may leave it partially applied, so
    /// callers must only submit commands that are safe to repeat.
    async fn pipeline(&mut self, commands: Vec<Command>) -> StorageResult<Vec<Reply>>;

    /// Returns the elements `start..=stop` of the list at `key` (negative indices count from
    /// the tail). A missing key is an empty list.
    async fn list_range(&mut self, key: &str, start: isize, stop: isize)
        -> StorageResult<Vec<String>>;

    /// Returns the number of members of the set at `key`.
    async fn set_cardinality(&mut self, key: &str) -> StorageResult<u64>;

    /// Returns the members of the set at `key`.
    async fn set_members(&mut self, key: &str) -> StorageResult<Vec<String>>;

    /// Tries to acquire the lock `key` for `ttl`.
    ///
    /// Returns the [`LockToken`] of the new owner, or `StorageResult::Ok(None)` if the lock is
    /// currently held.
    async fn acquire_lock(&mut self, key: &str, ttl: Duration) -> StorageResult<Option<LockToken>>;

    /// Releases the lock `key` if, and only if, it is still owned by `token`.
    ///
    /// Returns `StorageResult::Ok(true)` if the lock was released.
    async fn release_lock(&mut self, key: &str, token: &LockToken) -> StorageResult<bool>;

    /// Checks if the store is ready to process requests.
    async fn is_ready(&mut self) -> StorageResult<()>;

    /// Pushes `value` onto the head of the list at `key`.
    async fn list_push(&mut self, key: &str, value: &str) -> StorageResult<u64> {
        let replies = self
            .pipeline(vec![Command::ListPush {
                key: key.to_string(),
                value: value.to_string(),
            }])
            .await?;
        Ok(replies.first().copied().unwrap_or_default() as u64)
    }

    /// Trims the list at `key` to `start..=stop`.
    async fn list_trim(&mut self, key: &str, start: isize, stop: isize) -> StorageResult<()> {
        self.pipeline(vec![Command::ListTrim {
            key: key.to_string(),
            start,
            stop,
        }])
        .await
        .map(|_| ())
    }

    /// Adds `member` to the set at `key`. Returns `true` if it was not a member yet.
    async fn set_add(&mut self, key: &str, member: &str) -> StorageResult<bool> {
        let replies = self
            .pipeline(vec![Command::SetAdd {
                key: key.to_string(),
                member: member.to_string(),
            }])
            .await?;
        Ok(replies.first().copied().unwrap_or_default() == 1)
    }
}
