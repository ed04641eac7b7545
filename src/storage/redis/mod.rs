//! A Redis compatible [`KeyValueStore`].
//!
//! See [`keys`](crate::storage::keys) for the data model.

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use redis::{aio::ConnectionManager, IntoConnectionInfo, Pipeline, Script, Value};
pub use redis::{RedisError, RedisResult};
use tracing::{debug, warn};

use crate::storage::{Command, KeyValueStore, LockToken, Reply, StorageError, StorageResult};

/// Moves `KEYS[1]` to `KEYS[2]` if `KEYS[1]` exists. Plain `RENAME` fails on a missing source,
/// which would turn a repeated promotion into an error.
const RENAME_IF_EXISTS: &str = r#"
    if redis.call("EXISTS", KEYS[1]) == 1 then
        redis.call("RENAME", KEYS[1], KEYS[2])
        return 1
    end
    return 0
"#;

/// Pushes `ARGV[1]` onto the list `KEYS[1]` unless it already is the head, so that a resent
/// pipeline does not push it twice.
const PUSH_IF_NEW_HEAD: &str = r#"
    if redis.call("LINDEX", KEYS[1], 0) ~= ARGV[1] then
        redis.call("LPUSH", KEYS[1], ARGV[1])
    end
    return redis.call("LLEN", KEYS[1])
"#;

/// Deletes the lock `KEYS[1]` only if it still holds the token `ARGV[1]`.
const RELEASE_IF_OWNER: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        return redis.call("DEL", KEYS[1])
    end
    return 0
"#;

/// How often and how patiently transient failures are retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// The number of retries after the first attempt.
    pub retries: u32,
    /// The delay before the first retry. It doubles with every further retry.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

#[derive(Clone)]
pub struct Client {
    connection: ConnectionManager,
    retry: RetryPolicy,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Redis client")
            .field("retry", &self.retry)
            .finish()
    }
}

fn to_storage_err(e: RedisError) -> StorageError {
    anyhow::anyhow!(e)
}

/// Whether a failed command may succeed when it is sent again.
fn is_transient(e: &RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
}

fn ttl_millis(ttl: Duration) -> u64 {
    // redis rejects an expiry of 0
    (ttl.as_millis() as u64).max(1)
}

/// Escapes the glob metacharacters of `prefix` and appends a wildcard.
fn prefix_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}

/// Whether a `SET NX` that was not applied may have been applied by an earlier attempt whose
/// reply was lost.
fn needs_owner_check(reply: &Value, attempts: u32) -> bool {
    matches!(reply, Value::Nil) && attempts > 1
}

fn reply_from_value(value: &Value) -> Reply {
    match value {
        Value::Int(n) => *n,
        Value::Nil => 0,
        _ => 1,
    }
}

impl Client {
    /// Creates a new Redis client.
    ///
    /// `url` to which Redis instance the client should connect to.
    /// The URL format is `redis://[<username>][:<passwd>@]<hostname>[:port][/<db>]`.
    ///
    /// The [`Client`] uses a [`redis::aio::ConnectionManager`] that automatically reconnects
    /// if the connection is dropped. Commands that fail with a transient error are retried
    /// according to `retry`.
    pub async fn new<T: IntoConnectionInfo>(
        url: T,
        retry: RetryPolicy,
    ) -> Result<Self, RedisError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_tokio_connection_manager().await?;
        Ok(Self { connection, retry })
    }

    /// Runs `f` on a fresh handle of the managed connection, retrying transient failures with
    /// exponential backoff.
    async fn retry<T, F, Fut>(&self, operation: &'static str, mut f: F) -> StorageResult<T>
    where
        F: FnMut(ConnectionManager) -> Fut + Send,
        Fut: Future<Output = RedisResult<T>> + Send,
        T: Send,
    {
        let mut delay = self.retry.backoff;
        let mut attempt = 0;
        loop {
            match f(self.connection.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if is_transient(&e) && attempt < self.retry.retries => {
                    attempt += 1;
                    warn!(
                        "{} failed ({}), retry {}/{} in {:?}",
                        operation, e, attempt, self.retry.retries, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(to_storage_err(e)),
            }
        }
    }

    fn create_pipeline(commands: &[Command]) -> Pipeline {
        let mut pipe = redis::pipe();
        for command in commands {
            match command {
                Command::Rename { src, dst } => {
                    pipe.cmd("EVAL").arg(RENAME_IF_EXISTS).arg(2).arg(src).arg(dst);
                }
                Command::Del { key } => {
                    pipe.cmd("DEL").arg(key);
                }
                Command::SetEx { key, value, ttl } => {
                    pipe.cmd("SET")
                        .arg(key)
                        .arg(value)
                        .arg("PX")
                        .arg(ttl_millis(*ttl));
                }
                Command::ListPush { key, value } => {
                    pipe.cmd("EVAL")
                        .arg(PUSH_IF_NEW_HEAD)
                        .arg(1)
                        .arg(key)
                        .arg(value);
                }
                Command::ListTrim { key, start, stop } => {
                    pipe.cmd("LTRIM").arg(key).arg(*start).arg(*stop);
                }
                Command::SetAdd { key, member } => {
                    pipe.cmd("SADD").arg(key).arg(member);
                }
            }
        }
        pipe
    }
}

#[async_trait]
impl KeyValueStore for Client {
    async fn set_if_absent(
        &mut self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> StorageResult<bool> {
        debug!("set {} if absent", key);
        // https://redis.io/commands/set
        // > Simple string reply: OK if SET was executed correctly.
        // > Null reply: a Null Bulk Reply is returned if the SET operation was not performed
        //   because the user specified the NX or XX option but the condition was not met.
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX").arg("PX").arg(ttl_millis(ttl));
        let mut attempts = 0;
        let reply: Value = self
            .retry("SET NX", |mut conn| {
                attempts += 1;
                let cmd = cmd.clone();
                async move { cmd.query_async(&mut conn).await }
            })
            .await?;
        if needs_owner_check(&reply, attempts) {
            // the values written here are unique per call, so finding our own value means an
            // earlier attempt succeeded
            let current = self.get(key).await?;
            return Ok(current.as_deref() == Some(value));
        }
        Ok(!matches!(reply, Value::Nil))
    }

    async fn get(&mut self, key: &str) -> StorageResult<Option<String>> {
        // https://redis.io/commands/get
        // > Bulk string reply: the value of key, or nil when key does not exist.
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.retry("GET", |mut conn| {
            let cmd = cmd.clone();
            async move { cmd.query_async(&mut conn).await }
        })
        .await
    }

    async fn set(&mut self, key: &str, value: &str) -> StorageResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        self.retry("SET", |mut conn| {
            let cmd = cmd.clone();
            async move { cmd.query_async(&mut conn).await }
        })
        .await
    }

    async fn set_ex(&mut self, key: &str, value: &str, ttl: Duration) -> StorageResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("PX").arg(ttl_millis(ttl));
        self.retry("SET PX", |mut conn| {
            let cmd = cmd.clone();
            async move { cmd.query_async(&mut conn).await }
        })
        .await
    }

    async fn rename(&mut self, src: &str, dst: &str) -> StorageResult<bool> {
        debug!("rename {} to {}", src, dst);
        let moved: i64 = self
            .retry("RENAME", |mut conn| {
                let script = Script::new(RENAME_IF_EXISTS);
                let (src, dst) = (src.to_string(), dst.to_string());
                async move { script.key(src).key(dst).invoke_async(&mut conn).await }
            })
            .await?;
        Ok(moved == 1)
    }

    async fn scan_prefix(&mut self, prefix: &str) -> StorageResult<Vec<String>> {
        // https://redis.io/commands/scan
        // > A full iteration always retrieves all the elements that were present in the
        //   collection from the start to the end of a full iteration. [...] A given element may
        //   be returned multiple times.
        let pattern = prefix_pattern(prefix);
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor).arg("MATCH").arg(&pattern).arg("COUNT").arg(1000);
            let (next, batch): (u64, Vec<String>) = self
                .retry("SCAN", |mut conn| {
                    let cmd = cmd.clone();
                    async move { cmd.query_async(&mut conn).await }
                })
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }

    async fn pipeline(&mut self, commands: Vec<Command>) -> StorageResult<Vec<Reply>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        debug!("execute pipeline of {} commands", commands.len());
        let mut pipe = Self::create_pipeline(&commands);
        pipe.atomic();
        let values: Vec<Value> = self
            .retry("pipeline", |mut conn| {
                let pipe = pipe.clone();
                async move { pipe.query_async(&mut conn).await }
            })
            .await?;
        Ok(values.iter().map(reply_from_value).collect())
    }

    async fn list_range(
        &mut self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> StorageResult<Vec<String>> {
        // https://redis.io/commands/lrange
        // > Array reply: list of elements in the specified range.
        let mut cmd = redis::cmd("LRANGE");
        cmd.arg(key).arg(start).arg(stop);
        self.retry("LRANGE", |mut conn| {
            let cmd = cmd.clone();
            async move { cmd.query_async(&mut conn).await }
        })
        .await
    }

    async fn set_cardinality(&mut self, key: &str) -> StorageResult<u64> {
        // https://redis.io/commands/scard
        // > Integer reply: the cardinality (number of elements) of the set, or 0 if key does
        //   not exist.
        let mut cmd = redis::cmd("SCARD");
        cmd.arg(key);
        self.retry("SCARD", |mut conn| {
            let cmd = cmd.clone();
            async move { cmd.query_async(&mut conn).await }
        })
        .await
    }

    async fn set_members(&mut self, key: &str) -> StorageResult<Vec<String>> {
        let mut cmd = redis::cmd("SMEMBERS");
        cmd.arg(key);
        self.retry("SMEMBERS", |mut conn| {
            let cmd = cmd.clone();
            async move { cmd.query_async(&mut conn).await }
        })
        .await
    }

    async fn acquire_lock(
        &mut self,
        key: &str,
        ttl: Duration,
    ) -> StorageResult<Option<LockToken>> {
        let token = LockToken::new();
        let acquired = self.set_if_absent(key, token.as_str(), ttl).await?;
        Ok(if acquired { Some(token) } else { None })
    }

    async fn release_lock(&mut self, key: &str, token: &LockToken) -> StorageResult<bool> {
        debug!("release lock {}", key);
        let released: i64 = self
            .retry("release lock", |mut conn| {
                let script = Script::new(RELEASE_IF_OWNER);
                let (key, token) = (key.to_string(), token.as_str().to_string());
                async move { script.key(key).arg(token).invoke_async(&mut conn).await }
            })
            .await?;
        Ok(released == 1)
    }

    async fn is_ready(&mut self) -> StorageResult<()> {
        let cmd = redis::cmd("PING");
        self.retry("PING", |mut conn| {
            let cmd = cmd.clone();
            async move { cmd.query_async(&mut conn).await }
        })
        .await
    }
}

#[cfg(test)]
// Functions that are not needed by the coordinator but handy for testing.
impl Client {
    /// Deletes all data in the current database.
    pub async fn flush_db(&mut self) -> RedisResult<()> {
        debug!("flush current database");
        // https://redis.io/commands/flushdb
        // > This command never fails.
        redis::cmd("FLUSHDB")
            .arg("ASYNC")
            .query_async(&mut self.connection)
            .await
    }
}
