//! An in-process [`KeyValueStore`].
//!
//! Keeps the same semantics as the Redis store (expiry, renames that keep the remaining time to
//! live, lists, sets and owner-checked locks) without a server. It backs the unit tests and the
//! `memory` store backend, which is only meant for a single coordinator instance.

use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::Mutex, time::Instant};

use crate::storage::{Command, KeyValueStore, LockToken, Reply, StorageResult};

#[derive(Debug, Clone)]
enum Data {
    String(String),
    List(VecDeque<String>),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    data: Data,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
}

impl Keyspace {
    /// Returns the live entry at `key`, evicting it first if it has expired.
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.entries.get(key).map_or(false, |e| e.is_expired(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn set(&mut self, key: &str, value: &str, ttl: Option<Duration>) {
        self.entries.insert(
            key.to_string(),
            Entry {
                data: Data::String(value.to_string()),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }

    fn get(&mut self, key: &str) -> StorageResult<Option<String>> {
        match self.live(key).map(|e| &e.data) {
            None => Ok(None),
            Some(Data::String(value)) => Ok(Some(value.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn rename(&mut self, src: &str, dst: &str) -> bool {
        if self.live(src).is_none() {
            return false;
        }
        if let Some(entry) = self.entries.remove(src) {
            self.entries.insert(dst.to_string(), entry);
            true
        } else {
            false
        }
    }

    fn del(&mut self, key: &str) -> bool {
        self.live(key).is_some() && self.entries.remove(key).is_some()
    }

    fn list(&mut self, key: &str) -> StorageResult<&mut VecDeque<String>> {
        if self.live(key).is_none() {
            self.entries.insert(
                key.to_string(),
                Entry {
                    data: Data::List(VecDeque::new()),
                    expires_at: None,
                },
            );
        }
        match self.entries.get_mut(key).map(|e| &mut e.data) {
            Some(Data::List(list)) => Ok(list),
            _ => Err(wrong_type(key)),
        }
    }

    fn set_members(&mut self, key: &str) -> StorageResult<Option<&mut BTreeSet<String>>> {
        match self.live(key).map(|e| &mut e.data) {
            None => Ok(None),
            Some(Data::Set(set)) => Ok(Some(set)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn set_add(&mut self, key: &str, member: &str) -> StorageResult<bool> {
        if self.live(key).is_none() {
            self.entries.insert(
                key.to_string(),
                Entry {
                    data: Data::Set(BTreeSet::new()),
                    expires_at: None,
                },
            );
        }
        match self.set_members(key)? {
            Some(set) => Ok(set.insert(member.to_string())),
            None => Err(wrong_type(key)),
        }
    }

    fn execute(&mut self, command: &Command) -> StorageResult<Reply> {
        let reply = match command {
            Command::Rename { src, dst } => self.rename(src, dst) as Reply,
            Command::Del { key } => self.del(key) as Reply,
            Command::SetEx { key, value, ttl } => {
                self.set(key, value, Some(*ttl));
                1
            }
            Command::ListPush { key, value } => {
                let list = self.list(key)?;
                if list.front() != Some(value) {
                    list.push_front(value.clone());
                }
                list.len() as Reply
            }
            Command::ListTrim { key, start, stop } => {
                let list = self.list(key)?;
                let (start, stop) = resolve_range(list.len(), *start, *stop);
                let kept: VecDeque<String> = match (start, stop) {
                    (Some(start), Some(stop)) => list.drain(start..=stop).collect(),
                    _ => VecDeque::new(),
                };
                *list = kept;
                if list.is_empty() {
                    self.entries.remove(key);
                }
                1
            }
            Command::SetAdd { key, member } => self.set_add(key, member)? as Reply,
        };
        Ok(reply)
    }
}

fn wrong_type(key: &str) -> anyhow::Error {
    anyhow::anyhow!(
        "WRONGTYPE operation against key {} holding the wrong kind of value",
        key
    )
}

/// Resolves a redis style inclusive range against a list of length `len`.
///
/// Returns `(None, None)` if the range is empty.
fn resolve_range(len: usize, start: isize, stop: isize) -> (Option<usize>, Option<usize>) {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len || stop < 0 {
        (None, None)
    } else {
        (Some(start as usize), Some(stop as usize))
    }
}

#[derive(Debug, Clone, Default)]
/// A [`KeyValueStore`] that lives in the memory of the current process.
///
/// Clones share the same keyspace.
pub struct MemoryStore {
    keyspace: Arc<Mutex<Keyspace>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn set_if_absent(
        &mut self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> StorageResult<bool> {
        let mut keyspace = self.keyspace.lock().await;
        if keyspace.live(key).is_some() {
            return Ok(false);
        }
        keyspace.set(key, value, Some(ttl));
        Ok(true)
    }

    async fn get(&mut self, key: &str) -> StorageResult<Option<String>> {
        self.keyspace.lock().await.get(key)
    }

    async fn set(&mut self, key: &str, value: &str) -> StorageResult<()> {
        self.keyspace.lock().await.set(key, value, None);
        Ok(())
    }

    async fn set_ex(&mut self, key: &str, value: &str, ttl: Duration) -> StorageResult<()> {
        self.keyspace.lock().await.set(key, value, Some(ttl));
        Ok(())
    }

    async fn rename(&mut self, src: &str, dst: &str) -> StorageResult<bool> {
        Ok(self.keyspace.lock().await.rename(src, dst))
    }

    async fn scan_prefix(&mut self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut keyspace = self.keyspace.lock().await;
        let now = Instant::now();
        keyspace.entries.retain(|_, e| !e.is_expired(now));
        Ok(keyspace
            .entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn pipeline(&mut self, commands: Vec<Command>) -> StorageResult<Vec<Reply>> {
        let mut keyspace = self.keyspace.lock().await;
        commands
            .iter()
            .map(|command| keyspace.execute(command))
            .collect()
    }

    async fn list_range(
        &mut self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> StorageResult<Vec<String>> {
        let mut keyspace = self.keyspace.lock().await;
        let list = match keyspace.live(key).map(|e| &e.data) {
            None => return Ok(Vec::new()),
            Some(Data::List(list)) => list,
            Some(_) => return Err(wrong_type(key)),
        };
        Ok(match resolve_range(list.len(), start, stop) {
            (Some(start), Some(stop)) => list.range(start..=stop).cloned().collect(),
            _ => Vec::new(),
        })
    }

    async fn set_cardinality(&mut self, key: &str) -> StorageResult<u64> {
        let mut keyspace = self.keyspace.lock().await;
        Ok(keyspace
            .set_members(key)?
            .map_or(0, |set| set.len() as u64))
    }

    async fn set_members(&mut self, key: &str) -> StorageResult<Vec<String>> {
        let mut keyspace = self.keyspace.lock().await;
        Ok(keyspace
            .set_members(key)?
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
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
        let mut keyspace = self.keyspace.lock().await;
        if keyspace.get(key)?.as_deref() == Some(token.as_str()) {
            Ok(keyspace.del(key))
        } else {
            Ok(false)
        }
    }

    async fn is_ready(&mut self) -> StorageResult<()> {
        Ok(())
    }
}
