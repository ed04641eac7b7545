//! The update ledger.
//!
//! Accepted updates are persisted as ledger entries under a state namespace:
//!
//! ```text
//! pending --promote--> processing --discard--> (deleted)
//!    ^                     |
//!    +-------revert--------+
//! ```
//!
//! Entries are never modified in place. A state transition renames the entry key into the
//! namespace of the next state, which is a single atomic store operation because all keys of a
//! model share one partition. Entries that are enqueued while a round is promoting simply stay
//! pending for the next round. An entry that is not consumed before its time to live expires is
//! lost and never aggregated.

use std::time::Duration;

use tracing::{debug, warn};

use crate::{
    message::WeightUpdate,
    storage::{
        keys::{self, EntryState, ModelKeys},
        Command,
        KeyValueStore,
        StorageResult,
    },
};

/// An accepted update together with the key it is stored under.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub key: String,
    pub update: WeightUpdate,
}

/// The owner of the nonce, pending and processing key-space of every model.
#[derive(Debug, Clone)]
pub struct Ledger<S> {
    store: S,
}

impl<S> Ledger<S>
where
    S: KeyValueStore,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Reserves the `nonce` of `site_id` for `model_name`.
    ///
    /// Returns `false` if the nonce has already been used within `ttl`, in which case the
    /// update is a replay and must be rejected.
    pub async fn reserve_nonce(
        &mut self,
        model_name: &str,
        site_id: &str,
        nonce: &str,
        ttl: Duration,
    ) -> StorageResult<bool> {
        let key = ModelKeys::new(model_name).nonce(site_id, nonce);
        let reservation = uuid::Uuid::new_v4().to_string();
        let reserved = self.store.set_if_absent(&key, &reservation, ttl).await?;
        if !reserved {
            debug!("nonce {} of site {} already used", nonce, site_id);
        }
        Ok(reserved)
    }

    /// Releases a reserved nonce, so that an update which could not be enqueued can be
    /// submitted again.
    pub async fn release_nonce(
        &mut self,
        model_name: &str,
        site_id: &str,
        nonce: &str,
    ) -> StorageResult<()> {
        let key = ModelKeys::new(model_name).nonce(site_id, nonce);
        self.store.pipeline(vec![Command::Del { key }]).await?;
        Ok(())
    }

    /// Writes `update` as a new pending entry that expires after `ttl` and returns its key.
    ///
    /// The key embeds the receipt time and the nonce, which keeps entries of the same site
    /// unique and orders them chronologically.
    pub async fn enqueue_pending(
        &mut self,
        model_name: &str,
        site_id: &str,
        update: &WeightUpdate,
        ttl: Duration,
    ) -> StorageResult<String> {
        let received_at = update
            .received_at
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        let key = ModelKeys::new(model_name).entry(
            EntryState::Pending,
            received_at,
            site_id,
            &update.nonce,
        );
        let value = serde_json::to_string(update)?;
        self.store
            .pipeline(vec![
                Command::SetEx {
                    key: key.clone(),
                    value,
                    ttl,
                },
                Command::SetAdd {
                    key: keys::MODELS.to_string(),
                    member: model_name.to_string(),
                },
            ])
            .await?;
        debug!("enqueued pending update {}", key);
        Ok(key)
    }

    /// Returns the number of pending entries of `model_name`.
    pub async fn count_pending(&mut self, model_name: &str) -> StorageResult<u64> {
        self.count(model_name, EntryState::Pending).await
    }

    /// Returns the number of entries of `model_name` in `state`.
    pub async fn count(&mut self, model_name: &str, state: EntryState) -> StorageResult<u64> {
        let prefix = ModelKeys::new(model_name).entries(state);
        Ok(self.store.scan_prefix(&prefix).await?.len() as u64)
    }

    /// Returns all entries of `model_name` in `state`, oldest first.
    ///
    /// Entries that expire while they are listed are left out, as are entries whose payload
    /// cannot be parsed.
    pub async fn list_entries(
        &mut self,
        model_name: &str,
        state: EntryState,
    ) -> StorageResult<Vec<LedgerEntry>> {
        let prefix = ModelKeys::new(model_name).entries(state);
        let mut keys = self.store.scan_prefix(&prefix).await?;
        keys.sort();

        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            let data = match self.store.get(&key).await? {
                Some(data) => data,
                None => continue,
            };
            match serde_json::from_str::<WeightUpdate>(&data) {
                Ok(update) => entries.push(LedgerEntry { key, update }),
                Err(e) => warn!("skipping unreadable ledger entry {}: {}", key, e),
            }
        }
        Ok(entries)
    }

    /// Moves every pending entry of `model_name` into the processing namespace and returns the
    /// keys of the moved entries.
    ///
    /// Entries that were already moved, for example by an earlier attempt that failed half way,
    /// are skipped.
    pub async fn promote(&mut self, model_name: &str) -> StorageResult<Vec<String>> {
        let keys = ModelKeys::new(model_name);
        let mut pending = self.store.scan_prefix(&keys.entries(EntryState::Pending)).await?;
        pending.sort();

        let moves: Vec<(String, String)> = pending
            .into_iter()
            .filter_map(|src| {
                keys.transition(&src, EntryState::Pending, EntryState::Processing)
                    .map(|dst| (src, dst))
            })
            .collect();
        let moved = self.transition(moves).await?;
        debug!("promoted {} pending updates of {}", moved.len(), model_name);
        Ok(moved)
    }

    /// Moves processing `entries` back into the pending namespace and returns the keys of the
    /// moved entries.
    pub async fn revert(
        &mut self,
        model_name: &str,
        entries: &[LedgerEntry],
    ) -> StorageResult<Vec<String>> {
        let keys = ModelKeys::new(model_name);
        let moves: Vec<(String, String)> = entries
            .iter()
            .filter_map(|entry| {
                keys.transition(&entry.key, EntryState::Processing, EntryState::Pending)
                    .map(|dst| (entry.key.clone(), dst))
            })
            .collect();
        let moved = self.transition(moves).await?;
        debug!("reverted {} processing updates of {}", moved.len(), model_name);
        Ok(moved)
    }

    /// Deletes consumed processing `entries` and returns how many were deleted.
    ///
    /// A round does not call this after aggregating. It hands the entry keys to
    /// [`Registry::commit`](crate::registry::Registry::commit), which deletes them atomically
    /// with publishing the version.
    pub async fn discard(&mut self, entries: &[LedgerEntry]) -> StorageResult<u64> {
        let commands = entries
            .iter()
            .map(|entry| Command::Del {
                key: entry.key.clone(),
            })
            .collect();
        let replies = self.store.pipeline(commands).await?;
        Ok(replies.into_iter().filter(|deleted| *deleted > 0).count() as u64)
    }

    async fn transition(&mut self, moves: Vec<(String, String)>) -> StorageResult<Vec<String>> {
        let commands = moves
            .iter()
            .map(|(src, dst)| Command::Rename {
                src: src.clone(),
                dst: dst.clone(),
            })
            .collect();
        let replies = self.store.pipeline(commands).await?;
        Ok(moves
            .into_iter()
            .zip(replies)
            .filter(|(_, moved)| *moved == 1)
            .map(|((_, dst), _)| dst)
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{message::Layers, storage::memory::MemoryStore};

    pub fn update(site_id: &str, nonce: &str, received_at: i64) -> WeightUpdate {
        let mut weights = Layers::new();
        weights.insert("layer0".into(), vec![1.0, 2.0]);
        WeightUpdate {
            site_id: site_id.into(),
            model_name: "mnist".into(),
            weights,
            data_sample_count: 10,
            data_quality: None,
            timestamp: received_at,
            nonce: nonce.into(),
            received_at: Some(received_at),
            uploaded_by: Some("tester".into()),
        }
    }

    const TTL: Duration = Duration::from_secs(3600);

    async fn enqueue(ledger: &mut Ledger<MemoryStore>, site_id: &str, nonce: &str, at: i64) -> String {
        ledger
            .enqueue_pending("mnist", site_id, &update(site_id, nonce, at), TTL)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_reserve_nonce_once() {
        let mut ledger = Ledger::new(MemoryStore::new());
        let ttl = Duration::from_secs(300);

        assert!(ledger.reserve_nonce("mnist", "siteA", "n1", ttl).await.unwrap());
        assert!(!ledger.reserve_nonce("mnist", "siteA", "n1", ttl).await.unwrap());
        // the same nonce is independent per site and per model
        assert!(ledger.reserve_nonce("mnist", "siteB", "n1", ttl).await.unwrap());
        assert!(ledger.reserve_nonce("cifar", "siteA", "n1", ttl).await.unwrap());

        ledger.release_nonce("mnist", "siteA", "n1").await.unwrap();
        assert!(ledger.reserve_nonce("mnist", "siteA", "n1", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_entries_of_one_site_are_unique_and_ordered() {
        let mut ledger = Ledger::new(MemoryStore::new());

        let second = enqueue(&mut ledger, "siteA", "n2", 200).await;
        let first = enqueue(&mut ledger, "siteA", "n1", 100).await;
        let third = enqueue(&mut ledger, "siteA", "n3", 200).await;

        assert_eq!(ledger.count_pending("mnist").await.unwrap(), 3);
        let keys: Vec<String> = ledger
            .list_entries("mnist", EntryState::Pending)
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.key)
            .collect();
        assert_eq!(keys, vec![first, second, third]);
    }

    #[tokio::test]
    async fn test_list_skips_unreadable_entries() {
        let mut store = MemoryStore::new();
        let mut ledger = Ledger::new(store.clone());
        let key = enqueue(&mut ledger, "siteA", "n1", 100).await;
        let garbage = ModelKeys::new("mnist").entry(EntryState::Pending, 50, "siteB", "n2");
        store.set_ex(&garbage, "{not json", TTL).await.unwrap();

        let entries = ledger
            .list_entries("mnist", EntryState::Pending)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, key);
        assert_eq!(entries[0].update, update("siteA", "n1", 100));
    }

    #[tokio::test]
    async fn test_promote_revert_discard() {
        let mut ledger = Ledger::new(MemoryStore::new());
        enqueue(&mut ledger, "siteA", "n1", 100).await;
        enqueue(&mut ledger, "siteB", "n2", 101).await;

        let promoted = ledger.promote("mnist").await.unwrap();
        assert_eq!(promoted.len(), 2);
        assert_eq!(ledger.count_pending("mnist").await.unwrap(), 0);

        // an update that arrives mid-round waits for the next round
        enqueue(&mut ledger, "siteC", "n3", 102).await;

        let processing = ledger
            .list_entries("mnist", EntryState::Processing)
            .await
            .unwrap();
        assert_eq!(
            processing.iter().map(|e| e.key.clone()).collect::<Vec<_>>(),
            promoted
        );

        let reverted = ledger.revert("mnist", &processing).await.unwrap();
        assert_eq!(reverted.len(), 2);
        assert_eq!(ledger.count_pending("mnist").await.unwrap(), 3);
        assert_eq!(
            ledger.count("mnist", EntryState::Processing).await.unwrap(),
            0
        );

        ledger.promote("mnist").await.unwrap();
        let processing = ledger
            .list_entries("mnist", EntryState::Processing)
            .await
            .unwrap();
        assert_eq!(ledger.discard(&processing).await.unwrap(), 3);
        assert_eq!(
            ledger.count("mnist", EntryState::Processing).await.unwrap(),
            0
        );
        assert_eq!(ledger.count_pending("mnist").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_transitions_are_idempotent() {
        let mut ledger = Ledger::new(MemoryStore::new());
        enqueue(&mut ledger, "siteA", "n1", 100).await;

        assert_eq!(ledger.promote("mnist").await.unwrap().len(), 1);
        assert!(ledger.promote("mnist").await.unwrap().is_empty());

        let processing = ledger
            .list_entries("mnist", EntryState::Processing)
            .await
            .unwrap();
        assert_eq!(ledger.revert("mnist", &processing).await.unwrap().len(), 1);
        assert!(ledger.revert("mnist", &processing).await.unwrap().is_empty());

        ledger.promote("mnist").await.unwrap();
        assert_eq!(ledger.discard(&processing).await.unwrap(), 1);
        assert_eq!(ledger.discard(&processing).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_models_are_isolated() {
        let mut ledger = Ledger::new(MemoryStore::new());
        enqueue(&mut ledger, "siteA", "n1", 100).await;
        ledger
            .enqueue_pending("cifar", "siteA", &update("siteA", "n1", 100), TTL)
            .await
            .unwrap();

        assert_eq!(ledger.promote("mnist").await.unwrap().len(), 1);
        assert_eq!(ledger.count_pending("cifar").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_registers_model() {
        let mut store = MemoryStore::new();
        let mut ledger = Ledger::new(store.clone());
        enqueue(&mut ledger, "siteA", "n1", 100).await;
        enqueue(&mut ledger, "siteB", "n2", 100).await;

        assert_eq!(
            store.set_members(keys::MODELS).await.unwrap(),
            vec!["mnist".to_string()]
        );
    }
}
