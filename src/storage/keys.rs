//! The key namespace of the coordinator.
//!
//!```text
//! {
//!     // replay protection, expires after the freshness window
//!     "{fl:<model>}:nonce:<site>:<nonce>": "<received_at>",
//!     // ledger entries, expire after the pending ttl
//!     "{fl:<model>}:pending:<received_at>:<site>:<nonce>": "<json WeightUpdate>",
//!     "{fl:<model>}:processing:<received_at>:<site>:<nonce>": "<json WeightUpdate>",
//!     // model versions
//!     "{fl:<model>}:version:<version>": "<json ModelVersion>", // expires after the version ttl
//!     "{fl:<model>}:latest": "<json ModelVersion>",            // expires after the latest ttl
//!     "{fl:<model>}:history": [ <version>, ... ],              // list, newest first, bounded
//!     // round lock
//!     "{fl:<model>}:lock": "<lock token>",
//!     // every model that has ever seen an update or a version
//!     "fl:models": { <model>, ... }                             // set
//! }
//! ```
//!
//! The `{fl:<model>}` prefix is a hash tag: partitioned backends place all keys of one model
//! on the same shard, which keeps renames between the `pending` and `processing` namespaces
//! atomic.

use std::fmt;

/// The global set of known model names.
pub const MODELS: &str = "fl:models";

/// The state namespace of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryState {
    Pending,
    Processing,
}

impl EntryState {
    fn tag(self) -> &'static str {
        match self {
            EntryState::Pending => "pending",
            EntryState::Processing => "processing",
        }
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// The keys of one model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelKeys {
    partition: String,
}

impl ModelKeys {
    pub fn new(model_name: &str) -> Self {
        Self {
            partition: format!("{{fl:{}}}", model_name),
        }
    }

    pub fn nonce(&self, site_id: &str, nonce: &str) -> String {
        format!("{}:nonce:{}:{}", self.partition, site_id, nonce)
    }

    /// The prefix shared by all ledger entries in `state`.
    pub fn entries(&self, state: EntryState) -> String {
        format!("{}:{}:", self.partition, state.tag())
    }

    pub fn entry(&self, state: EntryState, received_at: i64, site_id: &str, nonce: &str) -> String {
        // zero padded so that a lexicographic sort is a chronological sort
        format!(
            "{}{:020}:{}:{}",
            self.entries(state),
            received_at,
            site_id,
            nonce
        )
    }

    /// Maps a ledger entry key into the namespace of `to`, keeping its suffix.
    ///
    /// Returns `None` if `key` is not an entry key of this model.
    pub fn transition(&self, key: &str, from: EntryState, to: EntryState) -> Option<String> {
        key.strip_prefix(&self.entries(from))
            .map(|suffix| format!("{}{}", self.entries(to), suffix))
    }

    pub fn version(&self, version: u64) -> String {
        format!("{}:version:{}", self.partition, version)
    }

    pub fn latest(&self) -> String {
        format!("{}:latest", self.partition)
    }

    pub fn history(&self) -> String {
        format!("{}:history", self.partition)
    }

    pub fn lock(&self) -> String {
        format!("{}:lock", self.partition)
    }
}
