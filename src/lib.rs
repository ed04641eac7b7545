//! # A federated learning coordinator
//!
//! Participating sites train a model locally and submit their weights as signed updates. The
//! coordinator verifies and deduplicates the updates, buffers them in a key-value store and
//! periodically combines them into a new global model version with a weighted average.
//!
//! Sites never talk to each other and the coordinator keeps no shared state in process: every
//! piece of state lives in the key-value store, so several coordinator instances may serve the
//! same store concurrently.
//!
//! The crate is organized from the leaves up:
//!
//! - [`crypto`]: signature and freshness checks of inbound updates
//! - [`storage`]: the key-value store capability with a Redis and an in-memory backend
//! - [`ledger`]: the pending and processing states of accepted updates
//! - [`aggregator`]: the streaming weighted per-layer mean
//! - [`registry`]: immutable model versions with a bounded history
//! - [`state_machine`]: aggregation rounds and their scheduling
//! - [`services`]: the boundary operations a transport layer exposes
//! - [`settings`]: loading and validation of the configuration

pub mod aggregator;
pub mod crypto;
pub mod ledger;
pub mod message;
pub mod registry;
pub mod services;
pub mod settings;
pub mod state_machine;
pub mod storage;

#[cfg(test)]
mod tests;
