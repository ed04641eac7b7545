//! The aggregation state machine.
//!
//! An aggregation round of a model moves through the following phases:
//!
//! ```text
//! Idle -> Promoting -> Deciding -> Aggregating -> Committing -> Idle
//!                          |
//!                          +-----> Reverting ---------------> Idle
//! ```
//!
//! **Promoting**
//!
//! The round takes ownership of the model by acquiring its store-held lock and moves every
//! pending update of the model into the processing namespace. Updates that arrive from now on
//! stay pending for the next round. Updates left in the processing namespace by an earlier round
//! that failed are picked up as well.
//!
//! **Deciding**
//!
//! If fewer than `min_participants` updates are processing, the round moves to **Reverting**,
//! which returns them to the pending namespace, and ends without a new model.
//!
//! **Aggregating**
//!
//! The processing updates are weighted and folded into a per-layer weighted mean.
//!
//! **Committing**
//!
//! The aggregated model is committed as a new version. The consumed updates are deleted in the
//! same atomic write that publishes the version, so an update is either still processing or
//! part of exactly one version. A round that fails before that point leaves them in the
//! processing namespace, from where the next round picks them up.
//!
//! The lock is released at the end of every round, whatever its outcome. A round that finds the
//! lock held by another round ends immediately without touching the ledger.

pub mod coordinator;
pub mod scheduler;

pub use self::{coordinator::Coordinator, scheduler::Scheduler};

use derive_more::Display;
use serde::Serialize;
use thiserror::Error;

use crate::{aggregator::AggregationError, storage::StorageError};

/// The name of a round phase.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum PhaseName {
    #[display(fmt = "Idle")]
    Idle,
    #[display(fmt = "Promoting")]
    Promoting,
    #[display(fmt = "Deciding")]
    Deciding,
    #[display(fmt = "Aggregating")]
    Aggregating,
    #[display(fmt = "Committing")]
    Committing,
    #[display(fmt = "Reverting")]
    Reverting,
}

/// The outcome of a round that ran to completion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(into = "RoundReport")]
pub enum RoundOutcome {
    /// A new model version was committed.
    Aggregated { version: u64, participants: u64 },
    /// Too few updates were processing; they are pending again.
    NotEnoughParticipants { participants: u64 },
    /// Another round of the model holds the lock.
    InProgress,
}

impl RoundOutcome {
    pub fn is_aggregated(&self) -> bool {
        matches!(self, RoundOutcome::Aggregated { .. })
    }
}

/// Why a round ended without a new model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotEnoughParticipants,
    RoundInProgress,
}

/// The serialized form of a [`RoundOutcome`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RoundReport {
    pub aggregated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<SkipReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participants: Option<u64>,
}

impl From<RoundOutcome> for RoundReport {
    fn from(outcome: RoundOutcome) -> Self {
        match outcome {
            RoundOutcome::Aggregated {
                version,
                participants,
            } => RoundReport {
                aggregated: true,
                reason: None,
                version: Some(version),
                participants: Some(participants),
            },
            RoundOutcome::NotEnoughParticipants { participants } => RoundReport {
                aggregated: false,
                reason: Some(SkipReason::NotEnoughParticipants),
                version: None,
                participants: Some(participants),
            },
            RoundOutcome::InProgress => RoundReport {
                aggregated: false,
                reason: Some(SkipReason::RoundInProgress),
                version: None,
                participants: None,
            },
        }
    }
}

/// Error that occurs during a round.
#[derive(Error, Debug)]
pub enum RoundError {
    #[error("acquiring the round lock failed: {0}")]
    Lock(StorageError),
    #[error("promoting the pending updates failed: {0}")]
    Promote(StorageError),
    #[error("reading the processing updates failed: {0}")]
    ReadProcessing(StorageError),
    #[error("reverting the processing updates failed: {0}")]
    Revert(StorageError),
    #[error("aggregation failed: {0}")]
    Aggregation(#[from] AggregationError),
    #[error("committing the model failed: {0}")]
    Commit(StorageError),
}
