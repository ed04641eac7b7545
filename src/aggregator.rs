//! Streaming weighted aggregation of model weights.
//!
//! The aggregate of a layer is the elementwise weighted mean
//!
//! ```text
//! layer = Σ (weight_i * layer_i) / Σ weight_i
//! ```
//!
//! over every update that supplied the layer with the length of the template, which is the
//! first update of the batch. Updates are folded in one at a time, so only the running sums are
//! kept in memory.

use std::{collections::BTreeMap, time::Instant};

use displaydoc::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::message::{Layers, WeightUpdate};

/// Errors which can occur during an aggregation.
#[derive(Debug, Display, Error, PartialEq, Eq)]
pub enum AggregationError {
    /// cannot aggregate an empty batch of updates
    EmptyBatch,
}

/// How the weight of a participant is derived from its update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightingStrategy {
    /// The number of training samples.
    DataSize,
    /// The same weight for every participant.
    Uniform,
    /// The data quality score. Updates without a score weigh `1.0`.
    DataQuality,
}

impl Default for WeightingStrategy {
    fn default() -> Self {
        WeightingStrategy::DataSize
    }
}

impl WeightingStrategy {
    /// Computes the aggregation weight of `update`.
    pub fn weight_of(&self, update: &WeightUpdate) -> f64 {
        match self {
            WeightingStrategy::DataSize => update.data_sample_count as f64,
            WeightingStrategy::Uniform => 1.0,
            WeightingStrategy::DataQuality => update.data_quality.unwrap_or(1.0),
        }
    }

    /// Weighs `update` for aggregation.
    pub fn weigh(&self, update: &WeightUpdate) -> WeightedUpdate {
        WeightedUpdate {
            site_id: update.site_id.clone(),
            weights: update.weights.clone(),
            weight: self.weight_of(update),
        }
    }
}

/// The weights of one participant together with its aggregation weight.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedUpdate {
    pub site_id: String,
    pub weights: Layers,
    pub weight: f64,
}

/// Provenance of an aggregated model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationMetadata {
    /// The number of aggregated updates.
    pub participants: u32,
    /// The time spent aggregating, in milliseconds.
    pub duration_ms: u64,
    /// The contributing sites, in aggregation order.
    pub sites: Vec<String>,
}

/// The output of one aggregation round.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationResult {
    pub weights: Layers,
    pub metadata: AggregationMetadata,
}

#[derive(Debug)]
struct LayerSum {
    values: Vec<f64>,
    weight: f64,
}

/// A running weighted aggregation.
#[derive(Debug)]
pub struct StreamingAggregation {
    model_name: String,
    layers: BTreeMap<String, LayerSum>,
    sites: Vec<String>,
}

impl StreamingAggregation {
    /// Creates a new aggregation whose layer set and layer lengths are those of `template`.
    pub fn new(model_name: &str, template: &Layers) -> Self {
        let layers = template
            .iter()
            .map(|(name, values)| {
                let sum = LayerSum {
                    values: vec![0.0; values.len()],
                    weight: 0.0,
                };
                (name.clone(), sum)
            })
            .collect();
        Self {
            model_name: model_name.to_string(),
            layers,
            sites: Vec::new(),
        }
    }

    /// Gets the number of aggregated updates.
    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// Folds `update` into the running sums.
    ///
    /// A layer that is missing from the update or has a different length than the template is
    /// skipped, the remaining layers of the update still count.
    pub fn aggregate(&mut self, update: &WeightedUpdate) {
        for (name, sum) in self.layers.iter_mut() {
            match update.weights.get(name) {
                Some(values) if values.len() == sum.values.len() => {
                    for (acc, value) in sum.values.iter_mut().zip(values) {
                        *acc += value * update.weight;
                    }
                    sum.weight += update.weight;
                }
                Some(values) => warn!(
                    "skipping layer {} of site {} for model {}: expected length {}, got {}",
                    name,
                    update.site_id,
                    self.model_name,
                    sum.values.len(),
                    values.len()
                ),
                None => warn!(
                    "skipping layer {} of site {} for model {}: layer missing",
                    name, update.site_id, self.model_name
                ),
            }
        }
        for name in update.weights.keys() {
            if !self.layers.contains_key(name) {
                debug!(
                    "ignoring layer {} of site {}: not part of the template",
                    name, update.site_id
                );
            }
        }
        self.sites.push(update.site_id.clone());
    }

    /// Divides the running sums by the accumulated weights.
    ///
    /// A layer without any contributing weight is all-zero.
    pub fn finish(self) -> (Layers, Vec<String>) {
        let weights = self
            .layers
            .into_iter()
            .map(|(name, LayerSum { values, weight })| {
                let mean = if weight == 0.0 {
                    vec![0.0; values.len()]
                } else {
                    values.into_iter().map(|value| value / weight).collect()
                };
                (name, mean)
            })
            .collect();
        (weights, self.sites)
    }
}

/// Computes the weighted per-layer mean of `updates`.
///
/// # Errors
/// Fails with [`AggregationError::EmptyBatch`] if there are no updates.
pub fn aggregate(
    model_name: &str,
    updates: &[WeightedUpdate],
) -> Result<AggregationResult, AggregationError> {
    let started = Instant::now();
    let first = updates.first().ok_or(AggregationError::EmptyBatch)?;

    let mut aggregation = StreamingAggregation::new(model_name, &first.weights);
    for update in updates {
        aggregation.aggregate(update);
    }
    let participants = aggregation.len() as u32;
    let (weights, sites) = aggregation.finish();

    Ok(AggregationResult {
        weights,
        metadata: AggregationMetadata {
            participants,
            duration_ms: started.elapsed().as_millis() as u64,
            sites,
        },
    })
}
