//! Weight update messages.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::message::is_identifier;

/// The flattened tensors of a model, keyed by layer name.
pub type Layers = BTreeMap<String, Vec<f64>>;

#[derive(Debug, Error)]
/// Errors related to parsing a [`WeightUpdate`].
pub enum MessageError {
    #[error("failed to parse the update: {0}")]
    Parsing(#[from] serde_json::Error),
    #[error("invalid update: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
/// One site's contribution to one round of a model.
pub struct WeightUpdate {
    /// The participant chosen identifier of the site.
    #[validate(length(min = 1, max = 64), custom = "validate_identifier")]
    pub site_id: String,
    /// The model this update applies to.
    #[validate(length(min = 1, max = 64), custom = "validate_identifier")]
    pub model_name: String,
    /// The flattened tensor of every layer.
    #[validate(custom = "validate_layers")]
    pub weights: Layers,
    /// The number of samples the site trained on. Used as the default aggregation weight.
    #[validate(range(min = 1))]
    pub data_sample_count: u64,
    /// An optional quality score in `[0, 1]`.
    #[validate(range(min = 0.0, max = 1.0))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_quality: Option<f64>,
    /// The time the update was created, in milliseconds since the unix epoch.
    pub timestamp: i64,
    /// A single-use token. Together with the model name and the site identifier it identifies
    /// the update for replay protection.
    #[validate(length(min = 1, max = 128), custom = "validate_identifier")]
    pub nonce: String,
    /// The time the coordinator accepted the update. Set by the coordinator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<i64>,
    /// The authenticated caller that uploaded the update. Set by the coordinator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_by: Option<String>,
}

impl WeightUpdate {
    /// Parses and validates an update from its raw JSON bytes.
    ///
    /// # Errors
    /// Fails if the bytes are not a JSON encoded update or if any field is out of bounds.
    pub fn parse(raw: &[u8]) -> Result<Self, MessageError> {
        let update: WeightUpdate = serde_json::from_slice(raw)?;
        update.validate()?;
        Ok(update)
    }

    /// Stamps the provenance of an accepted update, overriding anything the producer sent.
    pub fn stamp(&mut self, received_at: i64, uploaded_by: &str) {
        self.received_at = Some(received_at);
        self.uploaded_by = Some(uploaded_by.to_string());
    }
}

fn validate_identifier(value: &str) -> Result<(), ValidationError> {
    if is_identifier(value) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid characters"))
    }
}

fn validate_layers(layers: &Layers) -> Result<(), ValidationError> {
    if layers.is_empty() {
        return Err(ValidationError::new("no layers"));
    }
    for (name, values) in layers {
        if name.is_empty() || values.is_empty() {
            return Err(ValidationError::new("empty layer"));
        }
        if !values.iter().all(|value| value.is_finite()) {
            return Err(ValidationError::new("non finite weight"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> serde_json::Value {
        json!({
            "siteId": "siteA",
            "modelName": "test-model",
            "weights": { "layer0": [1.0, -0.4, 0.3, 0.8] },
            "dataSampleCount": 120,
            "dataQuality": 0.93,
            "timestamp": 1_700_000_000_000_i64,
            "nonce": "0b7f6c1e-8f8e-4a4b-9d55-cb4a0f3f0c11"
        })
    }

    fn parse(value: &serde_json::Value) -> Result<WeightUpdate, MessageError> {
        WeightUpdate::parse(value.to_string().as_bytes())
    }

    #[test]
    fn test_parse() {
        let update = parse(&payload()).unwrap();

        assert_eq!(update.site_id, "siteA");
        assert_eq!(update.model_name, "test-model");
        assert_eq!(update.weights["layer0"], vec![1.0, -0.4, 0.3, 0.8]);
        assert_eq!(update.data_sample_count, 120);
        assert_eq!(update.data_quality, Some(0.93));
        assert!(update.received_at.is_none());
        assert!(update.uploaded_by.is_none());
    }

    #[test]
    fn test_quality_is_optional() {
        let mut value = payload();
        value.as_object_mut().unwrap().remove("dataQuality");

        assert_eq!(parse(&value).unwrap().data_quality, None);
    }

    #[test]
    fn test_stamp_overrides_producer_values() {
        let mut value = payload();
        value["receivedAt"] = json!(1);
        value["uploadedBy"] = json!("mallory");
        let mut update = parse(&value).unwrap();

        update.stamp(42, "dev-simulator");
        assert_eq!(update.received_at, Some(42));
        assert_eq!(update.uploaded_by.as_deref(), Some("dev-simulator"));
    }

    #[test]
    fn test_not_json() {
        assert!(matches!(
            WeightUpdate::parse(b"site=A"),
            Err(MessageError::Parsing(_))
        ));
    }

    #[test]
    fn test_invalid_fields() {
        let cases = vec![
            ("siteId", json!("")),
            ("siteId", json!("site A")),
            ("siteId", json!("a".repeat(65))),
            ("modelName", json!("model:latest")),
            ("nonce", json!("n*")),
            ("dataSampleCount", json!(0)),
            ("dataQuality", json!(1.5)),
            ("dataQuality", json!(-0.1)),
            ("weights", json!({})),
            ("weights", json!({ "layer0": [] })),
        ];
        for (field, invalid) in cases {
            let mut value = payload();
            value[field] = invalid.clone();
            assert!(
                matches!(parse(&value), Err(MessageError::Validation(_))),
                "{} = {} should be rejected",
                field,
                invalid
            );
        }
    }

    #[test]
    fn test_missing_fields() {
        for field in &["siteId", "modelName", "weights", "dataSampleCount", "timestamp", "nonce"] {
            let mut value = payload();
            value.as_object_mut().unwrap().remove(*field);
            assert!(
                matches!(parse(&value), Err(MessageError::Parsing(_))),
                "missing {} should be rejected",
                field
            );
        }
    }

    #[test]
    fn test_non_finite_weights() {
        let mut layers = Layers::new();
        layers.insert("layer0".into(), vec![1.0, f64::NAN]);
        assert!(validate_layers(&layers).is_err());

        layers.insert("layer0".into(), vec![f64::INFINITY]);
        assert!(validate_layers(&layers).is_err());

        layers.insert("layer0".into(), vec![0.0]);
        assert!(validate_layers(&layers).is_ok());
    }
}
