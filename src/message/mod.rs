//! The messages exchanged with participating sites.

mod update;

pub use self::update::{Layers, MessageError, WeightUpdate};

/// Checks that `value` only uses characters that are safe to embed in a store key.
pub fn is_identifier(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}
