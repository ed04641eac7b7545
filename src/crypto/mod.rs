//! Authenticity and recency checks for inbound weight updates.
//!
//! Both checks report a plain `bool` and never fail, so that the caller decides explicitly how
//! to reject an update.

pub mod freshness;
pub mod sign;

pub use self::{
    freshness::{is_recent, DEFAULT_FRESHNESS_WINDOW},
    sign::{sign, verify},
};
