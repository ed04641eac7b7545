mod aggregation;
pub mod utils;
