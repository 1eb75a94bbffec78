//! Utility functions for identifiers and timestamps.

mod ids;
pub mod timestamps;

pub use ids::{new_id, random_id};
pub use timestamps::{duration_from_secs_f64, elapsed_ms, now_utc, Timestamp};
