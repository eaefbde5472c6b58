//! Metric ingestion: Graphite line parsing, retention policy, the pattern
//! index and the sharded filter workers that write matched points to the
//! retention store.

pub mod error;
pub mod filter;
pub mod index;
pub mod line;
pub mod listener;
pub mod lru;
pub mod patterns;
pub mod retention;
pub mod stats;

#[cfg(test)]
mod tests;

pub use error::{FilterError, Result};
pub use filter::{FilterSettings, MetricFilter};
pub use index::tags::RegexTreatment;
pub use index::PatternIndex;
pub use patterns::PatternStorage;
pub use retention::RetentionConfig;
pub use stats::FilterStats;
