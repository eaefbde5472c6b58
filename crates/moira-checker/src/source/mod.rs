//! Where series come from: the local retention store or a remote Graphite.

mod local;
mod remote;

use crate::error::Result;
use crate::series::Series;
use async_trait::async_trait;

pub use local::LocalSource;
pub use remote::{parse_render, RemoteSettings, RemoteSource};

/// Step assumed for metrics whose retention is unknown.
pub const DEFAULT_STEP: i64 = 60;

#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Series produced by `target` over `[from, until]`, each aligned on
    /// its own step.
    async fn fetch(&self, target: &str, from: i64, until: i64) -> Result<Vec<Series>>;
}
