//! Sharding control plane: an authoritative catalog of chunk ownership,
//! versioned routing caches on routers and shards, chunk migration with a
//! critical section, orphan cleanup and cross-shard transactions.

mod cache;
mod catalog;
mod cluster;
mod config;
mod constants;
mod document;
mod errors;
mod metrics;
mod migration;
mod router;
mod shard;
pub mod utils;

pub use cache::*;
pub use catalog::*;
pub use cluster::*;
pub use config::*;
pub use document::*;
pub use errors::*;
pub use metrics::*;
pub use migration::*;
pub use router::*;
pub use shard::*;
pub use utils::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub mod test_utils;
//-----------------------------------------------------------
// Autometrics
/// autometrics: https://docs.autometrics.dev/rust/adding-alerts-and-slos
use autometrics::objectives::Objective;
use autometrics::objectives::ObjectiveLatency;
use autometrics::objectives::ObjectivePercentile;
const API_SLO: Objective = Objective::new("api")
    .success_rate(ObjectivePercentile::P99_9)
    .latency(ObjectiveLatency::Ms10, ObjectivePercentile::P99);
