//! Cluster administration: catalog commands that touch several shards.

mod cluster;
mod split_shard;

#[cfg(test)]
mod split_shard_test;

pub use cluster::*;
pub use split_shard::*;
