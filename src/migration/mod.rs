//! Chunk migration between two shards.

mod coordinator;

#[cfg(test)]
mod coordinator_test;

pub use coordinator::*;
