use std::sync::Arc;

use dashmap::DashMap;

use crate::Result;
use crate::RoutingError;
use crate::ShardServer;

/// Live shard handles by name, shared by the router and the admin surface.
#[derive(Debug, Clone, Default)]
pub struct ShardRegistry {
    shards: Arc<DashMap<String, Arc<ShardServer>>>,
}

impl ShardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        shard: Arc<ShardServer>,
    ) {
        self.shards.insert(shard.name().to_string(), shard);
    }

    pub fn get(
        &self,
        name: &str,
    ) -> Result<Arc<ShardServer>> {
        self.shards
            .get(name)
            .map(|s| s.clone())
            .ok_or_else(|| RoutingError::ShardNotFound(name.to_string()).into())
    }

    /// Every registered shard in name order.
    pub fn all(&self) -> Vec<Arc<ShardServer>> {
        let mut shards: Vec<Arc<ShardServer>> = self.shards.iter().map(|s| s.clone()).collect();
        shards.sort_by(|a, b| a.name().cmp(b.name()));
        shards
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}
