use std::collections::HashSet;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// A shard hosted by this node.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ShardSpec {
    pub name: String,
    pub endpoint: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ClusterConfig {
    /// Names the node's log directory
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Recorded in each shard's migration recovery document
    #[serde(default = "default_config_connection_string")]
    pub config_connection_string: String,

    #[serde(default = "default_db_dir")]
    pub db_root_dir: PathBuf,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    #[serde(default = "default_shards")]
    pub shards: Vec<ShardSpec>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            config_connection_string: default_config_connection_string(),
            db_root_dir: default_db_dir(),
            log_dir: default_log_dir(),
            shards: default_shards(),
        }
    }
}

impl ClusterConfig {
    /// Validates cluster configuration consistency
    /// # Errors
    /// Returns `Error::InvalidConfig` if any configuration rules are violated
    pub fn validate(&self) -> Result<()> {
        if self.node_name.trim().is_empty() {
            return Err(Error::InvalidConfig("node_name cannot be empty".into()));
        }

        if self.config_connection_string.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "config_connection_string cannot be empty".into(),
            ));
        }

        if self.shards.is_empty() {
            return Err(Error::InvalidConfig(
                "shards must contain at least one shard".into(),
            ));
        }

        let mut names = HashSet::new();
        for shard in &self.shards {
            // shard names become sled tree and directory names
            if shard.name.is_empty()
                || shard.name.contains(['/', '\\', '\0'])
                || shard.name.starts_with('.')
                || shard.name == "config"
            {
                return Err(Error::InvalidConfig(format!(
                    "invalid shard name {:?}",
                    shard.name
                )));
            }
            if !names.insert(shard.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "Duplicate shard name {} in shards",
                    shard.name
                )));
            }
        }

        if self.db_root_dir.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("db_root_dir cannot be empty".into()));
        }

        Ok(())
    }
}

fn default_node_name() -> String {
    "node0".to_string()
}
fn default_config_connection_string() -> String {
    "config/localhost:27019".to_string()
}
fn default_db_dir() -> PathBuf {
    PathBuf::from("./db")
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("./logs")
}
fn default_shards() -> Vec<ShardSpec> {
    vec![
        ShardSpec {
            name: "shard0".to_string(),
            endpoint: "localhost:27018".to_string(),
        },
        ShardSpec {
            name: "shard1".to_string(),
            endpoint: "localhost:27028".to_string(),
        },
    ]
}
