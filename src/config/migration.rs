use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MigrationConfig {
    /// Documents per clone batch pulled by the recipient
    #[serde(default = "default_clone_batch_size")]
    pub clone_batch_size: usize,

    /// Upper bound on how long a write waits behind a critical section
    #[serde(default = "default_critical_section_timeout_ms")]
    pub critical_section_timeout_ms: u64,

    /// Default for `moveChunk` when the caller does not say
    #[serde(default)]
    pub wait_for_delete: bool,

    /// Documents removed per orphan cleanup step
    #[serde(default = "default_cleanup_batch_size")]
    pub cleanup_batch_size: usize,

    /// Delay before a queued range deletion becomes eligible
    #[serde(default = "default_orphan_cleanup_delay_ms")]
    pub orphan_cleanup_delay_ms: u64,

    /// Range deleter polling period
    #[serde(default = "default_range_deleter_interval_ms")]
    pub range_deleter_interval_ms: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            clone_batch_size: default_clone_batch_size(),
            critical_section_timeout_ms: default_critical_section_timeout_ms(),
            wait_for_delete: false,
            cleanup_batch_size: default_cleanup_batch_size(),
            orphan_cleanup_delay_ms: default_orphan_cleanup_delay_ms(),
            range_deleter_interval_ms: default_range_deleter_interval_ms(),
        }
    }
}

impl MigrationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.clone_batch_size == 0 {
            return Err(Error::InvalidConfig("clone_batch_size must be > 0".into()));
        }
        if self.cleanup_batch_size == 0 {
            return Err(Error::InvalidConfig("cleanup_batch_size must be > 0".into()));
        }
        if self.critical_section_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "critical_section_timeout_ms must be > 0".into(),
            ));
        }
        if self.range_deleter_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "range_deleter_interval_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_clone_batch_size() -> usize {
    128
}
fn default_critical_section_timeout_ms() -> u64 {
    5000
}
fn default_cleanup_batch_size() -> usize {
    256
}
fn default_orphan_cleanup_delay_ms() -> u64 {
    0
}
fn default_range_deleter_interval_ms() -> u64 {
    1000
}
