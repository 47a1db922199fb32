use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Basic retry policy template
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Maximum number of retries
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Single operation timeout (unit: milliseconds)
    #[serde(default = "default_op_timeout_ms")]
    pub timeout_ms: u64,

    /// Backoff base (unit: milliseconds)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum backoff time (unit: milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            timeout_ms: default_op_timeout_ms(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl BackoffPolicy {
    fn validate(
        &self,
        name: &str,
    ) -> Result<()> {
        if self.max_retries == 0 {
            return Err(Error::InvalidConfig(format!(
                "retry.{name}.max_retries must be at least 1"
            )));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(Error::InvalidConfig(format!(
                "retry.{name}.base_delay_ms {} exceeds max_delay_ms {}",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }
}

/// Divide strategies by concern
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetryPolicies {
    /// Router and shard retries after StaleShardVersion / StaleDbVersion
    #[serde(default = "default_stale_config")]
    pub stale_config: BackoffPolicy,

    /// Re-reading the catalog when a listing is momentarily inconsistent
    #[serde(default = "default_catalog_refresh")]
    pub catalog_refresh: BackoffPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            stale_config: default_stale_config(),
            catalog_refresh: default_catalog_refresh(),
        }
    }
}

impl RetryPolicies {
    pub fn validate(&self) -> Result<()> {
        self.stale_config.validate("stale_config")?;
        self.catalog_refresh.validate("catalog_refresh")?;
        Ok(())
    }
}

fn default_stale_config() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 5,
        timeout_ms: 1000,
        base_delay_ms: 5,
        max_delay_ms: 200,
    }
}
fn default_catalog_refresh() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 3,
        timeout_ms: 500,
        base_delay_ms: 20,
        max_delay_ms: 500,
    }
}
fn default_max_retries() -> usize {
    3
}
fn default_op_timeout_ms() -> u64 {
    100
}
fn default_base_delay_ms() -> u64 {
    50
}
fn default_max_delay_ms() -> u64 {
    1000
}
