//! Configuration management for the shard catalog node.
//!
//! Provides hierarchical configuration loading from multiple sources with priority:
//! 1. Default values (hardcoded)
//! 2. Files included by `config/main`
//! 3. Environment-specific config selected by `SHARD_ENV`
//! 4. Configuration file from `CONFIG_PATH`
//! 5. Local overrides in `config/local`
//! 6. Environment variables with `SHARD__` prefix (highest priority)

mod cluster;
mod migration;
mod monitoring;
mod retry;
pub use cluster::*;
pub use migration::*;
pub use monitoring::*;
pub use retry::*;


use std::collections::HashMap;
use std::env;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Result;

const ENV_PREFIX: &str = "SHARD";

#[derive(Debug, Deserialize, Default)]
struct MainConfig {
    /// List of configuration files to include
    #[serde(default)]
    includes: Vec<String>,
    /// Environment-to-config mapping (e.g., "production" -> "prod-config.toml")
    #[serde(rename = "env_config", default)]
    environments: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Settings {
    /// Node identity, storage locations and hosted shards
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// Retry policies for staleness and catalog reads
    #[serde(default)]
    pub retry: RetryPolicies,
    /// Chunk migration and orphan cleanup tuning
    #[serde(default)]
    pub migration: MigrationConfig,
    /// Metrics and monitoring settings
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

impl Settings {
    /// Loads configuration from hierarchical sources without validation.
    ///
    /// Callers MUST call `validate()` once all overrides are applied.
    pub fn new() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        let main_config: MainConfig = Config::builder()
            .add_source(File::with_name("config/main").required(false))
            .build()?
            .try_deserialize()
            .unwrap_or_default();

        for path in &main_config.includes {
            builder = builder.add_source(File::with_name(&format!("config/{path}")));
        }

        if let Ok(env_name) = env::var("SHARD_ENV") {
            if let Some(env_path) = main_config.environments.get(&env_name) {
                builder = builder.add_source(File::with_name(&format!("config/{env_path}")));
            }
        }

        if let Ok(config_path) = env::var("CONFIG_PATH") {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        builder = builder.add_source(File::with_name("config/local").required(false));

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true),
        );

        let settings: Self = builder.build()?.try_deserialize()?;
        Ok(settings)
    }

    /// Applies a node-specific file on top of the current values; environment
    /// variables still win.
    pub fn with_override_config(
        &self,
        path: &str,
    ) -> Result<Self> {
        let settings: Self = Config::builder()
            .add_source(Config::try_from(self)?)
            .add_source(File::with_name(path).required(true))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .ignore_empty(true)
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    /// Validates every section and returns the validated instance.
    pub fn validate(self) -> Result<Self> {
        self.cluster.validate()?;
        self.retry.validate()?;
        self.migration.validate()?;
        self.monitoring.validate()?;
        Ok(self)
    }
}
