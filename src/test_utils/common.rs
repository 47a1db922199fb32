use std::path::Path;

use crate::BackoffPolicy;
use crate::Document;
use crate::MigrationConfig;
use crate::RetryPolicies;
use crate::Settings;
use crate::ShardSpec;

/// Retry policies without sleeping, so tests stay fast.
pub fn fast_retry() -> RetryPolicies {
    let no_sleep = BackoffPolicy {
        max_retries: 5,
        timeout_ms: 100,
        base_delay_ms: 0,
        max_delay_ms: 0,
    };
    RetryPolicies {
        stale_config: no_sleep,
        catalog_refresh: BackoffPolicy {
            max_retries: 3,
            ..no_sleep
        },
    }
}

pub fn test_migration_config() -> MigrationConfig {
    MigrationConfig {
        clone_batch_size: 2,
        critical_section_timeout_ms: 200,
        cleanup_batch_size: 2,
        ..MigrationConfig::default()
    }
}

/// `{_id: id, x: x}`
pub fn doc_x(
    id: &str,
    x: i64,
) -> Document {
    Document::new(id).with("x", x)
}

/// Settings hosting `shards` under `root`, with the fast test policies.
pub fn test_settings(
    root: &Path,
    shards: &[&str],
) -> Settings {
    let mut settings = Settings::default();
    settings.cluster.db_root_dir = root.to_path_buf();
    settings.cluster.log_dir = root.join("logs");
    settings.cluster.shards = shards
        .iter()
        .map(|name| ShardSpec {
            name: name.to_string(),
            endpoint: format!("{name}:27018"),
        })
        .collect();
    settings.retry = fast_retry();
    settings.migration = test_migration_config();
    settings
}
