use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MonitoringConfig {
    /// Serve `/metrics` for Prometheus
    #[serde(default)]
    pub prometheus_enabled: bool,

    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,

    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            prometheus_enabled: false,
            prometheus_port: default_prometheus_port(),
            log_filter: default_log_filter(),
        }
    }
}

impl MonitoringConfig {
    /// # Errors
    /// Returns `Error::InvalidConfig` when Prometheus is enabled on port 0 or
    /// on a privileged port.
    pub fn validate(&self) -> Result<()> {
        if !self.prometheus_enabled {
            return Ok(());
        }
        if self.prometheus_port == 0 {
            return Err(Error::InvalidConfig(
                "prometheus_port cannot be 0 when enabled".into(),
            ));
        }
        if self.prometheus_port < 1024 {
            return Err(Error::InvalidConfig(format!(
                "prometheus_port {} is a privileged port (requires root)",
                self.prometheus_port
            )));
        }
        Ok(())
    }
}

fn default_prometheus_port() -> u16 {
    9090
}
fn default_log_filter() -> String {
    "shard_catalog=info".to_string()
}
