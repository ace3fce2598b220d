use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 18600;
pub const DEFAULT_HOSTNAME: &str = "127.0.0.1";
/// Master polls every live worker's lag on this cadence.
pub const PERF_MONITOR_INTERVAL_MS: u64 = 1000;
/// Workers self-sample their own event-loop lag on this cadence.
pub const WORKER_LAG_INTERVAL_MS: u64 = 250;
/// Grace period before a fatally-errored process exits, so logs can flush.
pub const SHUTDOWN_GRACE_MS: u64 = 10_000;

/// Top-level config (hive.toml + HIVE_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HiveConfig {
    #[serde(default)]
    pub settings: SettingsConfig,
    #[serde(default)]
    pub listen: ListenConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsConfig {
    #[serde(default = "default_product_name")]
    pub product_name: String,
    /// Number of worker processes. 0 means one per available core.
    #[serde(default)]
    pub worker_count: usize,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            product_name: default_product_name(),
            worker_count: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Cycle through workers instead of hashing the client address.
    #[serde(default)]
    pub enable_round_robin: bool,
    /// Route to the worker with the lowest event-loop lag when known.
    #[serde(default)]
    pub enable_perf_monitor: bool,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            port: default_port(),
            enable_round_robin: false,
            enable_perf_monitor: false,
        }
    }
}

impl HiveConfig {
    /// Load config: explicit path > HIVE_CONFIG env > ./hive.toml.
    /// Env vars override file values (HIVE_LISTEN__PORT=9000 etc).
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("HIVE_CONFIG").ok())
            .unwrap_or_else(|| "hive.toml".to_string());

        let config: HiveConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("HIVE_").split("__"))
            .extract()
            .map_err(|e| crate::error::HiveError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Effective worker count: configured value capped by core count,
    /// 0 meaning one worker per core.
    pub fn effective_worker_count(&self) -> usize {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        match self.settings.worker_count {
            0 => cores,
            n => n.min(cores).max(1),
        }
    }
}

fn default_product_name() -> String {
    "hive".to_string()
}

fn default_hostname() -> String {
    DEFAULT_HOSTNAME.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = HiveConfig::default();
        assert_eq!(config.listen.port, DEFAULT_PORT);
        assert_eq!(config.listen.hostname, DEFAULT_HOSTNAME);
        assert!(!config.listen.enable_round_robin);
        assert!(!config.listen.enable_perf_monitor);
        assert_eq!(config.settings.worker_count, 0);
    }

    #[test]
    fn effective_worker_count_never_zero() {
        let config = HiveConfig::default();
        assert!(config.effective_worker_count() >= 1);

        let mut capped = HiveConfig::default();
        capped.settings.worker_count = 2;
        assert!(capped.effective_worker_count() >= 1);
        assert!(capped.effective_worker_count() <= 2);
    }
}
