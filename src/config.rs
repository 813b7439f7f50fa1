use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::Role;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// `etcd` or `memory`.
    pub backend: String,
    pub etcd_endpoints: Vec<String>,
    pub container_path: String,
    /// Per-attempt bound on every replicated store call.
    pub timeout_ms: u64,
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: "etcd".into(),
            etcd_endpoints: vec!["http://127.0.0.1:2379".into()],
            container_path: "/minion/containers".into(),
            timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubstrateConfig {
    pub enabled: bool,
    pub namespace: String,
    pub interval_secs: u64,
}

impl Default for SubstrateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: "default".into(),
            interval_secs: 10,
        }
    }
}

/// Facts about this node used to seed the local store at start up.  Other
/// subsystems keep the rows current afterwards.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MinionConfig {
    pub role: Role,
    pub private_ip: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub provider: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub region: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub size: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub floating_ip: String,
    pub leader: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub store: StoreConfig,
    pub substrate: SubstrateConfig,
    pub minion: MinionConfig,
    pub sync_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            substrate: SubstrateConfig::default(),
            minion: MinionConfig::default(),
            sync_interval_secs: 2,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let mut config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("steward.toml"))
            .merge(Json::file("steward.json"))
            .merge(Env::prefixed("STEWARD_").split("__"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Endpoints may be mounted as a file, one per line.
        if let Ok(endpoints_file) = std::env::var("STEWARD_ETCD_ENDPOINTS_FILE") {
            config.store.etcd_endpoints = std::fs::read_to_string(endpoints_file)?
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn substrate_interval(&self) -> Duration {
        Duration::from_secs(self.substrate.interval_secs)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.sync_interval_secs == 0 || self.substrate.interval_secs == 0 {
            return Err(anyhow::anyhow!("Loop intervals must be non-zero"));
        }
        if self.store.timeout_ms == 0 {
            return Err(anyhow::anyhow!("store.timeout_ms must be non-zero"));
        }
        if self.store.backend == "etcd" && self.store.etcd_endpoints.is_empty() {
            return Err(anyhow::anyhow!("The etcd backend needs at least one endpoint"));
        }
        Ok(())
    }
}
