use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{OracleError, OracleResult};

pub const DEFAULT_TOTAL_LAYERS: u32 = 32;

/// A node whose newest heartbeat (telemetry, registration, or ready call) is
/// older than this is treated as gone.
pub const HEARTBEAT_TIMEOUT_SECS: u64 = 600;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OracleConfig {
    pub data_dir: PathBuf,
    pub key_path: PathBuf,
    pub api_listen: SocketAddr,
    pub rpc_url: String,
    #[serde(default)]
    pub ws_url: Option<String>,
    pub chain_id: u64,
    #[serde(default)]
    pub agent_registry_address: String,
    #[serde(default)]
    pub reward_pool_address: String,
    #[serde(default)]
    pub challenge_manager_address: String,
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
    #[serde(default = "default_challenge_interval_ms")]
    pub challenge_interval_ms: u64,
    #[serde(default = "default_report_interval_blocks")]
    pub report_interval_blocks: u64,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub production: bool,
    /// Per-model layer counts; models absent here fall back to
    /// [`DEFAULT_TOTAL_LAYERS`].
    #[serde(default)]
    pub model_layers: BTreeMap<String, u32>,
    /// Per-model memory requirement in MB for standalone serving.
    #[serde(default)]
    pub model_memory_mb: BTreeMap<String, u64>,
}

fn default_monitor_interval_ms() -> u64 {
    30_000
}

fn default_challenge_interval_ms() -> u64 {
    300_000
}

fn default_report_interval_blocks() -> u64 {
    1_200
}

impl OracleConfig {
    pub fn load(path: &Path) -> OracleResult<Self> {
        let content = fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&content)
            .map_err(|err| OracleError::Config(format!("unable to parse config: {err}")))?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> OracleResult<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> OracleResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| OracleError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> OracleResult<()> {
        fs::create_dir_all(&self.data_dir)?;
        if let Some(parent) = self.key_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    /// Deployment settings come from the environment and take precedence
    /// over the config file.
    fn apply_env_overrides(&mut self) -> OracleResult<()> {
        if let Ok(value) = env::var("RPC_URL") {
            self.rpc_url = value;
        }
        if let Ok(value) = env::var("WS_URL") {
            self.ws_url = Some(value);
        }
        if let Ok(value) = env::var("CHAIN_ID") {
            self.chain_id = parse_env("CHAIN_ID", &value)?;
        }
        if let Ok(value) = env::var("AGENT_REGISTRY_ADDRESS") {
            self.agent_registry_address = value;
        }
        if let Ok(value) = env::var("REWARD_POOL_ADDRESS") {
            self.reward_pool_address = value;
        }
        if let Ok(value) = env::var("CHALLENGE_MANAGER_ADDRESS") {
            self.challenge_manager_address = value;
        }
        if let Ok(value) = env::var("MONITOR_INTERVAL_MS") {
            self.monitor_interval_ms = parse_env("MONITOR_INTERVAL_MS", &value)?;
        }
        if let Ok(value) = env::var("CHALLENGE_INTERVAL_MS") {
            self.challenge_interval_ms = parse_env("CHALLENGE_INTERVAL_MS", &value)?;
        }
        if let Ok(value) = env::var("REPORT_INTERVAL_BLOCKS") {
            self.report_interval_blocks = parse_env("REPORT_INTERVAL_BLOCKS", &value)?;
        }
        if let Ok(value) = env::var("DATA_DIR") {
            self.data_dir = PathBuf::from(value);
        }
        if let Ok(value) = env::var("API_PORT") {
            let port: u16 = parse_env("API_PORT", &value)?;
            self.api_listen.set_port(port);
        }
        if let Ok(value) = env::var("ORACLE_API_KEY") {
            if !value.is_empty() {
                self.api_key = Some(value);
            }
        }
        if let Ok(value) = env::var("NODE_ENV") {
            self.production = value.eq_ignore_ascii_case("production");
        }
        Ok(())
    }

    /// Production refuses to boot with the permissive development defaults.
    fn validate(&self) -> OracleResult<()> {
        if !self.production {
            return Ok(());
        }
        for (name, value) in [
            ("AGENT_REGISTRY_ADDRESS", &self.agent_registry_address),
            ("REWARD_POOL_ADDRESS", &self.reward_pool_address),
            ("CHALLENGE_MANAGER_ADDRESS", &self.challenge_manager_address),
        ] {
            if value.is_empty() {
                return Err(OracleError::Config(format!(
                    "{name} is required in production"
                )));
            }
        }
        if self.rpc_url.is_empty() {
            return Err(OracleError::Config("RPC_URL is required in production".into()));
        }
        Ok(())
    }

    pub fn total_layers(&self, model: &str) -> u32 {
        self.model_layers
            .get(model)
            .copied()
            .unwrap_or(DEFAULT_TOTAL_LAYERS)
    }

    pub fn model_memory_requirement_mb(&self, model: &str) -> Option<u64> {
        self.model_memory_mb.get(model).copied()
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> OracleResult<T> {
    value
        .parse()
        .map_err(|_| OracleError::Config(format!("invalid {name}: {value}")))
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            key_path: PathBuf::from("./keys/oracle.toml"),
            api_listen: "127.0.0.1:8545".parse().expect("valid socket addr"),
            rpc_url: "http://127.0.0.1:9650".to_string(),
            ws_url: None,
            chain_id: 1,
            agent_registry_address: String::new(),
            reward_pool_address: String::new(),
            challenge_manager_address: String::new(),
            monitor_interval_ms: default_monitor_interval_ms(),
            challenge_interval_ms: default_challenge_interval_ms(),
            report_interval_blocks: default_report_interval_blocks(),
            api_key: None,
            production: false,
            model_layers: BTreeMap::new(),
            model_memory_mb: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn production_requires_contract_addresses() {
        let mut config = OracleConfig::default();
        config.production = true;
        assert!(config.validate().is_err());
        config.agent_registry_address = "0x01".into();
        config.reward_pool_address = "0x02".into();
        config.challenge_manager_address = "0x03".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn layer_lookup_falls_back_to_default() {
        let mut config = OracleConfig::default();
        config.model_layers.insert("llama-70b".into(), 80);
        assert_eq!(config.total_layers("llama-70b"), 80);
        assert_eq!(config.total_layers("unknown"), DEFAULT_TOTAL_LAYERS);
    }
}
