// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// BEEHIVE NODE - CONFIGURATION
//
// TOML file first, then HIVE_* environment overrides, then validation.
// Missing sections fall back to defaults so an empty file is a valid config.
//
// Example:
//   [network]
//   root_wallet = "0xfounder"
//   root_level = 19
//
//   [storage]
//   path = "hive_data"
//
//   [api]
//   listen = "127.0.0.1:3040"
//
//   [sweep]
//   interval_secs = 300
//
//   [engine.rewards]
//   pending_window_secs = 259200
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use hive_core::config::EngineConfig;
use hive_core::{HiveError, Wallet, MAX_LEVEL};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    /// Wallet of the network root. Registered at startup if absent.
    pub root_wallet: Option<String>,
    pub root_level: u8,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            root_wallet: None,
            root_level: MAX_LEVEL,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub path: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("hive_data"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSection {
    pub listen: String,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:3040".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepSection {
    pub interval_secs: u64,
}

impl Default for SweepSection {
    fn default() -> Self {
        Self { interval_secs: 300 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub network: NetworkSection,
    pub storage: StorageSection,
    pub api: ApiSection,
    pub sweep: SweepSection,
    pub engine: EngineConfig,
}

impl NodeConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, HiveError> {
        toml::from_str(content).map_err(|e| HiveError::Config(format!("invalid node config: {}", e)))
    }

    /// Read `path` if given (a missing file is an error), defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self, HiveError> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p).map_err(|e| {
                    HiveError::Config(format!("cannot read {}: {}", p.display(), e))
                })?;
                Self::from_toml_str(&content)
            }
            None => Ok(Self::default()),
        }
    }

    /// Apply HIVE_* overrides from `lookup` (normally `std::env::var`).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), HiveError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("HIVE_ROOT_WALLET") {
            self.network.root_wallet = Some(v);
        }
        if let Some(v) = lookup("HIVE_ROOT_LEVEL") {
            self.network.root_level = parse_env("HIVE_ROOT_LEVEL", &v)?;
        }
        if let Some(v) = lookup("HIVE_DATA_DIR") {
            self.storage.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("HIVE_API_LISTEN") {
            self.api.listen = v;
        }
        if let Some(v) = lookup("HIVE_SWEEP_INTERVAL_SECS") {
            self.sweep.interval_secs = parse_env("HIVE_SWEEP_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("HIVE_PENDING_WINDOW_SECS") {
            self.engine.rewards.pending_window_secs = parse_env("HIVE_PENDING_WINDOW_SECS", &v)?;
        }
        if let Some(v) = lookup("HIVE_RELEASE_COOLDOWN_SECS") {
            self.engine.ledger.release_cooldown_secs =
                parse_env("HIVE_RELEASE_COOLDOWN_SECS", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), HiveError> {
        self.engine.validate()?;
        self.listen_addr()?;
        if self.sweep.interval_secs == 0 {
            return Err(HiveError::Config("sweep.interval_secs must be > 0".to_string()));
        }
        if let Some(root) = &self.network.root_wallet {
            Wallet::parse(root)?;
        }
        if self.network.root_level == 0 || self.network.root_level > MAX_LEVEL {
            return Err(HiveError::InvalidLevel(self.network.root_level));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, HiveError> {
        self.api
            .listen
            .parse()
            .map_err(|e| HiveError::Config(format!("invalid api.listen '{}': {}", self.api.listen, e)))
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, HiveError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| HiveError::Config(format!("{}='{}': {}", name, value, e)))
}
