use std::{collections::HashSet, time::Duration};

use alloy::primitives::Address;
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The port to listen for JSON-RPC requests on.
    #[serde(default = "api_port_default")]
    pub api_port: u16,
    /// The location of persistence data. If not set, an in-memory database is used and nothing survives a restart.
    #[serde(default)]
    pub data_dir: Option<String>,
    /// Hex-encoded secret key of the relay wallet. Can be overridden on the command line.
    #[serde(default)]
    pub relay_private_key: Option<String>,
    /// Upper bound on how long we wait for an on-chain event (e.g. the migration pre-registration) before giving up.
    #[serde(default = "event_timeout_default")]
    pub event_timeout: Duration,
    /// How often each world's preminted token buffer is checked.
    #[serde(default = "premint_interval_default")]
    pub premint_interval: Duration,
    /// Number of available preminted tokens to keep in stock per world.
    #[serde(default = "premint_threshold_default")]
    pub premint_threshold: usize,
    /// Per-caller limit on `getAvailableTokenId`.
    #[serde(default)]
    pub token_id_rate_limit: RateLimitConfig,
    /// Base URL of the IOU metadata forge. If not set, IOU tokens reuse the origin token URI.
    #[serde(default)]
    pub forge_url: Option<String>,
    /// The base address of the OTLP collector. If not set, metrics will not be exported.
    #[serde(default)]
    pub otlp_collector_endpoint: Option<String>,
    /// Chains this relay bridges between.
    #[serde(default)]
    pub universes: Vec<UniverseConfig>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    pub calls: u16,
    pub period: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            calls: 1,
            period: Duration::from_secs(60),
        }
    }
}

/// A configured chain. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UniverseConfig {
    pub unique_id: String,
    // Must be ws:// to support subscriptions.
    pub rpc_url: String,
    pub bridge_address: Address,
    #[serde(default)]
    pub worlds: Vec<WorldConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorldConfig {
    pub address: Address,
}

impl UniverseConfig {
    pub fn world(&self, address: Address) -> Option<&WorldConfig> {
        self.worlds.iter().find(|w| w.address == address)
    }

    pub fn world_addresses(&self) -> Vec<Address> {
        self.worlds.iter().map(|w| w.address).collect()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            api_port: api_port_default(),
            data_dir: None,
            relay_private_key: None,
            event_timeout: event_timeout_default(),
            premint_interval: premint_interval_default(),
            premint_threshold: premint_threshold_default(),
            token_id_rate_limit: RateLimitConfig::default(),
            forge_url: None,
            otlp_collector_endpoint: None,
            universes: vec![],
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.universes.is_empty() {
            return Err(anyhow!("At least one universe must be configured"));
        }
        if self.premint_threshold == 0 {
            return Err(anyhow!("premint_threshold must be at least 1"));
        }
        if self.event_timeout.is_zero() {
            return Err(anyhow!("event_timeout must be greater than zero"));
        }
        let mut ids = HashSet::new();
        for universe in &self.universes {
            if universe.unique_id.is_empty() || universe.unique_id.len() > 32 {
                return Err(anyhow!(
                    "Universe id {:?} must be between 1 and 32 bytes",
                    universe.unique_id
                ));
            }
            if !ids.insert(universe.unique_id.as_str()) {
                return Err(anyhow!("Duplicate universe id {}", universe.unique_id));
            }
            let rpc_url = Url::parse(&universe.rpc_url).map_err(|e| {
                anyhow!(
                    "Invalid rpc_url {:?} of universe {}: {e}",
                    universe.rpc_url,
                    universe.unique_id
                )
            })?;
            if !matches!(rpc_url.scheme(), "ws" | "wss") {
                return Err(anyhow!(
                    "rpc_url of universe {} must be ws:// or wss://, got {}",
                    universe.unique_id,
                    universe.rpc_url
                ));
            }
            let mut worlds = HashSet::new();
            for world in &universe.worlds {
                if !worlds.insert(world.address) {
                    return Err(anyhow!(
                        "World {} is configured twice in universe {}",
                        world.address,
                        universe.unique_id
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn universe(&self, unique_id: &str) -> Option<&UniverseConfig> {
        self.universes.iter().find(|u| u.unique_id == unique_id)
    }
}

pub fn api_port_default() -> u16 {
    4201
}

pub fn event_timeout_default() -> Duration {
    Duration::from_secs(120)
}

pub fn premint_interval_default() -> Duration {
    Duration::from_secs(1)
}

pub fn premint_threshold_default() -> usize {
    2
}
