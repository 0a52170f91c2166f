//! Daemon configuration
//!
//! Loaded from an optional TOML file; every section falls back to its
//! defaults.

use anyhow::{Context, Result};
use flowgate_core::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Simulated filter agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Registry slot to connect on
    pub unit: u32,
    /// Policy control unit to register for
    pub policy_unit: u32,
    /// Undelivered events the channel holds before back pressure
    pub channel_capacity: usize,
    /// Outbound payloads containing any of these are dropped
    pub blocked: Vec<String>,
    /// Stats reporting interval requested on every flow (0 = off)
    pub stats_interval_ms: u32,
    /// Key installed with `SetCryptoKey`, if any
    pub crypto_key: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            unit: 1,
            policy_unit: 1,
            channel_capacity: 64,
            blocked: vec!["forbidden".to_string()],
            stats_interval_ms: 500,
            crypto_key: Some("flowgate-demo".to_string()),
        }
    }
}

/// Scripted traffic
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficConfig {
    /// Stream connections to open
    pub connections: usize,
    /// Messages sent per connection
    pub messages: usize,
    /// Datagrams sent on the datagram socket
    pub datagrams: usize,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            connections: 4,
            messages: 8,
            datagrams: 16,
        }
    }
}

/// Complete daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub engine: EngineConfig,
    pub agent: AgentConfig,
    pub traffic: TrafficConfig,
}

impl DaemonConfig {
    /// Read a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        config.engine.validate().context("invalid engine configuration")?;
        Ok(config)
    }
}
