use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use strata::{HistoryConfig, TransportConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub bind: String,
    pub port: u16,
    /// Server address to join; runs as the authoritative server when unset.
    pub connect: Option<String>,
    /// Simulation steps per second.
    pub tick_rate: u32,
    /// Sync rounds per second.
    pub sync_rate: u32,
    pub object_count: usize,
    /// How far behind the newest frame the client renders, in milliseconds.
    pub interpolation_delay_ms: u64,
    pub transport: TransportConfig,
    pub history: HistoryConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: strata::DEFAULT_PORT,
            connect: None,
            tick_rate: 60,
            sync_rate: 20,
            object_count: 8,
            interpolation_delay_ms: 100,
            transport: TransportConfig::default(),
            history: HistoryConfig {
                retention: Some(10_000),
                ..HistoryConfig::default()
            },
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
