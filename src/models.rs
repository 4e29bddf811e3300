//! Configuration models for the DDoS mitigation service.
//!
//! These structs mirror the sections of `config/default.toml` and are
//! deserialized by the config loader.

use serde::{Deserialize, Serialize};

use crate::core::banlist::{BanPolicy, DEFAULT_BAN_TIME};
use crate::core::flow_spec::FlowSpecActionConfig;
use crate::core::thresholds::BanSettings;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Detection loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Seconds between threshold evaluation cycles
    pub evaluation_interval_seconds: u64,
    /// Seconds between session table sweeps
    pub gc_interval_seconds: u64,
    /// Sessions idle for longer than this are removed
    pub conntrack_inactivity_seconds: u64,
    /// Default ban length in seconds
    pub ban_time: u64,
    /// Lift bans automatically when they expire
    pub unban_enabled: bool,
    /// Action announced for banned entities
    pub flow_spec_action: FlowSpecActionConfig,
}

impl DetectionConfig {
    pub fn ban_policy(&self) -> BanPolicy {
        BanPolicy {
            ban_time: self.ban_time,
            unban_enabled: self.unban_enabled,
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_seconds: 1,
            gc_interval_seconds: 30,
            conntrack_inactivity_seconds: 120,
            ban_time: DEFAULT_BAN_TIME,
            unban_enabled: true,
            flow_spec_action: FlowSpecActionConfig::default(),
        }
    }
}

/// Named set of networks sharing ban settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostGroupConfig {
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
    /// Prefixes in CIDR notation
    #[serde(default)]
    pub networks: Vec<String>,
    /// Overrides the global ban settings for this group
    #[serde(default)]
    pub ban_settings: Option<BanSettings>,
    /// Overrides the global ban time for this group
    #[serde(default)]
    pub ban_policy: Option<BanPolicy>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level; `RUST_LOG` takes precedence
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Detection loop configuration
    #[serde(default)]
    pub detection: DetectionConfig,
    /// Thresholds for networks without their own settings
    #[serde(default)]
    pub ban_settings: BanSettings,
    /// Monitored networks outside any named host group
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub host_groups: Vec<HostGroupConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Host groups to load into the resolver, with the top-level networks
    /// placed in the global group first so named groups win on overlap
    pub fn resolver_host_groups(&self, global_name: &str) -> Vec<HostGroupConfig> {
        let mut groups = Vec::with_capacity(self.host_groups.len() + 1);
        if !self.networks.is_empty() {
            groups.push(HostGroupConfig {
                name: global_name.to_string(),
                parent: None,
                networks: self.networks.clone(),
                ban_settings: None,
                ban_policy: None,
            });
        }
        groups.extend(self.host_groups.iter().cloned());
        groups
    }
}
