//! Configuration management for the DDoS mitigation service.
//!
//! This module handles loading application configuration from a
//! configuration file layered under environment variables.

use std::env;
use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use crate::models::Config;

/// Load configuration from the file named by `CONFIG_FILE` and the environment
pub fn load_config() -> Result<Config, ConfigError> {
    let config_file = env::var("CONFIG_FILE").unwrap_or_else(|_| "config/default.toml".to_string());
    load_config_from(&config_file)
}

/// Load configuration from `config_file`, overridden by `DDOS__`-prefixed
/// environment variables (e.g. `DDOS__SERVER__PORT=9090`)
pub fn load_config_from(config_file: &str) -> Result<Config, ConfigError> {
    let config = ConfigBuilder::builder()
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 8080)?
        .set_default("detection.evaluation_interval_seconds", 1)?
        .set_default("detection.gc_interval_seconds", 30)?
        .set_default("detection.conntrack_inactivity_seconds", 120)?
        .set_default("detection.ban_time", 1900)?
        .set_default("detection.unban_enabled", true)?
        .set_default("logging.level", "info")?
        .add_source(File::with_name(config_file))
        .add_source(Environment::with_prefix("DDOS").separator("__"))
        .build()?;

    config.try_deserialize()
}
