//! Configuration System
//!
//! Hierarchical configuration loading from:
//! - config.toml (default configuration)
//! - config.local.toml (git-ignored local overrides)
//! - Environment variables (WEIR_* prefix)
//!
//! ```toml
//! # config.toml
//! [data]
//! data_dir = "/var/lib/weir"
//!
//! [http]
//! listen = "127.0.0.1:29380"
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! WEIR_DATA__DATA_DIR=/custom/path
//! WEIR_HTTP__LISTEN=0.0.0.0:8080
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// On-disk layout and retention
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Base directory: graph.json, bin/ artifacts, ringbufs/
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Tuples retained per exported node
    #[serde(default = "default_export_retention")]
    pub export_retention: usize,
}

/// HTTP control surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Listen address of the control API
    #[serde(default = "default_listen")]
    pub listen: String,
}

/// Worker and transport tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Words per ring buffer (payload capacity is two words less)
    #[serde(default = "default_ring_words")]
    pub ring_words: u32,

    /// Grace period between SIGTERM and SIGKILL when stopping workers
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// How often idle layers are checked against their TTL
    #[serde(default = "default_timeout_check_secs")]
    pub timeout_check_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./weir-data")
}
fn default_export_retention() -> usize {
    10_000
}
fn default_listen() -> String {
    "127.0.0.1:29380".to_string()
}
fn default_ring_words() -> u32 {
    64 * 1024
}
fn default_stop_grace_ms() -> u64 {
    2_000
}
fn default_timeout_check_secs() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Default for DataConfig {
    fn default() -> Self {
        DataConfig {
            data_dir: default_data_dir(),
            export_retention: default_export_retention(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            listen: default_listen(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            ring_words: default_ring_words(),
            stop_grace_ms: default_stop_grace_ms(),
            timeout_check_secs: default_timeout_check_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data: DataConfig::default(),
            http: HttpConfig::default(),
            runtime: RuntimeConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Merges in order:
    /// 1. config.toml (base configuration)
    /// 2. config.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (WEIR_* prefix)
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("config.toml"))
            .merge(Toml::file("config.local.toml"))
            .merge(Env::prefixed("WEIR_").split("__"))
            .extract()
    }

    /// Load configuration from a specific file path
    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("WEIR_").split("__"))
            .extract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.data.data_dir, PathBuf::from("./weir-data"));
        assert_eq!(config.data.export_retention, 10_000);
        assert_eq!(config.runtime.ring_words, 64 * 1024);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).expect("serialize");
        assert!(toml_str.contains("[data]"));
        assert!(toml_str.contains("[http]"));
        assert!(toml_str.contains("[runtime]"));
    }
}
