//! Application configuration (TOML file, all sections optional).

use crate::storage::ProviderConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    /// Seed endpoint set, written to the store on first run when the store
    /// is still empty.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchConfig {
    /// Seconds between background health-probe ticks.
    #[serde(default = "default_probe_interval")]
    pub probe_interval_seconds: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            probe_interval_seconds: default_probe_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct StorageConfig {
    /// Path of the config database; defaults to ~/.switchboard/switchboard.db
    pub path: Option<PathBuf>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    7410
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_probe_interval() -> u64 {
    30
}

impl AppConfig {
    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Default path: ~/.switchboard/config.toml
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".switchboard")
            .join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = AppConfig::load(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.server.port, 7410);
        assert_eq!(config.dispatch.probe_interval_seconds, 30);
        assert!(config.providers.is_empty());
    }

    #[test]
    fn parses_providers_with_defaults() {
        let raw = r#"
            [server]
            port = 9000

            [[providers]]
            name = "primary"
            provider = "openai"
            api_key = "sk-test"
            model = "gpt-4o-mini"
            priority = 10
        "#;
        let config: AppConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.providers.len(), 1);
        let p = &config.providers[0];
        assert_eq!(p.name, "primary");
        assert_eq!(p.priority, 10);
        // Unset knobs fall back to the record defaults.
        assert!(p.enabled);
        assert_eq!(p.weight, 100);
        assert_eq!(p.timeout_seconds, 30);
    }
}
