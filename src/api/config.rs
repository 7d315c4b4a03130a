// Configuration for the deployment orchestrator
//
// This module handles loading, saving and validating orchestrator settings.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::ethereum::chain::ChainRegistry;
use crate::upgrade::DEFAULT_UPGRADE_FUNCTION;

/// Proxy artifact and upgrade entry point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Artifact deployed in front of implementations; its constructor takes
    /// `(address implementation, bytes data)`
    pub artifact: String,
    /// Function called on the proxy to swap implementations
    pub upgrade_function: String,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            artifact: "ERC1967Proxy".to_string(),
            upgrade_function: DEFAULT_UPGRADE_FUNCTION.to_string(),
        }
    }
}

/// Orchestrator settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Network name recorded in manifests
    pub network: String,
    /// Expected chain id, if known
    pub chain_id: Option<u64>,
    pub rpc_url: String,
    /// How long to wait for one confirmation
    pub confirmation_timeout_secs: u64,
    pub artifacts_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub audit_log: PathBuf,
    pub proxy: ProxySettings,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            network: "localhost".to_string(),
            chain_id: None,
            rpc_url: "http://127.0.0.1:8545".to_string(),
            confirmation_timeout_secs: 120,
            artifacts_dir: PathBuf::from("artifacts"),
            manifest_path: PathBuf::from("deployments/localhost.json"),
            audit_log: PathBuf::from("deployments/upgrades.jsonl"),
            proxy: ProxySettings::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    /// Reject a confirmation timeout shorter than the chain's block time
    pub fn validate(&self, registry: &ChainRegistry) -> Result<(), ConfigError> {
        let block_time = registry.block_time(self.chain_id, &self.network);
        if self.confirmation_timeout() < block_time {
            return Err(ConfigError::TimeoutBelowBlockTime {
                timeout: self.confirmation_timeout(),
                block_time,
                network: self.network.clone(),
            });
        }
        Ok(())
    }
}

/// Configuration manager for the orchestrator
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from a file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<OrchestratorConfig> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration {}", path.display()))?;
        let config = serde_json::from_str(&config_str)
            .with_context(|| format!("Invalid configuration {}", path.display()))?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(config: &OrchestratorConfig, path: P) -> Result<()> {
        let config_str = serde_json::to_string_pretty(config)?;
        fs::write(path, config_str)?;
        Ok(())
    }

    /// Create a builder for configuration
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for creating configurations
#[derive(Default)]
pub struct ConfigBuilder {
    config: OrchestratorConfig,
}

impl ConfigBuilder {
    /// Set the network name
    pub fn network(mut self, value: &str) -> Self {
        self.config.network = value.to_string();
        self
    }

    pub fn chain_id(mut self, value: u64) -> Self {
        self.config.chain_id = Some(value);
        self
    }

    pub fn rpc_url(mut self, value: &str) -> Self {
        self.config.rpc_url = value.to_string();
        self
    }

    /// Set the confirmation timeout in seconds
    pub fn confirmation_timeout_secs(mut self, value: u64) -> Self {
        self.config.confirmation_timeout_secs = value;
        self
    }

    pub fn artifacts_dir<P: Into<PathBuf>>(mut self, value: P) -> Self {
        self.config.artifacts_dir = value.into();
        self
    }

    pub fn manifest_path<P: Into<PathBuf>>(mut self, value: P) -> Self {
        self.config.manifest_path = value.into();
        self
    }

    pub fn audit_log<P: Into<PathBuf>>(mut self, value: P) -> Self {
        self.config.audit_log = value.into();
        self
    }

    /// Set the proxy artifact name
    pub fn proxy_artifact(mut self, value: &str) -> Self {
        self.config.proxy.artifact = value.to_string();
        self
    }

    pub fn upgrade_function(mut self, value: &str) -> Self {
        self.config.proxy.upgrade_function = value.to_string();
        self
    }

    /// Build the configuration
    pub fn build(self) -> OrchestratorConfig {
        self.config
    }
}
