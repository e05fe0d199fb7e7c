//! Configuration management for the grid node
//!
//! This module handles loading, validation, and change detection of the
//! node's configuration files (node.toml and compute.toml). A checksum of
//! the raw file contents is kept so the main loop can cheaply detect edits
//! and reapply the compute options without restarting.

use anyhow::{Context, Result};
use shared::{
    config::{ComputeConfig, NodeConfig},
    utils::calculate_checksum,
    GridError,
};
use std::path::PathBuf;
use tracing::{debug, info};

/// Configuration file names are defined as constants to avoid magic strings
/// and make it easier to change them in one place if needed.
const NODE_CONFIG_FILE: &str = "node.toml";
const COMPUTE_CONFIG_FILE: &str = "compute.toml";

/// Manages node configuration loading and validation.
pub struct ConfigManager {
    /// Directory containing configuration files
    pub config_dir: PathBuf,
    /// Loaded node configuration, wrapped in an Option to represent the
    /// unloaded state
    pub node_config: Option<NodeConfig>,
    /// Loaded compute configuration, also optional
    pub compute_config: Option<ComputeConfig>,
    /// Checksum of the configuration files' raw content, used to detect
    /// changes without parsing the files every time
    pub current_checksum: Option<String>,
}

impl ConfigManager {
    /// Create a new configuration manager, failing early if the config
    /// directory is missing or not a directory.
    pub fn new(config_dir: PathBuf) -> Result<Self> {
        if !config_dir.exists() {
            return Err(GridError::Config(format!(
                "Configuration directory does not exist: {}",
                config_dir.display()
            ))
            .into());
        }

        if !config_dir.is_dir() {
            return Err(GridError::Config(format!(
                "Configuration path is not a directory: {}",
                config_dir.display()
            ))
            .into());
        }

        Ok(Self {
            config_dir,
            node_config: None,
            compute_config: None,
            current_checksum: None,
        })
    }

    /// Loads and validates both configuration files and records their
    /// checksum.
    pub async fn load_config(&mut self) -> Result<()> {
        let (node_raw, compute_raw) = self.read_raw_files().await?;

        let node_config: NodeConfig = toml::from_str(&node_raw)
            .map_err(|e| GridError::Config(format!("Failed to parse {}: {}", NODE_CONFIG_FILE, e)))?;
        node_config
            .validate()
            .with_context(|| format!("Invalid {}", NODE_CONFIG_FILE))?;

        let compute_config: ComputeConfig = toml::from_str(&compute_raw).map_err(|e| {
            GridError::Config(format!("Failed to parse {}: {}", COMPUTE_CONFIG_FILE, e))
        })?;
        compute_config
            .validate()
            .with_context(|| format!("Invalid {}", COMPUTE_CONFIG_FILE))?;

        self.current_checksum = Some(calculate_checksum(&node_raw, &compute_raw));
        debug!(
            "Configuration loaded, checksum {}",
            self.current_checksum.as_deref().unwrap_or("-")
        );

        self.node_config = Some(node_config);
        self.compute_config = Some(compute_config);
        Ok(())
    }

    /// Checks whether the configuration files changed on disk; reloads them
    /// if so. Returns true when a new configuration was loaded.
    pub async fn check_for_changes(&mut self) -> Result<bool> {
        let (node_raw, compute_raw) = self.read_raw_files().await?;
        let checksum = calculate_checksum(&node_raw, &compute_raw);

        if self.current_checksum.as_deref() == Some(checksum.as_str()) {
            return Ok(false);
        }

        info!("Configuration files changed on disk, reloading");
        self.load_config().await?;
        Ok(true)
    }

    async fn read_raw_files(&self) -> Result<(String, String)> {
        let node_path = self.config_dir.join(NODE_CONFIG_FILE);
        let compute_path = self.config_dir.join(COMPUTE_CONFIG_FILE);

        let node_raw = tokio::fs::read_to_string(&node_path)
            .await
            .map_err(|e| GridError::Config(format!("Failed to read {}: {}", node_path.display(), e)))?;
        let compute_raw = tokio::fs::read_to_string(&compute_path)
            .await
            .map_err(|e| {
                GridError::Config(format!("Failed to read {}: {}", compute_path.display(), e))
            })?;

        Ok((node_raw, compute_raw))
    }
}
