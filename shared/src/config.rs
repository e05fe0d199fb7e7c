//! Configuration types and validation for the grid node
//!
//! This module defines the configuration structures loaded from `node.toml`
//! (node identity and runtime settings) and `compute.toml` (the task
//! computation options the Task Computer copies on every `change_config`),
//! including validation logic and serialization support.

use crate::defaults::*;
use crate::GridError;
use serde::{Deserialize, Serialize};

/// Main node configuration loaded from node.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    /// Unique identifier for this node, reported with every outcome
    pub node_name: String,
    /// Tick loop cadence in milliseconds (default: 1000)
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Capacity of the control event channel (default: 1000)
    #[serde(default = "default_channel_buffer_size")]
    pub channel_buffer_size: usize,
    /// Interval in seconds between configuration change checks (default: 10)
    #[serde(default = "default_config_check_interval")]
    pub config_check_interval_seconds: u64,
}

/// Task computation configuration loaded from compute.toml
///
/// These are the options `change_config` copies onto the Task Computer; the
/// file can be edited at runtime and is reloaded when its checksum moves.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComputeConfig {
    /// Seconds between task requests while idle (default: 5)
    #[serde(default = "default_task_request_interval")]
    pub task_request_interval: u64,
    /// Seconds to wait for resources of an accepted task (default: 30)
    #[serde(default = "default_waiting_for_task_timeout")]
    pub waiting_for_task_timeout: u64,
    /// Seconds to wait on an outstanding task request session (default: 60)
    #[serde(default = "default_waiting_for_task_session_timeout")]
    pub waiting_for_task_session_timeout: u64,
    /// Operator switch: whether this node accepts subtasks at all
    #[serde(default = "default_accept_tasks")]
    pub accept_tasks: bool,
    /// Whether payloads without container images may run in-process
    #[serde(default)]
    pub support_direct_computation: bool,
    /// Maximum number of concurrently assigned subtasks (default: 1)
    #[serde(default = "default_max_assigned_tasks")]
    pub max_assigned_tasks: usize,
    /// Operator switch: whether the container manager controls the node's
    /// container VM during reconfiguration (default: true)
    #[serde(default = "default_use_container_manager")]
    pub use_container_manager: bool,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            task_request_interval: default_task_request_interval(),
            waiting_for_task_timeout: default_waiting_for_task_timeout(),
            waiting_for_task_session_timeout: default_waiting_for_task_session_timeout(),
            accept_tasks: default_accept_tasks(),
            support_direct_computation: false,
            max_assigned_tasks: default_max_assigned_tasks(),
            use_container_manager: default_use_container_manager(),
        }
    }
}

impl NodeConfig {
    /// Validates node-level settings, failing early on values that would
    /// stall the tick loop or break outcome routing.
    pub fn validate(&self) -> Result<(), GridError> {
        crate::utils::validate_node_id(&self.node_name)
            .map_err(|e| GridError::Validation(e.to_string()))?;

        if self.tick_interval_ms == 0 {
            return Err(GridError::Validation(
                "tick_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.channel_buffer_size == 0 {
            return Err(GridError::Validation(
                "channel_buffer_size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl ComputeConfig {
    /// Validates task computation settings.
    pub fn validate(&self) -> Result<(), GridError> {
        if self.task_request_interval == 0 {
            return Err(GridError::Validation(
                "task_request_interval must be greater than 0".to_string(),
            ));
        }

        if self.waiting_for_task_timeout == 0 || self.waiting_for_task_session_timeout == 0 {
            return Err(GridError::Validation(
                "waiting timeouts must be greater than 0".to_string(),
            ));
        }

        if self.max_assigned_tasks == 0 {
            return Err(GridError::Validation(
                "max_assigned_tasks must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_config_defaults() {
        let config: ComputeConfig = toml::from_str("").unwrap();
        assert_eq!(config, ComputeConfig::default());
        assert_eq!(config.task_request_interval, 5);
        assert_eq!(config.max_assigned_tasks, 1);
        assert!(config.accept_tasks);
        assert!(!config.support_direct_computation);
        assert!(config.use_container_manager);
    }

    #[test]
    fn test_compute_config_overrides() {
        let config: ComputeConfig = toml::from_str(
            r#"
            task_request_interval = 15
            accept_tasks = false
            support_direct_computation = true
            "#,
        )
        .unwrap();
        assert_eq!(config.task_request_interval, 15);
        assert!(!config.accept_tasks);
        assert!(config.support_direct_computation);
        // Unset fields keep their defaults
        assert_eq!(config.waiting_for_task_timeout, 30);
    }

    #[test]
    fn test_node_config_validation() {
        let config: NodeConfig = toml::from_str(r#"node_name = "node-1""#).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.tick_interval_ms, 1000);

        let bad: NodeConfig = toml::from_str(r#"node_name = """#).unwrap();
        assert!(bad.validate().is_err());

        let bad: NodeConfig =
            toml::from_str("node_name = \"node-1\"\ntick_interval_ms = 0").unwrap();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_compute_config_validation() {
        let mut config = ComputeConfig::default();
        assert!(config.validate().is_ok());

        config.max_assigned_tasks = 0;
        assert!(config.validate().is_err());

        config = ComputeConfig::default();
        config.waiting_for_task_timeout = 0;
        assert!(config.validate().is_err());
    }
}
