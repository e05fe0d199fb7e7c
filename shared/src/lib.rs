//! Shared data structures and utilities for the compute grid node
//!
//! This crate contains the types that cross the node boundary: subtask
//! descriptors and task headers offered by the task server, configuration
//! structures, computation statistics, and common utilities.

pub mod config;
pub mod defaults;
pub mod stats;
pub mod task;
pub mod utils;

// Re-export commonly used types for convenience
pub use config::{ComputeConfig, NodeConfig};
pub use stats::CompStats;
pub use task::{
    deadline_to_timeout, DockerImage, ReplyEnvelope, ResourceDelta, ResourceHeader,
    SubtaskDescriptor, TaskHeader,
};
pub use utils::{calculate_checksum, validate_node_id};

/// Result type alias used throughout the shared crate
pub type Result<T> = anyhow::Result<T>;

/// Common error types for the grid node
#[derive(Debug, thiserror::Error)]
pub enum GridError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Resource error: {0}")]
    Resources(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GridError::Validation("bad node id".to_string());
        assert_eq!(err.to_string(), "Validation error: bad node id");
    }
}
