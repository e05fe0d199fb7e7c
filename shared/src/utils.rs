//! Utility functions for the grid node
//!
//! Hashing and validation helpers used across the node and shared crates.

use blake3::Hasher;
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Calculate BLAKE3 checksum of concatenated configuration files
///
/// Takes node.toml and compute.toml contents, concatenates them, and returns
/// a BLAKE3 hash as a hex-encoded string.
pub fn calculate_checksum(node_toml: &str, compute_toml: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update(node_toml.as_bytes());
    hasher.update(compute_toml.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Calculate BLAKE3 checksum of a byte slice
///
/// Returns the hash as a hex-encoded string (64 characters).
pub fn calculate_bytes_checksum(content: &[u8]) -> String {
    let mut hasher = Hasher::new();
    hasher.update(content);
    hasher.finalize().to_hex().to_string()
}

/// Calculate BLAKE3 checksum of file contents
pub fn calculate_file_checksum<P: AsRef<Path>>(file_path: P) -> crate::Result<String> {
    let content = fs::read(file_path)?;
    Ok(calculate_bytes_checksum(&content))
}

/// Validate node ID format
///
/// Node IDs must contain only alphanumeric characters, hyphens, and
/// underscores. They must not be empty and should be reasonable in length.
pub fn validate_node_id(node_id: &str) -> crate::Result<()> {
    if node_id.is_empty() {
        return Err(crate::GridError::Validation("Node ID cannot be empty".to_string()).into());
    }

    if node_id.len() > 64 {
        return Err(crate::GridError::Validation(
            "Node ID cannot be longer than 64 characters".to_string(),
        )
        .into());
    }

    if !node_id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(crate::GridError::Validation(
            "Node ID can only contain alphanumeric characters, hyphens, and underscores"
                .to_string(),
        )
        .into());
    }

    Ok(())
}

/// Get current Unix timestamp in seconds
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
