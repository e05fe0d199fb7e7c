//! Subtask and task types exchanged with the task server
//!
//! A *task* is the enclosing work unit owned by a remote requestor; a
//! *subtask* is the slice of it assigned to this node. The task server hands
//! out subtask descriptors, and every outcome is routed back through the
//! reply envelope carried by the descriptor.

use crate::utils::current_timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Transport-layer metadata describing how a resource bundle should be
/// unpacked onto local disk. Opaque to the node; produced and consumed by the
/// transfer layer.
pub type ResourceDelta = serde_json::Value;

/// Routing information for the eventual outcome of a subtask.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplyEnvelope {
    /// Address the requestor listens on for results
    pub return_address: String,
    /// Port the requestor listens on for results
    pub return_port: u16,
    /// Key identifying the requestor
    pub key_id: String,
    /// Node id of the task owner
    pub task_owner: String,
}

/// Reference to a container image a subtask may be executed in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DockerImage {
    pub repository: String,
    pub tag: String,
}

impl DockerImage {
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
        }
    }
}

impl fmt::Display for DockerImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

/// A unit of work offered to this node. Immutable once accepted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubtaskDescriptor {
    /// Unique id of this subtask
    pub subtask_id: String,
    /// Id of the enclosing task
    pub task_id: String,
    /// Opaque payload source executed by a worker
    pub src_code: String,
    /// Opaque payload parameters
    #[serde(default)]
    pub extra_data: serde_json::Value,
    /// Human-readable description shown in progress snapshots
    pub short_description: String,
    /// Working directory of the payload, relative to the task resource dir
    pub working_directory: PathBuf,
    /// Absolute deadline as Unix epoch seconds
    pub deadline: u64,
    /// Images the payload may run in; empty means direct computation
    #[serde(default)]
    pub docker_images: Vec<DockerImage>,
    /// Where to send the outcome
    pub reply: ReplyEnvelope,
}

/// Per-task metadata supplied by the external task keeper.
///
/// `subtask_timeout` is the payment ceiling: a completed subtask is paid for
/// this duration regardless of actual wall-clock time, so withholding a
/// finished result earns nothing extra.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskHeader {
    /// Absolute task deadline as Unix epoch seconds
    pub deadline: u64,
    /// Billable duration per subtask, in seconds
    pub subtask_timeout: u64,
}

/// Listing of resources already present locally for a task, sent along with
/// a resource request so the transfer layer can compute a delta.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceHeader {
    pub task_id: String,
    /// Relative path and BLAKE3 checksum of each file already on disk
    pub files: Vec<ResourceFileEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceFileEntry {
    pub path: String,
    pub checksum: String,
}

/// Converts an absolute epoch-seconds deadline into a timeout from now.
///
/// A deadline already in the past yields a zero timeout, which makes the
/// worker report a timeout on its first deadline check.
pub fn deadline_to_timeout(deadline: u64) -> Duration {
    Duration::from_secs(deadline.saturating_sub(current_timestamp()))
}
