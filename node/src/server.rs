//! Task server and benchmark manager interfaces
//!
//! The task server is the node's window onto the rest of the grid: it offers
//! subtasks, arranges resource transfers, and transports outcomes back to the
//! requestor. The node never talks to the network directly; everything goes
//! through this trait.
//!
//! All methods must return promptly. Implementations backed by real
//! transports enqueue the outbound message and perform I/O on their own
//! workers; blocking here would stall the control loop.

use shared::task::{ReplyEnvelope, ResourceDelta, ResourceHeader, TaskHeader};
use std::path::Path;
use tracing::{debug, info, warn};

/// Opaque identifier of an in-flight network request session.
pub type RequestHandle = String;

/// The task server consumed by the Task Computer.
pub trait TaskServer: Send + Sync {
    /// Asks the grid for a new subtask offer. Returns a session handle if a
    /// request could be issued, `None` otherwise.
    fn request_task(&self) -> Option<RequestHandle>;

    /// Requests the input bundle for an accepted task. The header describes
    /// resources already present locally so only a delta is transferred.
    fn request_resource(
        &self,
        task_id: &str,
        header: &ResourceHeader,
        reply: &ReplyEnvelope,
    ) -> Option<RequestHandle>;

    /// Delivers a successful result to the requestor.
    #[allow(clippy::too_many_arguments)]
    fn send_results(
        &self,
        subtask_id: &str,
        task_id: &str,
        result: serde_json::Value,
        paid_time: u64,
        reply: &ReplyEnvelope,
        node_name: &str,
    );

    /// Delivers a failure to the requestor.
    fn send_task_failed(
        &self,
        subtask_id: &str,
        task_id: &str,
        reason: &str,
        reply: &ReplyEnvelope,
        node_name: &str,
    );

    /// Unpacks a received resource delta into the given directory.
    /// Synchronous local filesystem work.
    fn unpack_delta(
        &self,
        dest_dir: &Path,
        delta: Option<&ResourceDelta>,
        task_id: &str,
    ) -> anyhow::Result<()>;

    /// Looks up the task header kept for a known task id.
    fn task_header(&self, task_id: &str) -> Option<TaskHeader>;
}

/// Benchmarking subsystem, consulted when configuration changes.
pub trait BenchmarkManager: Send + Sync {
    /// Whether benchmark results are missing or stale.
    fn benchmarks_needed(&self) -> bool;

    /// Runs the full benchmark suite. May take a while; implementations run
    /// the heavy part on their own workers.
    fn run_all_benchmarks(&self);
}

/// Task server used while no grid transport session is attached: requests
/// yield no handles and outcomes are logged locally. A deployment replaces
/// this with its transport-backed implementation.
pub struct DetachedTaskServer;

impl TaskServer for DetachedTaskServer {
    fn request_task(&self) -> Option<RequestHandle> {
        debug!("No transport session attached, task request not sent");
        None
    }

    fn request_resource(
        &self,
        task_id: &str,
        _header: &ResourceHeader,
        _reply: &ReplyEnvelope,
    ) -> Option<RequestHandle> {
        debug!(
            "No transport session attached, resource request for task {} not sent",
            task_id
        );
        None
    }

    fn send_results(
        &self,
        subtask_id: &str,
        task_id: &str,
        _result: serde_json::Value,
        paid_time: u64,
        _reply: &ReplyEnvelope,
        _node_name: &str,
    ) {
        info!(
            subtask_id,
            task_id, paid_time, "Result computed with no transport session attached"
        );
    }

    fn send_task_failed(
        &self,
        subtask_id: &str,
        task_id: &str,
        reason: &str,
        _reply: &ReplyEnvelope,
        _node_name: &str,
    ) {
        warn!(
            subtask_id,
            task_id, reason, "Subtask failed with no transport session attached"
        );
    }

    fn unpack_delta(
        &self,
        _dest_dir: &Path,
        _delta: Option<&ResourceDelta>,
        _task_id: &str,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn task_header(&self, _task_id: &str) -> Option<TaskHeader> {
        None
    }
}

/// Benchmark manager for nodes that never benchmark.
pub struct NoBenchmarks;

impl BenchmarkManager for NoBenchmarks {
    fn benchmarks_needed(&self) -> bool {
        false
    }

    fn run_all_benchmarks(&self) {
        debug!("Benchmarking is disabled on this node");
    }
}
