//! Test utility functions and recording stubs
//!
//! These are only used in tests and are not part of the public API.

use crate::computer::{ComputerEvent, ComputerListener, TaskComputer};
use crate::container::{reconfigure_when_idle, ContainerManager, DoneCallback, StatusProbe};
use crate::monitor::MonitorReceiver;
use crate::server::{BenchmarkManager, RequestHandle, TaskServer};
use crate::vm::{PayloadVm, TestVm};
use shared::config::ComputeConfig;
use shared::task::{
    DockerImage, ReplyEnvelope, ResourceDelta, ResourceHeader, SubtaskDescriptor, TaskHeader,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::mpsc;

/// Get current Unix timestamp in seconds
pub fn now_epoch() -> u64 {
    shared::utils::current_timestamp()
}

/// Every outbound call the Task Computer makes on the task server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerCall {
    RequestTask,
    RequestResource {
        task_id: String,
    },
    SendResults {
        subtask_id: String,
        task_id: String,
        result: serde_json::Value,
        paid_time: u64,
    },
    SendTaskFailed {
        subtask_id: String,
        task_id: String,
        reason: String,
    },
    UnpackDelta {
        task_id: String,
        delta: Option<ResourceDelta>,
    },
}

/// Task server recording every call, with scriptable request handles.
pub struct StubTaskServer {
    pub calls: Mutex<Vec<ServerCall>>,
    pub headers: Mutex<HashMap<String, TaskHeader>>,
    pub next_task_handle: Mutex<Option<RequestHandle>>,
    pub next_resource_handle: Mutex<Option<RequestHandle>>,
}

impl StubTaskServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            headers: Mutex::new(HashMap::new()),
            next_task_handle: Mutex::new(Some("h1".to_string())),
            next_resource_handle: Mutex::new(Some("r1".to_string())),
        })
    }

    pub fn insert_header(&self, task_id: &str, header: TaskHeader) {
        self.headers
            .lock()
            .unwrap()
            .insert(task_id.to_string(), header);
    }

    pub fn calls(&self) -> Vec<ServerCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Terminal outbound calls (results or failures) recorded so far.
    pub fn outcomes(&self) -> Vec<ServerCall> {
        self.calls()
            .into_iter()
            .filter(|c| {
                matches!(
                    c,
                    ServerCall::SendResults { .. } | ServerCall::SendTaskFailed { .. }
                )
            })
            .collect()
    }

    fn record(&self, call: ServerCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl TaskServer for StubTaskServer {
    fn request_task(&self) -> Option<RequestHandle> {
        self.record(ServerCall::RequestTask);
        self.next_task_handle.lock().unwrap().clone()
    }

    fn request_resource(
        &self,
        task_id: &str,
        _header: &ResourceHeader,
        _reply: &ReplyEnvelope,
    ) -> Option<RequestHandle> {
        self.record(ServerCall::RequestResource {
            task_id: task_id.to_string(),
        });
        self.next_resource_handle.lock().unwrap().clone()
    }

    fn send_results(
        &self,
        subtask_id: &str,
        task_id: &str,
        result: serde_json::Value,
        paid_time: u64,
        _reply: &ReplyEnvelope,
        _node_name: &str,
    ) {
        self.record(ServerCall::SendResults {
            subtask_id: subtask_id.to_string(),
            task_id: task_id.to_string(),
            result,
            paid_time,
        });
    }

    fn send_task_failed(
        &self,
        subtask_id: &str,
        task_id: &str,
        reason: &str,
        _reply: &ReplyEnvelope,
        _node_name: &str,
    ) {
        self.record(ServerCall::SendTaskFailed {
            subtask_id: subtask_id.to_string(),
            task_id: task_id.to_string(),
            reason: reason.to_string(),
        });
    }

    fn unpack_delta(
        &self,
        _dest_dir: &Path,
        delta: Option<&ResourceDelta>,
        task_id: &str,
    ) -> anyhow::Result<()> {
        self.record(ServerCall::UnpackDelta {
            task_id: task_id.to_string(),
            delta: delta.cloned(),
        });
        Ok(())
    }

    fn task_header(&self, task_id: &str) -> Option<TaskHeader> {
        self.headers.lock().unwrap().get(task_id).copied()
    }
}

/// Benchmark manager counting its runs.
#[derive(Default)]
pub struct StubBenchmarks {
    pub needed: bool,
    pub runs: AtomicUsize,
}

impl BenchmarkManager for StubBenchmarks {
    fn benchmarks_needed(&self) -> bool {
        self.needed
    }

    fn run_all_benchmarks(&self) {
        self.runs.fetch_add(1, Ordering::SeqCst);
    }
}

/// Container manager with a configurable VM flag; reconfiguration uses the
/// production quiescence wait.
pub struct StubContainerManager {
    pub machine: bool,
    pub builds: AtomicUsize,
    pub updates: AtomicUsize,
}

impl StubContainerManager {
    pub fn new(machine: bool) -> Arc<Self> {
        Arc::new(Self {
            machine,
            builds: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
        })
    }
}

impl ContainerManager for StubContainerManager {
    fn check_environment(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn has_machine(&self) -> bool {
        self.machine
    }

    fn build_config(&self, _config: &ComputeConfig) {
        self.builds.fetch_add(1, Ordering::SeqCst);
    }

    fn update_config(&self, status: StatusProbe, done: DoneCallback, _in_background: bool) {
        self.updates.fetch_add(1, Ordering::SeqCst);
        reconfigure_when_idle(status, done);
    }

    fn payload_runtime(&self) -> Arc<dyn PayloadVm> {
        Arc::new(TestVm)
    }
}

/// Listener recording configuration lock transitions.
#[derive(Default)]
pub struct RecordingListener {
    pub locks: Mutex<Vec<bool>>,
    pub changes: AtomicUsize,
}

impl ComputerListener for RecordingListener {
    fn lock_config(&self, on: bool) {
        self.locks.lock().unwrap().push(on);
    }

    fn config_changed(&self) {
        self.changes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Fully wired Task Computer over recording stubs.
pub struct Fixture {
    pub computer: TaskComputer,
    pub events: mpsc::Receiver<ComputerEvent>,
    pub monitor: MonitorReceiver,
    pub server: Arc<StubTaskServer>,
    pub containers: Arc<StubContainerManager>,
    pub benchmarks: Arc<StubBenchmarks>,
    /// Keeps the node root directory alive for the computer's lifetime
    #[allow(dead_code)]
    pub root: TempDir,
}

impl Fixture {
    /// Receives the next control event and dispatches it, the way the node
    /// main loop does.
    pub async fn pump_event(&mut self) {
        let event = self.events.recv().await.expect("control channel closed");
        self.computer.handle_event(event);
    }
}

pub fn fixture() -> Fixture {
    fixture_with(ComputeConfig::default(), false, false)
}

pub fn fixture_with(config: ComputeConfig, machine: bool, benchmarks_needed: bool) -> Fixture {
    let root = TempDir::new().unwrap();
    let server = StubTaskServer::new();
    let containers = StubContainerManager::new(machine);
    let benchmarks = Arc::new(StubBenchmarks {
        needed: benchmarks_needed,
        runs: AtomicUsize::new(0),
    });
    let (event_tx, events) = mpsc::channel(64);
    let (monitor_tx, monitor) = crate::monitor::channel();

    let computer = TaskComputer::new(
        "node-under-test".to_string(),
        root.path().join("data"),
        server.clone(),
        containers.clone(),
        benchmarks.clone(),
        Arc::new(TestVm),
        monitor_tx,
        event_tx,
        &config,
    )
    .unwrap();

    Fixture {
        computer,
        events,
        monitor,
        server,
        containers,
        benchmarks,
        root,
    }
}

/// Descriptor whose payload succeeds with a well-formed result.
pub fn descriptor(
    subtask_id: &str,
    task_id: &str,
    docker_images: Vec<DockerImage>,
    deadline: u64,
) -> SubtaskDescriptor {
    descriptor_with_src(
        subtask_id,
        task_id,
        docker_images,
        deadline,
        r#"{"result": {"data": "r", "result_type": "bin"}}"#,
    )
}

pub fn descriptor_with_src(
    subtask_id: &str,
    task_id: &str,
    docker_images: Vec<DockerImage>,
    deadline: u64,
    src_code: &str,
) -> SubtaskDescriptor {
    SubtaskDescriptor {
        subtask_id: subtask_id.to_string(),
        task_id: task_id.to_string(),
        src_code: src_code.to_string(),
        extra_data: serde_json::Value::Null,
        short_description: format!("payload of {}", subtask_id),
        working_directory: PathBuf::from("work"),
        deadline,
        docker_images,
        reply: ReplyEnvelope {
            return_address: "10.0.0.1".to_string(),
            return_port: 40102,
            key_id: "key".to_string(),
            task_owner: "owner-node".to_string(),
        },
    }
}
