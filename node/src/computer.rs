//! The Task Computer
//!
//! Per-node execution manager of the compute grid. Accepts externally
//! offered subtasks, arranges transfer of their input resources, runs them
//! in worker threads and reports exactly one outcome per subtask back to the
//! task server.
//!
//! The computer is owned by a single control task. Inbound callbacks from
//! the session layer are plain method calls on the owner; worker completion
//! and container reconfiguration land on the control event channel and are
//! drained by the owner's main loop, so every state mutation is serialized
//! without a lock. The request/wait cycle
//! (idle → requesting → waiting-for-resources → computing → idle) is driven
//! by the periodic [`run`](TaskComputer::run) tick.

use crate::container::{ContainerManager, DoneCallback, StatusProbe};
use crate::monitor::{MonitorEvent, MonitorSender};
use crate::registry::AssignedSubtasks;
use crate::resources::{DirManager, ResourcesManager};
use crate::server::{BenchmarkManager, RequestHandle, TaskServer};
use crate::vm::PayloadVm;
use crate::worker::{SubtaskProgress, Worker, WorkerKind, WorkerReport, WorkerSpec, TIMED_OUT_MSG};
use anyhow::Result;
use serde_json::Value;
use shared::config::ComputeConfig;
use shared::stats::CompStats;
use shared::task::{deadline_to_timeout, ReplyEnvelope, ResourceDelta, SubtaskDescriptor};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Messages fanned into the control task from workers and the container
/// manager.
#[derive(Debug)]
pub enum ComputerEvent {
    /// A worker terminated and posted its report
    Computed(WorkerReport),
    /// Container reconfiguration completed
    ConfigApplied { run_benchmarks: bool },
}

/// Observer of configuration lock transitions.
pub trait ComputerListener: Send + Sync {
    fn lock_config(&self, on: bool);
    fn config_changed(&self);
}

/// The per-node execution manager.
pub struct TaskComputer {
    node_name: String,
    root_dir: PathBuf,

    task_server: Arc<dyn TaskServer>,
    containers: Arc<dyn ContainerManager>,
    benchmarks: Arc<dyn BenchmarkManager>,
    direct_vm: Arc<dyn PayloadVm>,
    monitor: MonitorSender,
    events_tx: mpsc::Sender<ComputerEvent>,

    dir_manager: DirManager,
    resource_manager: ResourcesManager,

    pub(crate) registry: AssignedSubtasks,
    pub(crate) current_computations: Vec<Worker>,
    /// Non-null while an offer or resource request is in flight
    pub(crate) waiting_for_task: Option<RequestHandle>,
    /// Task id under active computation; the container manager's quiescence
    /// probe subscribes to this channel
    counting: watch::Sender<Option<String>>,

    pub(crate) task_request_frequency: u64,
    pub(crate) waiting_for_task_timeout: u64,
    pub(crate) waiting_for_task_session_timeout: u64,
    pub(crate) max_assigned_tasks: usize,
    pub(crate) compute_tasks: bool,
    pub(crate) support_direct_computation: bool,
    use_container_manager: bool,
    /// Cleared while container reconfiguration runs; no worker starts then
    pub(crate) runnable: bool,

    pub(crate) waiting_ttl: f64,
    pub(crate) use_waiting_ttl: bool,
    pub(crate) last_checking: Instant,
    pub(crate) last_task_request: Instant,

    /// Last observed resource delta, consumed by the unpack step
    pub(crate) delta: Option<ResourceDelta>,
    pub(crate) stats: CompStats,
    listeners: Vec<Arc<dyn ComputerListener>>,
}

impl TaskComputer {
    /// Creates the computer rooted at `root_dir` and applies the initial
    /// configuration, running benchmarks if the benchmark manager asks for
    /// them.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_name: String,
        root_dir: PathBuf,
        task_server: Arc<dyn TaskServer>,
        containers: Arc<dyn ContainerManager>,
        benchmarks: Arc<dyn BenchmarkManager>,
        direct_vm: Arc<dyn PayloadVm>,
        monitor: MonitorSender,
        events_tx: mpsc::Sender<ComputerEvent>,
        config: &ComputeConfig,
    ) -> Result<Self> {
        if config.use_container_manager {
            if let Err(e) = containers.check_environment() {
                warn!("Container environment check failed: {}", e);
            }
        }

        let dir_manager = DirManager::new(root_dir.clone())?;
        let resource_manager = ResourcesManager::new(dir_manager.clone());
        let now = Instant::now();

        let mut computer = Self {
            node_name,
            root_dir,
            task_server,
            containers,
            benchmarks,
            direct_vm,
            monitor,
            events_tx,
            dir_manager,
            resource_manager,
            registry: AssignedSubtasks::new(),
            current_computations: Vec::new(),
            waiting_for_task: None,
            counting: watch::channel(None).0,
            task_request_frequency: config.task_request_interval,
            waiting_for_task_timeout: config.waiting_for_task_timeout,
            waiting_for_task_session_timeout: config.waiting_for_task_session_timeout,
            max_assigned_tasks: config.max_assigned_tasks,
            compute_tasks: config.accept_tasks,
            support_direct_computation: config.support_direct_computation,
            use_container_manager: config.use_container_manager,
            runnable: true,
            waiting_ttl: 0.0,
            use_waiting_ttl: false,
            last_checking: now,
            last_task_request: now,
            delta: None,
            stats: CompStats::default(),
            listeners: Vec::new(),
        };

        let run_benchmarks = computer.benchmarks.benchmarks_needed();
        computer.change_config(config, false, run_benchmarks)?;
        Ok(computer)
    }

    /// Task id currently under active computation, if any.
    pub fn counting_task(&self) -> Option<String> {
        self.counting.borrow().clone()
    }

    /// Subscribes a read-only view of the counting task, handed to the
    /// container manager as its quiescence probe.
    #[allow(dead_code)]
    pub fn status_probe(&self) -> StatusProbe {
        self.counting.subscribe()
    }

    pub fn stats(&self) -> CompStats {
        self.stats
    }

    fn set_counting(&mut self, task_id: Option<String>) {
        self.counting.send_replace(task_id);
    }

    /// Dispatches a control event drained from the event channel.
    pub fn handle_event(&mut self, event: ComputerEvent) {
        match event {
            ComputerEvent::Computed(report) => self.task_computed(report),
            ComputerEvent::ConfigApplied { run_benchmarks } => {
                self.config_applied(run_benchmarks)
            }
        }
    }

    /// Installs an offered subtask and requests its resources. Returns false
    /// and performs no side effects if the subtask id is already assigned.
    pub fn task_given(&mut self, descriptor: SubtaskDescriptor) -> bool {
        if self.registry.contains_subtask(&descriptor.subtask_id) {
            debug!("Subtask {} offered twice, rejecting", descriptor.subtask_id);
            return false;
        }
        self.wait(true, Some(self.waiting_for_task_timeout as f64));
        let task_id = descriptor.task_id.clone();
        let reply = descriptor.reply.clone();
        self.registry.insert(descriptor);
        self.request_resource(&task_id, &reply);
        true
    }

    /// Resources for a task are available locally without an unpack step;
    /// starts the computation. `compute_task` clears the wait state through
    /// its `reset`.
    pub fn resource_given(&mut self, task_id: &str) -> bool {
        let Some(descriptor) = self.registry.get_by_task(task_id).cloned() else {
            return false;
        };
        self.compute_task(descriptor);
        true
    }

    /// The resource bundle for a task arrived; unpacks the stored delta if
    /// requested and starts the computation.
    pub fn task_resource_collected(&mut self, task_id: &str, unpack_delta: bool) -> bool {
        let Some(descriptor) = self.registry.get_by_task(task_id).cloned() else {
            return false;
        };
        let delta = self.delta.take();
        if unpack_delta {
            match self.dir_manager.get_task_resource_dir(task_id) {
                Ok(dir) => {
                    if let Err(e) = self.task_server.unpack_delta(&dir, delta.as_ref(), task_id) {
                        warn!("Failed to unpack resources of task {}: {}", task_id, e);
                    }
                }
                Err(e) => warn!("No resource dir for task {}: {}", task_id, e),
            }
        }
        self.compute_task(descriptor);
        true
    }

    /// The transfer of a task's resources failed; the subtask is removed and
    /// the failure is routed back to the requestor.
    pub fn task_resource_failure(&mut self, task_id: &str, reason: &str) {
        let Some(descriptor) = self.registry.pop_by_task(task_id) else {
            return;
        };
        warn!("Resource transfer for task {} failed: {}", task_id, reason);
        self.task_server.send_task_failed(
            &descriptor.subtask_id,
            &descriptor.task_id,
            &format!("Error downloading resources: {}", reason),
            &descriptor.reply,
            &self.node_name,
        );
        self.session_closed();
    }

    /// Records the delta describing how the incoming bundle unpacks.
    pub fn wait_for_resources(&mut self, task_id: &str, delta: ResourceDelta) {
        if self.registry.contains_task(task_id) {
            self.delta = Some(delta);
        }
    }

    /// The server refused our task request.
    pub fn task_request_rejected(&mut self, task_id: &str, reason: &str) {
        info!("Task {} request rejected: {}", task_id, reason);
        self.session_closed();
    }

    /// The server refused our resource request; the subtask is dropped.
    pub fn resource_request_rejected(&mut self, subtask_id: &str, reason: &str) {
        info!("Subtask {} resource request rejected: {}", subtask_id, reason);
        self.registry.pop_by_subtask(subtask_id);
        self.reset(None);
    }

    /// Outcome dispatcher, executed on the control task when a worker's
    /// report is drained from the event channel. Classifies the result,
    /// updates stats, posts the outcome and emits the monitor event.
    pub fn task_computed(&mut self, report: WorkerReport) {
        self.current_computations
            .retain(|w| w.subtask_id() != report.subtask_id);

        let Some(subtask) = self.registry.pop_by_subtask(&report.subtask_id) else {
            error!("No subtask with id {:?}", report.subtask_id);
            return;
        };

        // Paid for the full subtask timeout rather than wall-clock time, so
        // withholding a finished result earns nothing extra.
        let work_time_to_be_paid = match self.task_server.task_header(&subtask.task_id) {
            Some(header) => header.subtask_timeout,
            None => {
                error!("No task header for task {:?}", subtask.task_id);
                self.stats.tasks_with_errors += 1;
                self.task_server.send_task_failed(
                    &subtask.subtask_id,
                    &subtask.task_id,
                    "Task header unavailable",
                    &subtask.reply,
                    &self.node_name,
                );
                let _ = self.monitor.send(MonitorEvent::ComputationTimeSpent {
                    success: false,
                    value: 0,
                });
                self.set_counting(None);
                return;
            }
        };

        if let Some(message) = report.error.as_deref().filter(|m| !m.is_empty()) {
            if message.contains(TIMED_OUT_MSG) {
                self.stats.tasks_with_timeout += 1;
            } else {
                self.stats.tasks_with_errors += 1;
            }
            self.task_server.send_task_failed(
                &subtask.subtask_id,
                &subtask.task_id,
                message,
                &subtask.reply,
                &self.node_name,
            );
            let _ = self.monitor.send(MonitorEvent::ComputationTimeSpent {
                success: false,
                value: work_time_to_be_paid,
            });
        } else if let Some(result) = report.result.filter(well_formed_result) {
            info!(
                "Subtask {} computed, wall clock time {:.3}s",
                subtask.subtask_id,
                report.wall_clock.as_secs_f64()
            );
            self.stats.computed_tasks += 1;
            self.task_server.send_results(
                &subtask.subtask_id,
                &subtask.task_id,
                result,
                work_time_to_be_paid,
                &subtask.reply,
                &self.node_name,
            );
            let _ = self.monitor.send(MonitorEvent::ComputationTimeSpent {
                success: true,
                value: work_time_to_be_paid,
            });
        } else {
            self.stats.tasks_with_errors += 1;
            self.task_server.send_task_failed(
                &subtask.subtask_id,
                &subtask.task_id,
                "Wrong result format",
                &subtask.reply,
                &self.node_name,
            );
            let _ = self.monitor.send(MonitorEvent::ComputationTimeSpent {
                success: false,
                value: work_time_to_be_paid,
            });
        }

        self.set_counting(None);
    }

    /// Tick entry point, invoked periodically by the node main loop. While
    /// computing it supervises worker deadlines; while idle it issues task
    /// requests; while waiting it advances the TTL.
    pub fn run(&mut self) {
        if self.counting_task().is_some() {
            for worker in &mut self.current_computations {
                worker.check_timeout();
            }
        } else if self.compute_tasks && self.runnable && self.waiting_for_task.is_none() {
            if self.last_task_request.elapsed().as_secs_f64() > self.task_request_frequency as f64
                && self.current_computations.is_empty()
            {
                self.request_task();
            }
        } else if self.waiting_for_task.is_some() && self.use_waiting_ttl {
            let now = Instant::now();
            self.waiting_ttl -= (now - self.last_checking).as_secs_f64();
            self.last_checking = now;
            if self.waiting_ttl < 0.0 {
                self.reset(None);
            }
        }
    }

    /// Progress snapshots of all live computations, keyed by subtask id.
    pub fn get_progresses(&self) -> HashMap<String, SubtaskProgress> {
        self.current_computations
            .iter()
            .map(|w| (w.subtask_id().to_string(), w.progress_snapshot()))
            .collect()
    }

    /// Applies a new compute configuration: rebuilds the directory and
    /// resource managers, copies the timing options and the accept switch,
    /// and reconfigures the container manager.
    pub fn change_config(
        &mut self,
        config: &ComputeConfig,
        in_background: bool,
        run_benchmarks: bool,
    ) -> Result<()> {
        let dir_manager = DirManager::new(self.root_dir.clone())?;
        self.resource_manager = ResourcesManager::new(dir_manager.clone());
        self.dir_manager = dir_manager;
        self.task_request_frequency = config.task_request_interval;
        self.waiting_for_task_timeout = config.waiting_for_task_timeout;
        self.waiting_for_task_session_timeout = config.waiting_for_task_session_timeout;
        self.compute_tasks = config.accept_tasks;
        self.support_direct_computation = config.support_direct_computation;
        self.max_assigned_tasks = config.max_assigned_tasks;
        self.use_container_manager = config.use_container_manager;
        self.change_docker_config(config, run_benchmarks, in_background);
        self.config_changed();
        Ok(())
    }

    /// Reconfigures the container manager. With a container VM present and
    /// container-manager control enabled, the node quiesces first: listeners
    /// learn the config is locked, `runnable` is cleared, and the manager
    /// waits on the status probe before applying. The done callback returns
    /// through the control channel.
    pub fn change_docker_config(
        &mut self,
        config: &ComputeConfig,
        run_benchmarks: bool,
        in_background: bool,
    ) {
        self.containers.build_config(config);

        if !self.containers.has_machine() {
            if run_benchmarks {
                self.benchmarks.run_all_benchmarks();
            }
            return;
        }

        if self.use_container_manager {
            self.lock_config(true);
            self.runnable = false;

            let events = self.events_tx.clone();
            let done: DoneCallback = Box::new(move || {
                if events
                    .try_send(ComputerEvent::ConfigApplied { run_benchmarks })
                    .is_err()
                {
                    warn!("Control channel closed before reconfiguration completed");
                }
            });
            self.containers
                .update_config(self.counting.subscribe(), done, in_background);
        }
    }

    fn config_applied(&mut self, run_benchmarks: bool) {
        if run_benchmarks {
            self.benchmarks.run_all_benchmarks();
        }
        debug!("Resuming task computation");
        self.lock_config(false);
        self.runnable = true;
    }

    pub fn register_listener(&mut self, listener: Arc<dyn ComputerListener>) {
        self.listeners.push(listener);
    }

    /// Broadcasts a configuration lock transition to all listeners.
    pub fn lock_config(&self, on: bool) {
        for listener in &self.listeners {
            listener.lock_config(on);
        }
    }

    /// Broadcasts that the configuration changed.
    pub fn config_changed(&self) {
        for listener in &self.listeners {
            listener.config_changed();
        }
    }

    pub fn session_timeout(&mut self) {
        self.session_closed();
    }

    /// The network session ended; return to idle unless a computation is
    /// active.
    pub fn session_closed(&mut self) {
        if self.counting_task().is_none() {
            self.reset(None);
        }
    }

    /// Arms the wait TTL. A `None` ttl means the session timeout.
    pub fn wait(&mut self, enabled: bool, ttl: Option<f64>) {
        self.use_waiting_ttl = enabled;
        self.waiting_ttl = ttl.unwrap_or(self.waiting_for_task_session_timeout as f64);
    }

    /// Clears all wait state. Callers ensure no computation is dropped: a
    /// currently counting task is only ever replaced by the compute path
    /// itself.
    pub fn reset(&mut self, computing_task: Option<String>) {
        self.set_counting(computing_task);
        self.use_waiting_ttl = false;
        self.waiting_for_task = None;
        self.waiting_ttl = 0.0;
    }

    /// Asks every live worker to terminate promptly.
    pub fn quit(&mut self) {
        for worker in &mut self.current_computations {
            worker.end_comp("Computation aborted on shutdown");
        }
    }

    fn request_task(&mut self) {
        if self.waiting_for_task.is_some() || self.counting_task().is_some() {
            return;
        }
        let now = Instant::now();
        self.wait(true, None);
        self.last_checking = now;
        self.last_task_request = now;
        self.waiting_for_task = self.task_server.request_task();
        if self.waiting_for_task.is_some() {
            self.stats.tasks_requested += 1;
        }
    }

    fn request_resource(&mut self, task_id: &str, reply: &ReplyEnvelope) {
        self.last_checking = Instant::now();
        self.wait(true, Some(self.waiting_for_task_timeout as f64));
        let header = self.resource_manager.get_resource_header(task_id);
        self.waiting_for_task = self.task_server.request_resource(task_id, &header, reply);
    }

    fn compute_task(&mut self, descriptor: SubtaskDescriptor) {
        let subtask_id = descriptor.subtask_id.clone();
        let task_id = descriptor.task_id.clone();

        // The task keeper's deadline caps the subtask's own.
        let deadline = match self.task_server.task_header(&task_id) {
            Some(header) => header.deadline.min(descriptor.deadline),
            None => descriptor.deadline,
        };
        let timeout = deadline_to_timeout(deadline);

        self.reset(Some(task_id.clone()));

        if !self.runnable {
            error!(
                "Refusing to start subtask {}: configuration is locked",
                subtask_id
            );
            self.fail_subtask(&subtask_id, "Node is being reconfigured");
            self.set_counting(None);
            return;
        }

        let resource_dir = self.resource_manager.get_resource_dir(&task_id);
        let temp_dir = self.resource_manager.unique_temporary_dir(&task_id);
        let (resource_dir, temp_dir) = match (resource_dir, temp_dir) {
            (Ok(resource_dir), Ok(temp_dir)) => (resource_dir, temp_dir),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to prepare directories for task {}: {}", task_id, e);
                self.fail_subtask(&subtask_id, "Failed to prepare working directories");
                self.set_counting(None);
                return;
            }
        };

        let (kind, vm): (WorkerKind, Arc<dyn PayloadVm>) = if !descriptor.docker_images.is_empty()
        {
            (
                WorkerKind::Container(descriptor.docker_images.clone()),
                self.containers.payload_runtime(),
            )
        } else if self.support_direct_computation {
            (WorkerKind::Direct, self.direct_vm.clone())
        } else {
            error!("Cannot run a direct computation on this node");
            self.fail_subtask(&subtask_id, "Host direct task not supported");
            self.set_counting(None);
            return;
        };

        let spec = WorkerSpec {
            subtask_id: descriptor.subtask_id,
            working_directory: descriptor.working_directory,
            src_code: descriptor.src_code,
            extra_data: descriptor.extra_data,
            short_description: descriptor.short_description,
            resource_dir,
            temp_dir,
            timeout,
            kind,
        };
        let worker = Worker::spawn(spec, vm, self.events_tx.clone());
        self.current_computations.push(worker);
    }

    /// Removes a subtask and reports the failure; the terminal outcome for
    /// subtasks that never reach a worker.
    fn fail_subtask(&mut self, subtask_id: &str, reason: &str) {
        let Some(subtask) = self.registry.pop_by_subtask(subtask_id) else {
            return;
        };
        self.task_server.send_task_failed(
            &subtask.subtask_id,
            &subtask.task_id,
            reason,
            &subtask.reply,
            &self.node_name,
        );
    }
}

/// A well-formed result is a mapping carrying at least `data` and
/// `result_type`.
fn well_formed_result(result: &Value) -> bool {
    result
        .as_object()
        .map(|m| m.contains_key("data") && m.contains_key("result_type"))
        .unwrap_or(false)
}
