//! Worker threads
//!
//! A worker encapsulates one background execution of a subtask payload. The
//! payload itself runs on a blocking thread through a [`PayloadVm`]; the
//! async wrapper races it against the subtask deadline and the terminate
//! request, then posts exactly one report on the control event channel.
//!
//! The variant is fixed at construction from the descriptor: payloads naming
//! container images run in the containerized VM, payloads without images run
//! in the direct interpreter (or its deterministic test twin).

use crate::computer::ComputerEvent;
use crate::vm::{PayloadJob, PayloadVm, WorkerControl};
use serde::Serialize;
use serde_json::Value;
use shared::task::DockerImage;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Message every worker ends with; classified by a substring match in the
/// outcome dispatcher, so the prefix must not change.
pub const TIMED_OUT_MSG: &str = "Task timed out";

/// How a payload is executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerKind {
    /// Run inside the first usable of the given images
    Container(Vec<DockerImage>),
    /// Run in the in-process sandboxed interpreter
    Direct,
    /// Run in the deterministic testing interpreter
    #[allow(dead_code)]
    DirectTest,
}

/// Construction parameters of one execution.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub subtask_id: String,
    /// Relative to `resource_dir`
    pub working_directory: PathBuf,
    pub src_code: String,
    pub extra_data: Value,
    pub short_description: String,
    pub resource_dir: PathBuf,
    pub temp_dir: PathBuf,
    /// Wall-clock budget derived from the subtask deadline
    pub timeout: Duration,
    pub kind: WorkerKind,
}

/// Terminal report of one execution, posted to the control channel.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub subtask_id: String,
    /// Present iff the payload returned without error
    pub result: Option<Value>,
    /// Present iff the execution failed, timed out or was interrupted
    pub error: Option<String>,
    /// Actual execution duration, for logging only; payment uses the
    /// task header ceiling
    pub wall_clock: Duration,
}

/// Read-only progress snapshot of a live computation.
#[derive(Debug, Clone, Serialize)]
pub struct SubtaskProgress {
    pub subtask_id: String,
    pub short_description: String,
    /// In [0, 1]
    pub progress: f64,
}

/// Control-side handle of a spawned execution.
#[derive(Debug)]
pub struct Worker {
    subtask_id: String,
    short_description: String,
    pub(crate) started_at: Instant,
    pub(crate) timeout: Duration,
    control: WorkerControl,
    progress_rx: watch::Receiver<f64>,
    terminate_tx: Option<oneshot::Sender<String>>,
}

impl Worker {
    /// Spawns the execution. The report lands on `events` exactly once, no
    /// matter which of completion, deadline or terminate request wins.
    pub fn spawn(
        spec: WorkerSpec,
        vm: Arc<dyn PayloadVm>,
        events: mpsc::Sender<ComputerEvent>,
    ) -> Self {
        let (control, progress_rx) = WorkerControl::new();
        let (terminate_tx, terminate_rx) = oneshot::channel::<String>();

        let images = match &spec.kind {
            WorkerKind::Container(images) => images.clone(),
            WorkerKind::Direct | WorkerKind::DirectTest => Vec::new(),
        };
        let job = PayloadJob {
            subtask_id: spec.subtask_id.clone(),
            working_directory: spec.working_directory.clone(),
            src_code: spec.src_code.clone(),
            extra_data: spec.extra_data.clone(),
            docker_images: images,
            resource_dir: spec.resource_dir.clone(),
            temp_dir: spec.temp_dir.clone(),
        };

        let subtask_id = spec.subtask_id.clone();
        let timeout = spec.timeout;
        let vm_control = control.clone();

        debug!(
            subtask_id = %subtask_id,
            vm = vm.name(),
            timeout_secs = timeout.as_secs(),
            "Starting worker"
        );

        tokio::spawn(async move {
            let started = std::time::Instant::now();
            let payload_control = vm_control.clone();
            let mut execution =
                tokio::task::spawn_blocking(move || vm.run(&job, &payload_control));

            let outcome: Result<Value, String> = tokio::select! {
                joined = &mut execution => match joined {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(e) => Err(format!("Payload execution panicked: {}", e)),
                },
                _ = tokio::time::sleep(timeout) => {
                    vm_control.request_stop();
                    Err(format!("{} after {}s", TIMED_OUT_MSG, timeout.as_secs()))
                }
                reason = terminate_rx => {
                    vm_control.request_stop();
                    Err(reason.unwrap_or_else(|_| "Computation aborted".to_string()))
                }
            };

            let report = match outcome {
                Ok(value) => WorkerReport {
                    subtask_id: subtask_id.clone(),
                    result: Some(value),
                    error: None,
                    wall_clock: started.elapsed(),
                },
                Err(message) => WorkerReport {
                    subtask_id: subtask_id.clone(),
                    result: None,
                    error: Some(message),
                    wall_clock: started.elapsed(),
                },
            };

            if events.send(ComputerEvent::Computed(report)).await.is_err() {
                warn!(
                    "Dropping report of subtask {}: control channel closed",
                    subtask_id
                );
            }
        });

        Self {
            subtask_id: spec.subtask_id,
            short_description: spec.short_description,
            started_at: Instant::now(),
            timeout,
            control,
            progress_rx,
            terminate_tx: Some(terminate_tx),
        }
    }

    pub fn subtask_id(&self) -> &str {
        &self.subtask_id
    }

    pub fn get_progress(&self) -> f64 {
        *self.progress_rx.borrow()
    }

    pub fn progress_snapshot(&self) -> SubtaskProgress {
        SubtaskProgress {
            subtask_id: self.subtask_id.clone(),
            short_description: self.short_description.clone(),
            progress: self.get_progress(),
        }
    }

    /// Deadline supervision, called once per tick while computing. A worker
    /// past its budget is asked to terminate with the timeout message.
    pub fn check_timeout(&mut self) {
        if self.started_at.elapsed() > self.timeout {
            let message = format!("{} after {}s", TIMED_OUT_MSG, self.timeout.as_secs());
            self.end_comp(message);
        }
    }

    /// Asks the execution to terminate promptly with the given reason.
    /// Idempotent; only the first request reaches the worker.
    pub fn end_comp(&mut self, reason: impl Into<String>) {
        self.control.request_stop();
        if let Some(tx) = self.terminate_tx.take() {
            let _ = tx.send(reason.into());
        }
    }
}
