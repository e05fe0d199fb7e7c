//! Container manager interface
//!
//! Orchestration of container images and the container VM lives outside this
//! crate; the Task Computer only needs the reconfiguration contract: build a
//! config from the compute options, and when a VM is present, apply it once
//! the node is quiescent. Quiescence is observed through a status probe
//! mirroring the currently counting task; the done callback fires after the
//! new configuration is live.

use crate::vm::{PayloadJob, PayloadVm, WorkerControl};
use anyhow::Result;
use serde_json::Value;
use shared::config::ComputeConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Read side of the quiescence probe: the task id currently under
/// computation, or `None` when the node is idle.
pub type StatusProbe = watch::Receiver<Option<String>>;

/// Invoked exactly once when the new configuration is live.
pub type DoneCallback = Box<dyn FnOnce() + Send + 'static>;

/// The container orchestration consumed by the Task Computer.
pub trait ContainerManager: Send + Sync {
    /// Probes the host environment; called once at startup when the
    /// operator opted into container-manager control.
    fn check_environment(&self) -> Result<()>;

    /// True iff a container VM is present on this host.
    fn has_machine(&self) -> bool;

    /// Derives the manager's own configuration from the compute options.
    fn build_config(&self, config: &ComputeConfig);

    /// Applies the built configuration. Implementations wait for the status
    /// probe to report quiescence before touching the VM, then invoke
    /// `done`. Runs in the background in either mode; `in_background` only
    /// signals whether the caller is in startup or mid-flight.
    fn update_config(&self, status: StatusProbe, done: DoneCallback, in_background: bool);

    /// Execution engine for payloads that name container images.
    fn payload_runtime(&self) -> Arc<dyn PayloadVm>;
}

/// Waits until the status probe reports no counting task, then fires the
/// done callback. The polling cadence matches a tick-loop supervisor: fast
/// enough to resume promptly, slow enough to stay off the hot path.
pub fn reconfigure_when_idle(mut status: StatusProbe, done: DoneCallback) {
    tokio::spawn(async move {
        loop {
            let counting = status.borrow_and_update().clone();
            match counting {
                None => break,
                Some(task_id) => {
                    debug!("Reconfiguration waiting for task {} to finish", task_id);
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        done();
    });
}

/// Container manager for hosts without a container VM.
///
/// `has_machine` is false, so the Task Computer never locks configuration on
/// it; container payloads are refused by its runtime since there is nothing
/// to run them in.
pub struct LocalContainerManager;

impl LocalContainerManager {
    pub fn install() -> Self {
        Self
    }
}

impl ContainerManager for LocalContainerManager {
    fn check_environment(&self) -> Result<()> {
        info!("No container VM present on this host");
        Ok(())
    }

    fn has_machine(&self) -> bool {
        false
    }

    fn build_config(&self, _config: &ComputeConfig) {}

    fn update_config(&self, status: StatusProbe, done: DoneCallback, _in_background: bool) {
        reconfigure_when_idle(status, done);
    }

    fn payload_runtime(&self) -> Arc<dyn PayloadVm> {
        Arc::new(UnavailableContainerVm)
    }
}

struct UnavailableContainerVm;

impl PayloadVm for UnavailableContainerVm {
    fn run(&self, job: &PayloadJob, _ctl: &WorkerControl) -> Result<Value> {
        anyhow::bail!(
            "No container runtime available for images {:?}",
            job.docker_images
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
        )
    }

    fn name(&self) -> &'static str {
        "no-container-vm"
    }
}
