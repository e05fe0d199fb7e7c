//! Payload execution engines
//!
//! A worker thread drives one `PayloadVm` to run a subtask's payload. The
//! trait is synchronous and cooperative: it runs on a blocking thread, checks
//! the stop flag at convenient points, and reports progress through the
//! control handle. Sandboxed production interpreters plug in behind this
//! trait; the crate ships the deterministic test interpreter used by the
//! test-direct worker variant.

use anyhow::{Context, Result};
use serde_json::Value;
use shared::task::DockerImage;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Everything a VM needs to execute one payload.
#[derive(Debug, Clone)]
pub struct PayloadJob {
    pub subtask_id: String,
    /// Relative to `resource_dir`
    pub working_directory: PathBuf,
    pub src_code: String,
    pub extra_data: Value,
    /// Images the payload may run in; empty for direct execution
    pub docker_images: Vec<DockerImage>,
    /// Mounted read-only by containerized VMs
    pub resource_dir: PathBuf,
    /// Mounted read-write; scratch space and declared outputs
    pub temp_dir: PathBuf,
}

/// Cooperative control handle shared between a worker and its VM.
#[derive(Debug, Clone)]
pub struct WorkerControl {
    stop: Arc<AtomicBool>,
    progress: watch::Sender<f64>,
}

impl WorkerControl {
    /// Creates a control handle plus the progress receiver kept by the
    /// worker for `get_progresses` snapshots.
    pub fn new() -> (Self, watch::Receiver<f64>) {
        let (progress, progress_rx) = watch::channel(0.0);
        (
            Self {
                stop: Arc::new(AtomicBool::new(false)),
                progress,
            },
            progress_rx,
        )
    }

    /// True once the worker asked the payload to terminate.
    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Asks the payload to terminate at its next checkpoint.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Publishes payload progress, clamped to [0, 1].
    pub fn set_progress(&self, value: f64) {
        let _ = self.progress.send(value.clamp(0.0, 1.0));
    }
}

/// A payload execution engine.
pub trait PayloadVm: Send + Sync {
    /// Runs one payload to completion. Called on a blocking thread; must
    /// poll `ctl.should_stop()` during long stretches of work and return
    /// promptly once it is set.
    fn run(&self, job: &PayloadJob, ctl: &WorkerControl) -> Result<Value>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// Deterministic interpreter for the test-direct worker variant.
///
/// The payload source is a JSON object driving the execution:
/// `{"sleep_ms": N}` busy-waits cooperatively, `{"error": "..."}` fails with
/// that message, `{"result": {...}}` succeeds with that value. Sleep is
/// honored before the error/result declaration.
pub struct TestVm;

impl PayloadVm for TestVm {
    fn run(&self, job: &PayloadJob, ctl: &WorkerControl) -> Result<Value> {
        let script: Value = serde_json::from_str(&job.src_code)
            .context("Payload source is not a valid test script")?;

        ctl.set_progress(0.0);

        if let Some(sleep_ms) = script.get("sleep_ms").and_then(Value::as_u64) {
            let mut slept = 0u64;
            while slept < sleep_ms {
                if ctl.should_stop() {
                    anyhow::bail!("Computation interrupted");
                }
                let step = (sleep_ms - slept).min(10);
                std::thread::sleep(Duration::from_millis(step));
                slept += step;
                ctl.set_progress(slept as f64 / sleep_ms as f64);
            }
        }

        if let Some(message) = script.get("error").and_then(Value::as_str) {
            anyhow::bail!("{}", message);
        }

        ctl.set_progress(1.0);

        let result = script
            .get("result")
            .cloned()
            .context("Payload declared no result")?;

        // Captured interpreter output lands next to the declared result in
        // the scratch directory, like any other payload run.
        let cwd = job.resource_dir.join(&job.working_directory);
        let log = format!(
            "payload {} ran in {} with extra data {}\n",
            job.subtask_id,
            cwd.display(),
            job.extra_data
        );
        if let Err(e) = fs::write(job.temp_dir.join("stdout.log"), log) {
            debug!("Could not capture payload output: {}", e);
        }

        Ok(result)
    }

    fn name(&self) -> &'static str {
        "test-vm"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(src_code: &str) -> PayloadJob {
        PayloadJob {
            subtask_id: "s1".to_string(),
            working_directory: PathBuf::from("work"),
            src_code: src_code.to_string(),
            extra_data: Value::Null,
            docker_images: Vec::new(),
            resource_dir: PathBuf::from("/tmp/res"),
            temp_dir: PathBuf::from("/tmp/tmp"),
        }
    }

    #[test]
    fn test_result_script() {
        let (ctl, progress) = WorkerControl::new();
        let result = TestVm
            .run(&job(r#"{"result": {"data": "r", "result_type": "bin"}}"#), &ctl)
            .unwrap();
        assert_eq!(result, json!({"data": "r", "result_type": "bin"}));
        assert_eq!(*progress.borrow(), 1.0);
    }

    #[test]
    fn test_error_script() {
        let (ctl, _progress) = WorkerControl::new();
        let err = TestVm.run(&job(r#"{"error": "boom"}"#), &ctl).unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_invalid_script_is_an_error() {
        let (ctl, _progress) = WorkerControl::new();
        assert!(TestVm.run(&job("not json"), &ctl).is_err());
    }

    #[test]
    fn test_missing_result_is_an_error() {
        let (ctl, _progress) = WorkerControl::new();
        assert!(TestVm.run(&job("{}"), &ctl).is_err());
    }

    #[test]
    fn test_stop_interrupts_sleep() {
        let (ctl, _progress) = WorkerControl::new();
        ctl.request_stop();
        let err = TestVm
            .run(&job(r#"{"sleep_ms": 10000, "result": {}}"#), &ctl)
            .unwrap_err();
        assert_eq!(err.to_string(), "Computation interrupted");
    }
}
