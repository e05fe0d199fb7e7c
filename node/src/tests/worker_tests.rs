//! Tests for worker spawn, supervision and termination

use crate::computer::ComputerEvent;
use crate::vm::TestVm;
use crate::worker::{Worker, WorkerKind, WorkerReport, WorkerSpec};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn spec(src_code: &str, timeout: Duration) -> WorkerSpec {
    WorkerSpec {
        subtask_id: "s1".to_string(),
        working_directory: PathBuf::from("work"),
        src_code: src_code.to_string(),
        extra_data: serde_json::Value::Null,
        short_description: "worker under test".to_string(),
        resource_dir: std::env::temp_dir(),
        temp_dir: std::env::temp_dir(),
        timeout,
        kind: WorkerKind::DirectTest,
    }
}

async fn recv_report(events: &mut mpsc::Receiver<ComputerEvent>) -> WorkerReport {
    match events.recv().await.expect("worker dropped its report") {
        ComputerEvent::Computed(report) => report,
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_successful_payload_reports_result() {
    let (tx, mut events) = mpsc::channel(8);
    let _worker = Worker::spawn(
        spec(
            r#"{"result": {"data": "r", "result_type": "bin"}}"#,
            Duration::from_secs(60),
        ),
        Arc::new(TestVm),
        tx,
    );

    let report = recv_report(&mut events).await;
    assert_eq!(report.subtask_id, "s1");
    assert!(report.error.is_none());
    assert_eq!(
        report.result,
        Some(serde_json::json!({"data": "r", "result_type": "bin"}))
    );
}

#[tokio::test]
async fn test_failing_payload_reports_error() {
    let (tx, mut events) = mpsc::channel(8);
    let _worker = Worker::spawn(
        spec(r#"{"error": "boom"}"#, Duration::from_secs(60)),
        Arc::new(TestVm),
        tx,
    );

    let report = recv_report(&mut events).await;
    assert!(report.result.is_none());
    assert_eq!(report.error.as_deref(), Some("boom"));
}

#[tokio::test]
async fn test_deadline_fires_before_slow_payload() {
    let (tx, mut events) = mpsc::channel(8);
    let _worker = Worker::spawn(
        spec(
            r#"{"sleep_ms": 5000, "result": {"data": "r", "result_type": "bin"}}"#,
            Duration::ZERO,
        ),
        Arc::new(TestVm),
        tx,
    );

    let report = recv_report(&mut events).await;
    let error = report.error.expect("expected a timeout error");
    assert!(error.contains("Task timed out"), "error: {}", error);
}

#[tokio::test]
async fn test_check_timeout_terminates_overdue_worker() {
    let (tx, mut events) = mpsc::channel(8);
    let mut worker = Worker::spawn(
        spec(
            r#"{"sleep_ms": 5000, "result": {"data": "r", "result_type": "bin"}}"#,
            Duration::from_secs(3600),
        ),
        Arc::new(TestVm),
        tx,
    );

    // Shrink the budget so the supervision pass sees the worker as overdue.
    worker.timeout = Duration::ZERO;
    worker.check_timeout();

    let report = recv_report(&mut events).await;
    let error = report.error.expect("expected a timeout error");
    assert!(error.contains("Task timed out"), "error: {}", error);
}

#[tokio::test]
async fn test_end_comp_carries_reason() {
    let (tx, mut events) = mpsc::channel(8);
    let mut worker = Worker::spawn(
        spec(
            r#"{"sleep_ms": 5000, "result": {"data": "r", "result_type": "bin"}}"#,
            Duration::from_secs(3600),
        ),
        Arc::new(TestVm),
        tx,
    );

    worker.end_comp("operator stop");
    let report = recv_report(&mut events).await;
    assert_eq!(report.error.as_deref(), Some("operator stop"));

    // A second request is a no-op.
    worker.end_comp("again");
}

#[tokio::test]
async fn test_progress_snapshot_reflects_payload() {
    let (tx, mut events) = mpsc::channel(8);
    let worker = Worker::spawn(
        spec(
            r#"{"result": {"data": "r", "result_type": "bin"}}"#,
            Duration::from_secs(60),
        ),
        Arc::new(TestVm),
        tx,
    );

    let snapshot = worker.progress_snapshot();
    assert_eq!(snapshot.subtask_id, "s1");
    assert_eq!(snapshot.short_description, "worker under test");
    assert!((0.0..=1.0).contains(&snapshot.progress));

    let report = recv_report(&mut events).await;
    assert!(report.error.is_none());
    assert_eq!(worker.get_progress(), 1.0);
}
