//! Monitor event bus
//!
//! Operational events emitted by the Task Computer for the node's monitoring
//! subsystem. Events are fire-and-forget: the computer never blocks on the
//! monitor, and a closed receiver is tolerated.

use tokio::sync::mpsc;

/// Events published to the monitor.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    /// A computation reached a terminal outcome. `value` is the billable
    /// duration in seconds (the payment ceiling, not wall-clock time).
    ComputationTimeSpent { success: bool, value: u64 },
}

/// Sending half handed to the Task Computer.
pub type MonitorSender = mpsc::UnboundedSender<MonitorEvent>;

/// Receiving half drained by the node main loop.
pub type MonitorReceiver = mpsc::UnboundedReceiver<MonitorEvent>;

/// Creates the monitor channel.
pub fn channel() -> (MonitorSender, MonitorReceiver) {
    mpsc::unbounded_channel()
}
