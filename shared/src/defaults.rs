//! Default values for configuration parameters
//!
//! This module centralizes all default value functions used by the
//! configuration structures. These functions are used by serde when
//! deserializing configuration files that don't specify certain optional
//! fields.

// Task computation defaults

/// Default interval between task requests (5 seconds)
pub fn default_task_request_interval() -> u64 {
    5
}

/// Default wait for an accepted task's resources (30 seconds)
pub fn default_waiting_for_task_timeout() -> u64 {
    30
}

/// Default wait on an outstanding task request session (60 seconds)
pub fn default_waiting_for_task_session_timeout() -> u64 {
    60
}

/// Default accept-tasks switch (accepting)
pub fn default_accept_tasks() -> bool {
    true
}

/// Default number of concurrently assigned subtasks (1)
pub fn default_max_assigned_tasks() -> usize {
    1
}

/// Default container-manager control switch (enabled)
pub fn default_use_container_manager() -> bool {
    true
}

// Node runtime defaults

/// Default tick loop cadence (1000 milliseconds)
pub fn default_tick_interval_ms() -> u64 {
    1000
}

/// Default capacity of the control event channel (1000)
pub fn default_channel_buffer_size() -> usize {
    1000
}

/// Default interval between configuration change checks (10 seconds)
pub fn default_config_check_interval() -> u64 {
    10
}
