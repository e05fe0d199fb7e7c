//! Assigned-subtask registry
//!
//! Two indexed mappings over the subtasks whose offer has been accepted: by
//! subtask id and by task id. The maps are kept in lockstep; every insert and
//! pop touches both, so a subtask id is present in one exactly when its task
//! id is present in the other.

use shared::task::SubtaskDescriptor;
use std::collections::HashMap;
use tracing::debug;

/// Registry of accepted subtasks awaiting resources or computation.
#[derive(Debug, Default)]
pub struct AssignedSubtasks {
    by_subtask: HashMap<String, SubtaskDescriptor>,
    task_to_subtask: HashMap<String, String>,
}

impl AssignedSubtasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a descriptor. Returns false and leaves the registry
    /// untouched if the subtask id is already present.
    pub fn insert(&mut self, descriptor: SubtaskDescriptor) -> bool {
        if self.by_subtask.contains_key(&descriptor.subtask_id) {
            return false;
        }
        debug!(
            subtask_id = %descriptor.subtask_id,
            task_id = %descriptor.task_id,
            "Subtask assigned"
        );
        self.task_to_subtask
            .insert(descriptor.task_id.clone(), descriptor.subtask_id.clone());
        self.by_subtask
            .insert(descriptor.subtask_id.clone(), descriptor);
        true
    }

    pub fn contains_subtask(&self, subtask_id: &str) -> bool {
        self.by_subtask.contains_key(subtask_id)
    }

    pub fn contains_task(&self, task_id: &str) -> bool {
        self.task_to_subtask.contains_key(task_id)
    }

    /// Looks up the descriptor assigned for a task id.
    pub fn get_by_task(&self, task_id: &str) -> Option<&SubtaskDescriptor> {
        let subtask_id = self.task_to_subtask.get(task_id)?;
        self.by_subtask.get(subtask_id)
    }

    /// Removes by subtask id, dropping the task index entry as well.
    pub fn pop_by_subtask(&mut self, subtask_id: &str) -> Option<SubtaskDescriptor> {
        let descriptor = self.by_subtask.remove(subtask_id)?;
        self.task_to_subtask.remove(&descriptor.task_id);
        Some(descriptor)
    }

    /// Removes by task id, dropping both index entries.
    pub fn pop_by_task(&mut self, task_id: &str) -> Option<SubtaskDescriptor> {
        let subtask_id = self.task_to_subtask.remove(task_id)?;
        self.by_subtask.remove(&subtask_id)
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.by_subtask.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.by_subtask.is_empty()
    }

    /// True when both maps agree on membership. Checked by tests after every
    /// event sequence.
    #[allow(dead_code)]
    pub fn is_consistent(&self) -> bool {
        self.by_subtask.len() == self.task_to_subtask.len()
            && self.task_to_subtask.iter().all(|(task_id, subtask_id)| {
                self.by_subtask
                    .get(subtask_id)
                    .map(|d| d.task_id == *task_id)
                    .unwrap_or(false)
            })
    }
}
