//! Tests for the assigned-subtask registry

use crate::registry::AssignedSubtasks;
use crate::tests::test_utils::{descriptor, now_epoch};

fn registry_with(entries: &[(&str, &str)]) -> AssignedSubtasks {
    let mut registry = AssignedSubtasks::new();
    for (subtask_id, task_id) in entries {
        assert!(registry.insert(descriptor(
            subtask_id,
            task_id,
            Vec::new(),
            now_epoch() + 60
        )));
    }
    registry
}

#[test]
fn test_insert_rejects_duplicates() {
    let mut registry = registry_with(&[("s1", "t1")]);
    assert!(!registry.insert(descriptor("s1", "t1", Vec::new(), now_epoch() + 60)));
    assert_eq!(registry.len(), 1);
    assert!(registry.is_consistent());
}

#[test]
fn test_both_indexes_agree() {
    let registry = registry_with(&[("s1", "t1"), ("s2", "t2")]);
    assert!(registry.contains_subtask("s1"));
    assert!(registry.contains_task("t1"));
    assert_eq!(registry.get_by_task("t2").unwrap().subtask_id, "s2");
    assert!(registry.is_consistent());
}

#[test]
fn test_pop_by_subtask_removes_both_entries() {
    let mut registry = registry_with(&[("s1", "t1")]);
    let popped = registry.pop_by_subtask("s1").unwrap();
    assert_eq!(popped.task_id, "t1");
    assert!(!registry.contains_task("t1"));
    assert!(registry.is_empty());
    assert!(registry.is_consistent());
}

#[test]
fn test_pop_by_task_removes_both_entries() {
    let mut registry = registry_with(&[("s1", "t1")]);
    let popped = registry.pop_by_task("t1").unwrap();
    assert_eq!(popped.subtask_id, "s1");
    assert!(!registry.contains_subtask("s1"));
    assert!(registry.is_empty());
    assert!(registry.is_consistent());
}

#[test]
fn test_pop_unknown_returns_none() {
    let mut registry = registry_with(&[("s1", "t1")]);
    assert!(registry.pop_by_subtask("nope").is_none());
    assert!(registry.pop_by_task("nope").is_none());
    assert_eq!(registry.len(), 1);
}
