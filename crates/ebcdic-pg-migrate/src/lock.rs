//! In-process task-exclusion lock.
//!
//! Prevents two workers on the same node from dispatching the same task
//! concurrently. This is an optimization, not a distributed lock: cross-node
//! exclusivity comes from the conditional status update in the store.

use std::collections::HashSet;
use std::sync::Mutex;

/// Kind of task being locked; ids are only unique per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    FileTask,
    Split,
}

/// Process-local mutual-exclusion set over task ids.
#[derive(Debug, Default)]
pub struct TaskLock {
    held: Mutex<HashSet<(LockKind, i64)>>,
}

impl TaskLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically mark a task in use. Returns false if already held.
    pub fn try_acquire(&self, kind: LockKind, id: i64) -> bool {
        self.held
            .lock()
            .expect("task lock poisoned")
            .insert((kind, id))
    }

    /// Remove the mark. Idempotent; no ownership token required.
    pub fn release(&self, kind: LockKind, id: i64) {
        self.held
            .lock()
            .expect("task lock poisoned")
            .remove(&(kind, id));
    }

    /// Number of currently held locks (for logging).
    pub fn held_count(&self) -> usize {
        self.held.lock().expect("task lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_then_contend() {
        let lock = TaskLock::new();
        assert!(lock.try_acquire(LockKind::FileTask, 1));
        assert!(!lock.try_acquire(LockKind::FileTask, 1));
        lock.release(LockKind::FileTask, 1);
        assert!(lock.try_acquire(LockKind::FileTask, 1));
    }

    #[test]
    fn test_kinds_do_not_collide() {
        let lock = TaskLock::new();
        assert!(lock.try_acquire(LockKind::FileTask, 7));
        assert!(lock.try_acquire(LockKind::Split, 7));
        assert_eq!(lock.held_count(), 2);
    }

    #[test]
    fn test_release_is_idempotent() {
        let lock = TaskLock::new();
        assert!(lock.try_acquire(LockKind::Split, 3));
        lock.release(LockKind::Split, 3);
        lock.release(LockKind::Split, 3);
        assert!(lock.try_acquire(LockKind::Split, 3));
    }

    #[test]
    fn test_concurrent_acquire_single_winner() {
        use std::sync::Arc;
        let lock = Arc::new(TaskLock::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            handles.push(std::thread::spawn(move || {
                lock.try_acquire(LockKind::Split, 42)
            }));
        }
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
