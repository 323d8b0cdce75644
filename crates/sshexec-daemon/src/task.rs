//! Task identifiers for log correlation.
//!
//! Every subprocess that actually starts gets one identifier. The registry is
//! an ordinary value shared by `Arc`, so tests and embedders can run isolated
//! counters side by side.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of one spawned subprocess, unique for the registry's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic task counter.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    last: AtomicU64,
}

impl TaskRegistry {
    /// Create a registry whose first identifier is 1.
    pub const fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    /// Issue the next identifier. Identifiers strictly increase and are never
    /// reused, including across threads.
    pub fn next_task_id(&self) -> TaskId {
        TaskId(self.last.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// The most recently issued identifier, if any.
    pub fn last_issued(&self) -> Option<TaskId> {
        match self.last.load(Ordering::Acquire) {
            0 => None,
            n => Some(TaskId(n)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn ids_start_at_one_and_increase() {
        let registry = TaskRegistry::new();
        assert_eq!(registry.last_issued(), None);

        let first = registry.next_task_id();
        let second = registry.next_task_id();
        assert_eq!(first.get(), 1);
        assert!(second > first);
        assert_eq!(registry.last_issued(), Some(second));
    }

    #[test]
    fn concurrent_ids_never_repeat() {
        let registry = Arc::new(TaskRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let ids: Vec<TaskId> = (0..1000).map(|_| registry.next_task_id()).collect();
                    // Each thread observes its own ids in strictly increasing order.
                    assert!(ids.windows(2).all(|w| w[0] < w[1]));
                    ids
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate task id {id}");
            }
        }
        assert_eq!(seen.len(), 8000);
        assert_eq!(registry.last_issued().unwrap().get(), 8000);
    }

    #[test]
    fn display_is_plain_number() {
        let registry = TaskRegistry::new();
        assert_eq!(registry.next_task_id().to_string(), "1");
    }
}
