//! Named tracker for background tasks.
//!
//! Every long-running task registers under a unique name when it starts and
//! deregisters on its single exit path. Shutdown waits on the tracker until the
//! count drains to zero; tests read the remaining names to identify leaks.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackerError {
    #[error("task name must not be empty")]
    EmptyName,
    #[error("task {0} is already tracked")]
    AlreadyTracked(String),
}

/// Concurrency-safe counter of outstanding tasks, keyed by task name.
#[derive(Debug)]
pub struct LifecycleTracker {
    label: String,
    names: Mutex<BTreeSet<String>>,
    count: watch::Sender<usize>,
}

impl LifecycleTracker {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        let (count, _) = watch::channel(0);
        Arc::new(Self {
            label: label.into(),
            names: Mutex::new(BTreeSet::new()),
            count,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Register a task. Adding a name that is already tracked is a no-op.
    pub fn add(&self, name: &str) -> Result<(), TrackerError> {
        self.insert(name).map(|_| ())
    }

    /// Deregister a task.
    ///
    /// Reporting a name that was never added is a programmer error: it panics
    /// in debug builds and is logged in release builds.
    pub fn done(&self, name: &str) {
        let mut names = self.lock_names();
        if names.remove(name) {
            self.count.send_replace(names.len());
            tracing::trace!(
                tracker = %self.label,
                task = %name,
                remaining = names.len(),
                "Task done"
            );
            return;
        }
        drop(names);

        if cfg!(debug_assertions) {
            panic!("tracker {}: done({name}) without a matching add", self.label);
        }
        tracing::error!(
            tracker = %self.label,
            task = %name,
            "Task reported done without a matching add"
        );
    }

    /// Register a task and return a guard that reports `done` when dropped.
    ///
    /// Unlike [`add`](Self::add), a name that is already tracked is rejected so
    /// that two guards can never share one registration.
    pub fn track(self: &Arc<Self>, name: impl Into<String>) -> Result<TaskGuard, TrackerError> {
        let name = name.into();
        if !self.insert(&name)? {
            return Err(TrackerError::AlreadyTracked(name));
        }
        Ok(TaskGuard {
            tracker: Arc::clone(self),
            name,
        })
    }

    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Names of the tasks still outstanding, in sorted order.
    pub fn tracked_names(&self) -> Vec<String> {
        self.lock_names().iter().cloned().collect()
    }

    /// Block until every tracked task has reported done.
    pub async fn wait(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives as long as `self`, so this only returns once the count hits zero.
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    fn insert(&self, name: &str) -> Result<bool, TrackerError> {
        if name.is_empty() {
            return Err(TrackerError::EmptyName);
        }
        let mut names = self.lock_names();
        let inserted = names.insert(name.to_string());
        if inserted {
            self.count.send_replace(names.len());
            tracing::trace!(
                tracker = %self.label,
                task = %name,
                outstanding = names.len(),
                "Task added"
            );
        }
        Ok(inserted)
    }

    fn lock_names(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.names
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Registration held by a running task. Dropping it reports the task done.
#[derive(Debug)]
pub struct TaskGuard {
    tracker: Arc<LifecycleTracker>,
    name: String,
}

impl TaskGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.tracker.done(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_add_is_idempotent_per_name() {
        let tracker = LifecycleTracker::new("test");
        tracker.add("reader").unwrap();
        tracker.add("reader").unwrap();
        tracker.add("writer").unwrap();
        assert_eq!(tracker.count(), 2);

        tracker.done("reader");
        assert_eq!(tracker.count(), 1);
        assert_eq!(tracker.tracked_names(), vec!["writer".to_string()]);
    }

    #[test]
    fn test_empty_name_rejected() {
        let tracker = LifecycleTracker::new("test");
        assert_eq!(tracker.add(""), Err(TrackerError::EmptyName));
        assert_eq!(tracker.count(), 0);
    }

    #[test]
    fn test_guard_reports_done_on_drop() {
        let tracker = LifecycleTracker::new("test");
        let guard = tracker.track("broadcast").unwrap();
        assert_eq!(guard.name(), "broadcast");
        assert_eq!(tracker.count(), 1);

        drop(guard);
        assert_eq!(tracker.count(), 0);
        assert!(tracker.tracked_names().is_empty());
    }

    #[test]
    fn test_track_rejects_duplicate_name() {
        let tracker = LifecycleTracker::new("test");
        let _guard = tracker.track("sweeper").unwrap();
        assert_eq!(
            tracker.track("sweeper").unwrap_err(),
            TrackerError::AlreadyTracked("sweeper".to_string())
        );
        assert_eq!(tracker.count(), 1);
    }

    #[test]
    #[should_panic(expected = "without a matching add")]
    fn test_done_without_add_panics_in_debug() {
        let tracker = LifecycleTracker::new("test");
        tracker.done("never-added");
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_empty() {
        let tracker = LifecycleTracker::new("test");
        tokio::time::timeout(Duration::from_millis(100), tracker.wait())
            .await
            .expect("wait on an empty tracker should not block");
    }

    #[tokio::test]
    async fn test_wait_blocks_until_all_tasks_done() {
        let tracker = LifecycleTracker::new("test");
        let first = tracker.track("first").unwrap();
        let second = tracker.track("second").unwrap();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(first);
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(second);
        });

        assert!(
            tokio::time::timeout(Duration::from_millis(5), tracker.wait())
                .await
                .is_err(),
            "wait should block while tasks are outstanding"
        );

        tokio::time::timeout(Duration::from_secs(2), tracker.wait())
            .await
            .expect("wait should return once both guards drop");
        handle.await.unwrap();
        assert_eq!(tracker.count(), 0);
    }
}
