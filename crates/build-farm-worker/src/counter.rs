//! Running job counter
//!
//! One counter per pool, shared by handle. Workers hold a [`RunningJobGuard`]
//! for exactly the span of a job's execution, so the count is decremented on
//! every exit path, including panics unwinding through the worker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Number of jobs currently inside execution
#[derive(Debug, Clone, Default)]
pub struct RunningJobs(Arc<AtomicUsize>);

impl RunningJobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current number of executing jobs
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    /// Count a job as running until the returned guard is dropped
    pub fn start(&self) -> RunningJobGuard {
        self.0.fetch_add(1, Ordering::AcqRel);
        RunningJobGuard(Arc::clone(&self.0))
    }
}

/// Decrements the counter when dropped
#[derive(Debug)]
pub struct RunningJobGuard(Arc<AtomicUsize>);

impl Drop for RunningJobGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_tracks_running_jobs() {
        let running = RunningJobs::new();
        assert_eq!(running.get(), 0);

        let first = running.start();
        let second = running.clone().start();
        assert_eq!(running.get(), 2);

        drop(first);
        assert_eq!(running.get(), 1);
        drop(second);
        assert_eq!(running.get(), 0);
    }

    #[test]
    fn test_guard_released_on_panic() {
        let running = RunningJobs::new();
        let handle = running.clone();

        let result = std::panic::catch_unwind(move || {
            let _guard = handle.start();
            panic!("build step exploded");
        });

        assert!(result.is_err());
        assert_eq!(running.get(), 0);
    }
}
