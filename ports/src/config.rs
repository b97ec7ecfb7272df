//! Dispatcher tunables.
//!
//! Mirrors the handful of knobs `libports` exposed as global variables
//! (`ports_timeout`, the multithreaded loop's per-worker idle timeout and
//! its priority-depression amount) as one configuration value instead, so
//! a process hosting more than one [`crate::runtime::Runtime`]/bucket pair
//! can tune each independently.
use std::time::Duration;

/// Dispatcher configuration for one bucket's [`crate::dispatch`] loop.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// How long an idle worker waits for a message before considering
    /// exiting. The single-threaded loop always overrides this to "wait
    /// forever" regardless of what's configured here, matching the
    /// original's deliberate zero-timeout special case.
    pub thread_timeout: Duration,
    /// How long the multithreaded loop as a whole waits with zero workers
    /// busy before `manage_multithread` returns.
    pub global_timeout: Option<Duration>,
    /// Upper bound on concurrently running workers for one bucket.
    pub max_threads: usize,
    /// Priority lowered by for newly spawned workers, best-effort. A
    /// platform that can't depress thread priority just logs and carries
    /// on; it is never a fatal condition.
    pub worker_priority_depression: i32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig {
            thread_timeout: Duration::from_secs(60),
            global_timeout: None,
            max_threads: 32,
            worker_priority_depression: 2,
        }
    }
}
