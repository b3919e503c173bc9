//! Signal handling and ordered shutdown of worker threads.
//!
//! SIGTERM and SIGINT set a shared shutdown flag through `signal-hook`. Every
//! worker loop polls the same flag, so one signal stops the whole process.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::{debug, warn};

const JOIN_POLL: Duration = Duration::from_millis(50);

/// Shutdown flag shared between the OS signal hooks and every worker.
#[derive(Clone)]
pub struct SignalHandler {
    shutdown_flag: Arc<AtomicBool>,
}

impl SignalHandler {
    /// Create a handler and register SIGTERM/SIGINT.
    ///
    /// Registration is best-effort; failures are logged but not fatal.
    pub fn new() -> Self {
        let handler = Self::unregistered();
        for (signal, name) in [(SIGTERM, "SIGTERM"), (SIGINT, "SIGINT")] {
            if let Err(e) = signal_hook::flag::register(signal, Arc::clone(&handler.shutdown_flag)) {
                warn!(signal = name, error = %e, "failed to register signal");
            }
        }
        handler
    }

    /// A handler that only reacts to [`request_shutdown`](Self::request_shutdown).
    pub fn unregistered() -> Self {
        Self {
            shutdown_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn should_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    pub fn request_shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
    }

    /// The flag itself, for worker threads.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown_flag)
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Joins named worker threads, giving up on stragglers after `timeout`.
pub struct ShutdownCoordinator {
    pub timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }

    /// Join every worker in order. Returns `true` if all of them finished
    /// in time and none panicked.
    pub fn join_all(&self, workers: Vec<(&'static str, JoinHandle<()>)>) -> bool {
        let deadline = Instant::now() + self.timeout;
        let mut all_ok = true;
        for (name, handle) in workers {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(JOIN_POLL);
            }
            if !handle.is_finished() {
                warn!(worker = name, "worker did not stop in time; abandoning");
                all_ok = false;
                continue;
            }
            if handle.join().is_ok() {
                debug!(worker = name, "worker stopped");
            } else {
                warn!(worker = name, "worker panicked");
                all_ok = false;
            }
        }
        all_ok
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn programmatic_shutdown_is_visible_to_clones_and_flag() {
        let handler = SignalHandler::unregistered();
        let clone = handler.clone();
        let flag = handler.flag();
        assert!(!clone.should_shutdown());
        handler.request_shutdown();
        assert!(clone.should_shutdown());
        assert!(flag.load(Ordering::Relaxed));
    }

    #[test]
    fn coordinator_joins_finished_workers() {
        let workers = vec![
            ("a", thread::spawn(|| {})),
            ("b", thread::spawn(|| thread::sleep(Duration::from_millis(20)))),
        ];
        assert!(ShutdownCoordinator::new().join_all(workers));
    }

    #[test]
    fn coordinator_reports_panics_and_stragglers() {
        let stop = Arc::new(AtomicBool::new(false));
        let straggler_stop = Arc::clone(&stop);
        let workers = vec![
            ("panics", thread::spawn(|| panic!("boom"))),
            (
                "straggler",
                thread::spawn(move || {
                    while !straggler_stop.load(Ordering::Relaxed) {
                        thread::sleep(Duration::from_millis(5));
                    }
                }),
            ),
        ];
        let coord = ShutdownCoordinator {
            timeout: Duration::from_millis(100),
        };
        assert!(!coord.join_all(workers));
        stop.store(true, Ordering::Relaxed);
    }
}
