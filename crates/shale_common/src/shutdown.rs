//! Interruptible shutdown signal for background threads.
//!
//! Replaces bare `thread::sleep` loops with condvar-backed waits that
//! respond to stop requests within milliseconds instead of waiting for the
//! full sleep interval to elapse.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A cooperative shutdown signal.
///
/// When `shutdown()` is called, any thread blocked in `wait_timeout()` is
/// woken immediately.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<ShutdownInner>,
}

#[derive(Default)]
struct ShutdownInner {
    flag: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl ShutdownSignal {
    /// Create a new signal in the non-shutdown state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Wakes all waiters immediately.
    pub fn shutdown(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        let _guard = self.inner.mutex.lock();
        self.inner.condvar.notify_all();
    }

    /// Check whether shutdown has been requested (non-blocking).
    pub fn is_shutdown(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Sleep for at most `duration`, waking early on `shutdown()`.
    /// Returns `true` if shutdown was requested (caller should exit).
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        if self.is_shutdown() {
            return true;
        }
        let mut guard = self.inner.mutex.lock();
        if self.is_shutdown() {
            return true;
        }
        self.inner.condvar.wait_for(&mut guard, duration);
        self.is_shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_wakes_waiter() {
        let signal = ShutdownSignal::new();
        let waiter = signal.clone();
        let handle = std::thread::spawn(move || waiter.wait_timeout(Duration::from_secs(30)));

        std::thread::sleep(Duration::from_millis(20));
        signal.shutdown();
        assert!(handle.join().unwrap());
        assert!(signal.is_shutdown());
    }

    #[test]
    fn test_wait_times_out_without_shutdown() {
        let signal = ShutdownSignal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(10)));
    }
}
