//! Optional background capped deleter.
//!
//! When a store is opened with `background_deleter`, foreground writers
//! never delete — they only apply back-pressure once far enough over the
//! cap. This thread does the actual trimming: it wakes periodically and
//! runs the eviction pass with no "just inserted" floor, so everything
//! over the cap is fair game.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use shale_common::ShutdownSignal;

use crate::store::RecordStore;

/// Default wake interval of the deleter thread.
pub const DEFAULT_DELETE_INTERVAL: Duration = Duration::from_millis(100);

pub struct CappedBackgroundDeleter {
    signal: ShutdownSignal,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CappedBackgroundDeleter {
    /// Spawn the deleter thread for `store`.
    pub fn spawn(store: Arc<RecordStore>, interval: Duration) -> Self {
        let signal = ShutdownSignal::new();
        let thread_signal = signal.clone();
        let handle = std::thread::Builder::new()
            .name("shale-capped-deleter".into())
            .spawn(move || {
                while !thread_signal.wait_timeout(interval) {
                    let txn = store.begin();
                    match store.background_delete_excess(&txn) {
                        Ok(0) => {}
                        Ok(removed) => {
                            tracing::debug!(removed, ns = %store.ns(), "background capped delete");
                        }
                        Err(e) => {
                            tracing::warn!("background capped delete failed: {}", e);
                        }
                    }
                }
            })
            .unwrap_or_else(|e| {
                tracing::error!("failed to spawn capped deleter thread: {}", e);
                panic!("capped deleter thread spawn failed");
            });

        Self {
            signal,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Stop the thread and join it.
    pub fn shutdown_and_join(&self) {
        self.signal.shutdown();
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                tracing::error!("capped deleter thread panicked");
            }
        }
    }
}

impl Drop for CappedBackgroundDeleter {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}
