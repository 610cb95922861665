//! Background range-compaction scheduler.
//!
//! Callers enqueue a key range; a single named thread drains the queue and
//! runs `KvEngine::compact_range`. Scheduling never blocks the caller.
//! Requests for a prefix that already has one pending are coalesced — a
//! second compaction of the same prefix before the first ran would do no
//! extra work.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::memstore::KvEngine;

/// One pending compaction of `[prefix+begin, prefix+end]`.
#[derive(Debug, Clone)]
pub struct CompactRequest {
    pub prefix: Vec<u8>,
    pub begin: Vec<u8>,
    pub end: Vec<u8>,
}

#[derive(Default)]
struct SchedulerState {
    queue: VecDeque<CompactRequest>,
    shutting_down: bool,
}

/// Point-in-time scheduler statistics.
#[derive(Debug, Clone)]
pub struct CompactionStatsSnapshot {
    pub scheduled: u64,
    pub coalesced: u64,
    pub completed: u64,
    pub versions_dropped: u64,
}

pub struct CompactionScheduler {
    engine: Arc<KvEngine>,
    state: Mutex<SchedulerState>,
    work_available: Condvar,
    handle: Mutex<Option<JoinHandle<()>>>,
    scheduled: AtomicU64,
    coalesced: AtomicU64,
    completed: AtomicU64,
    versions_dropped: AtomicU64,
}

impl CompactionScheduler {
    pub fn new(engine: Arc<KvEngine>) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            engine,
            state: Mutex::new(SchedulerState::default()),
            work_available: Condvar::new(),
            handle: Mutex::new(None),
            scheduled: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            versions_dropped: AtomicU64::new(0),
        });

        let runner = Arc::clone(&scheduler);
        let handle = std::thread::Builder::new()
            .name("shale-compaction".into())
            .spawn(move || runner.run())
            .unwrap_or_else(|e| {
                tracing::error!("failed to spawn compaction scheduler: {}", e);
                panic!("compaction scheduler thread spawn failed");
            });
        *scheduler.handle.lock() = Some(handle);
        scheduler
    }

    /// Enqueue a range compaction. Never blocks.
    pub fn schedule(&self, prefix: &[u8], begin: &[u8], end: &[u8]) {
        let mut state = self.state.lock();
        if state.shutting_down {
            return;
        }
        if state.queue.iter().any(|req| req.prefix == prefix) {
            self.coalesced.fetch_add(1, Ordering::Relaxed);
            return;
        }
        state.queue.push_back(CompactRequest {
            prefix: prefix.to_vec(),
            begin: begin.to_vec(),
            end: end.to_vec(),
        });
        self.scheduled.fetch_add(1, Ordering::Relaxed);
        self.work_available.notify_one();
    }

    /// Number of requests not yet executed.
    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Stop the runner thread and join it. Pending requests are dropped.
    pub fn shutdown_and_join(&self) {
        {
            let mut state = self.state.lock();
            state.shutting_down = true;
            self.work_available.notify_all();
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                tracing::error!("compaction scheduler thread panicked");
            }
        }
    }

    pub fn stats(&self) -> CompactionStatsSnapshot {
        CompactionStatsSnapshot {
            scheduled: self.scheduled.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            versions_dropped: self.versions_dropped.load(Ordering::Relaxed),
        }
    }

    fn run(&self) {
        loop {
            let request = {
                let mut state = self.state.lock();
                loop {
                    if state.shutting_down {
                        return;
                    }
                    if let Some(req) = state.queue.pop_front() {
                        break req;
                    }
                    self.work_available.wait(&mut state);
                }
            };

            let dropped = self
                .engine
                .compact_range(&request.prefix, &request.begin, &request.end);
            self.completed.fetch_add(1, Ordering::Relaxed);
            self.versions_dropped.fetch_add(dropped, Ordering::Relaxed);
            tracing::debug!(
                prefix_len = request.prefix.len(),
                dropped,
                "range compaction completed"
            );
        }
    }
}
