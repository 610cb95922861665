//! Capped and oplog visibility.
//!
//! An insert into a capped collection allocates an id before it commits.
//! Until the transaction resolves, that id — and everything above it — must
//! stay invisible to readers, or a scan could observe id B without the
//! earlier, still-uncommitted id A < B and replication would see a hole.
//!
//! The manager tracks the set of uncommitted ids. A record is
//! *capped-hidden* iff its id is at or above the lowest uncommitted id.
//! For the oplog the rules tighten further: a committed id only becomes
//! visible once it is durable *and* every earlier id is durable or rolled
//! back. A dedicated journal thread establishes that order: commits that
//! happened while later inserts were in flight park on a queue, the thread
//! waits for durability, then erases them and wakes readers.

use std::collections::BTreeSet;
use std::mem;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use shale_common::{RecordId, StoreResult};
use shale_engine::DurabilityManager;
use shale_txn::{Change, TransactionContext};

use crate::capped::CappedCallbackSlot;

/// Poll interval for interruptible visibility waits.
const VISIBILITY_WAIT_POLL: Duration = Duration::from_millis(10);

struct VisibilityState {
    /// Ids allocated but not yet visible, ascending.
    uncommitted: BTreeSet<RecordId>,
    /// Highest id ever handed out (committed or not).
    highest_seen: RecordId,
    /// Committed oplog ids awaiting the durability round-trip.
    waiting_for_journal: Vec<RecordId>,
    shutting_down: bool,
}

pub struct VisibilityManager {
    is_oplog: bool,
    state: Mutex<VisibilityState>,
    /// Signalled when `waiting_for_journal` gains work or on shutdown.
    journal_work: Condvar,
    /// Broadcast whenever ids leave `uncommitted`.
    became_visible: Condvar,
    durability: Arc<DurabilityManager>,
    callback: Arc<CappedCallbackSlot>,
    journal_thread: Mutex<Option<JoinHandle<()>>>,
}

/// Commit/rollback hook pinning one uncommitted id to its transaction.
struct CappedInsertChange {
    manager: Arc<VisibilityManager>,
    id: RecordId,
}

impl Change for CappedInsertChange {
    fn commit(&mut self) {
        self.manager.record_dealt_with(self.id, true);
    }

    fn rollback(&mut self) {
        self.manager.record_dealt_with(self.id, false);
        self.manager.callback.notify_waiters();
    }
}

impl VisibilityManager {
    pub fn new(
        is_oplog: bool,
        durability: Arc<DurabilityManager>,
        callback: Arc<CappedCallbackSlot>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            is_oplog,
            state: Mutex::new(VisibilityState {
                uncommitted: BTreeSet::new(),
                highest_seen: RecordId::MIN,
                waiting_for_journal: Vec::new(),
                shutting_down: false,
            }),
            journal_work: Condvar::new(),
            became_visible: Condvar::new(),
            durability,
            callback,
            journal_thread: Mutex::new(None),
        });

        if is_oplog {
            let runner = Arc::clone(&manager);
            let handle = std::thread::Builder::new()
                .name("shale-oplog-journal".into())
                .spawn(move || runner.journal_loop())
                .unwrap_or_else(|e| {
                    tracing::error!("failed to spawn oplog journal thread: {}", e);
                    panic!("oplog journal thread spawn failed");
                });
            *manager.journal_thread.lock() = Some(handle);
        }
        manager
    }

    // ── Registering uncommitted ids ────────────────────────────────────

    /// Record a caller-supplied id as uncommitted. Ids must arrive in
    /// ascending order; an id at or below the highest ever seen is
    /// rejected.
    pub fn add_uncommitted_in_order(
        self: &Arc<Self>,
        txn: &TransactionContext,
        id: RecordId,
    ) -> StoreResult<()> {
        let mut state = self.state.lock();
        if state.highest_seen != RecordId::MIN && id <= state.highest_seen {
            return Err(shale_common::StoreError::BadValue(format!(
                "out-of-order oplog id {} (highest seen {})",
                id, state.highest_seen
            )));
        }
        self.add_uncommitted_locked(&mut state, txn, id);
        Ok(())
    }

    /// Allocate an id under the visibility lock and record it as
    /// uncommitted. Holding the lock across the allocation guarantees that
    /// allocation order equals insertion order, which keeps the set
    /// monotonic under concurrent writers.
    pub fn allocate_and_add_uncommitted(
        self: &Arc<Self>,
        txn: &TransactionContext,
        next_id: impl FnOnce() -> RecordId,
    ) -> RecordId {
        let mut state = self.state.lock();
        let id = next_id();
        self.add_uncommitted_locked(&mut state, txn, id);
        id
    }

    fn add_uncommitted_locked(
        self: &Arc<Self>,
        state: &mut VisibilityState,
        txn: &TransactionContext,
        id: RecordId,
    ) {
        debug_assert!(state
            .uncommitted
            .iter()
            .next_back()
            .map_or(true, |last| *last < id));
        state.uncommitted.insert(id);
        txn.register_change(Box::new(CappedInsertChange {
            manager: Arc::clone(self),
            id,
        }));
        state.highest_seen = id;
    }

    // ── Commit / rollback resolution ───────────────────────────────────

    fn record_dealt_with(&self, id: RecordId, did_commit: bool) {
        let mut state = self.state.lock();
        if did_commit && self.is_oplog && id != state.highest_seen {
            // Later inserts exist; this id may become durable after them.
            // Defer erasure to the journal thread so readers never observe
            // it ahead of an earlier, not-yet-durable id. When no later
            // inserts exist, durability follows commit order and the fast
            // path below is safe.
            let was_empty = state.waiting_for_journal.is_empty();
            state.waiting_for_journal.push(id);
            if was_empty {
                self.journal_work.notify_one();
            }
        } else {
            state.uncommitted.remove(&id);
            self.became_visible.notify_all();
        }
    }

    // ── Queries ────────────────────────────────────────────────────────

    /// A record is hidden iff some uncommitted insert sits at or below it.
    pub fn is_capped_hidden(&self, id: RecordId) -> bool {
        let state = self.state.lock();
        match state.uncommitted.iter().next() {
            Some(lowest) => *lowest <= id,
            None => false,
        }
    }

    pub fn lowest_hidden(&self) -> Option<RecordId> {
        self.state.lock().uncommitted.iter().next().copied()
    }

    /// The ceiling a forward oplog reader pins at snapshot time: the
    /// lowest uncommitted id, or the highest seen when nothing is in
    /// flight. Readers accept ids below the ceiling, and the ceiling
    /// itself only while it is not hidden.
    pub fn oplog_read_ceiling(&self) -> RecordId {
        let state = self.state.lock();
        match state.uncommitted.iter().next() {
            Some(lowest) => *lowest,
            None => state.highest_seen,
        }
    }

    pub fn highest_seen(&self) -> RecordId {
        self.state.lock().highest_seen
    }

    pub fn update_highest_seen(&self, id: RecordId) {
        let mut state = self.state.lock();
        if id > state.highest_seen {
            state.highest_seen = id;
        }
    }

    /// Forget ids above a truncation point so fresh inserts resume there.
    pub fn set_highest_seen(&self, id: RecordId) {
        self.state.lock().highest_seen = id;
    }

    // ── Waiting ────────────────────────────────────────────────────────

    /// Block until every id at or below the current highest has become
    /// visible (durable) or rolled back. Interruptible through the
    /// transaction.
    pub fn wait_for_all_earlier_oplog_writes_to_be_visible(
        &self,
        txn: &TransactionContext,
    ) -> StoreResult<()> {
        let mut state = self.state.lock();
        let waiting_for = state.highest_seen;
        loop {
            let visible = match state.uncommitted.iter().next() {
                Some(lowest) => *lowest > waiting_for,
                None => true,
            };
            if visible {
                return Ok(());
            }
            txn.check_for_interrupt()?;
            self.became_visible
                .wait_for(&mut state, VISIBILITY_WAIT_POLL);
        }
    }

    // ── Journal thread ─────────────────────────────────────────────────

    fn journal_loop(&self) {
        loop {
            let batch = {
                let mut state = self.state.lock();
                loop {
                    if state.shutting_down {
                        return;
                    }
                    if !state.waiting_for_journal.is_empty() {
                        break;
                    }
                    self.journal_work.wait(&mut state);
                }
                mem::take(&mut state.waiting_for_journal)
            };

            // A failure here would stall visibility forever; there is no
            // recovery short of restarting the process.
            if let Err(e) = self.durability.wait_until_durable(false) {
                tracing::error!("oplog journal thread failed waiting for durability: {}", e);
                std::process::abort();
            }

            {
                let mut state = self.state.lock();
                for id in &batch {
                    state.uncommitted.remove(id);
                }
                self.became_visible.notify_all();
            }

            self.callback.notify_waiters();
        }
    }

    /// Stop the journal thread (if any) and join it.
    pub fn shutdown_and_join(&self) {
        {
            let mut state = self.state.lock();
            state.shutting_down = true;
            self.journal_work.notify_one();
        }
        if let Some(handle) = self.journal_thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!("oplog journal thread panicked");
            }
        }
    }
}
