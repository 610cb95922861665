//! Snapshot-stable record cursors.
//!
//! A cursor walks one collection forward or backward under its
//! transaction's snapshot. It survives yields: `save` / `restore` re-seek
//! from the last returned id, rebuilding the engine iterator when the
//! transaction switched snapshots in between. On capped collections a
//! restore that finds the last record evicted kills the cursor instead of
//! silently skipping ahead.
//!
//! Forward cursors over capped collections filter what they emit: plain
//! capped collections stop at the lowest uncommitted id; oplog cursors pin
//! a read ceiling at construction and never return anything above it.
//! Reverse oplog cursors start *at* that ceiling rather than the raw end
//! of the prefix, so ids still in flight are never walked over.

use std::sync::Arc;

use shale_common::{RecordId, StoreResult};
use shale_engine::{KvEngine, PrefixIterator};
use shale_txn::TransactionContext;

use crate::keys::{decode_record_id, record_key};
use crate::visibility::VisibilityManager;

/// One record as returned by a cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: RecordId,
    pub data: Vec<u8>,
}

pub struct RecordCursor<'t> {
    txn: &'t TransactionContext,
    engine: Arc<KvEngine>,
    prefix: Vec<u8>,
    visibility: Option<Arc<VisibilityManager>>,
    forward: bool,
    /// Ceiling for forward oplog cursors, pinned at construction.
    read_until: Option<RecordId>,
    iterator: Option<PrefixIterator>,
    last_loc: RecordId,
    eof: bool,
    skip_next_advance: bool,
    need_first_seek: bool,
    /// Snapshot sequence the iterator was built against.
    seq: u64,
}

impl<'t> RecordCursor<'t> {
    pub(crate) fn new(
        txn: &'t TransactionContext,
        engine: Arc<KvEngine>,
        prefix: Vec<u8>,
        visibility: Option<Arc<VisibilityManager>>,
        forward: bool,
        start_hint: RecordId,
        read_until: Option<RecordId>,
    ) -> Self {
        let seq = txn.snapshot_seq();
        let mut cursor = Self {
            txn,
            engine,
            prefix,
            visibility,
            forward,
            read_until,
            iterator: None,
            last_loc: RecordId::NULL,
            eof: false,
            skip_next_advance: false,
            need_first_seek: true,
            seq,
        };

        if !start_hint.is_null() {
            if forward && cursor.read_until.is_some() {
                // Oplog fast path: start the scan at the known-oldest
                // record instead of seeking from the front of the prefix.
                cursor.position_at(start_hint);
            } else if !forward {
                // Reverse oplog scans begin at the visibility ceiling, not
                // the raw end of the prefix: ids above it are still in
                // flight. The ceiling itself counts only once committed.
                cursor.position_at(start_hint);
                cursor.step_below_hidden_ceiling(start_hint);
            }
        }
        cursor
    }

    fn position_at(&mut self, start: RecordId) {
        self.need_first_seek = false;
        self.last_loc = start;
        self.ensure_iterator();
        self.skip_next_advance = true;
        self.eof = false;
    }

    /// A reverse cursor positioned exactly on a still-hidden ceiling must
    /// yield its predecessor instead.
    fn step_below_hidden_ceiling(&mut self, ceiling: RecordId) {
        let Some(visibility) = &self.visibility else {
            return;
        };
        let on_ceiling = self
            .iterator
            .as_ref()
            .and_then(|iter| iter.key())
            .and_then(|suffix| decode_record_id(suffix).ok())
            .map_or(false, |id| id == ceiling);
        if on_ceiling && visibility.is_capped_hidden(ceiling) {
            if let Some(iter) = self.iterator.as_mut() {
                iter.prev();
            }
        }
    }

    fn ensure_iterator(&mut self) {
        if self.iterator.is_some() {
            return;
        }
        let snapshot = self.txn.snapshot();
        self.iterator = Some(self.engine.prefix_iter(&self.prefix, &snapshot));
        if !self.need_first_seek {
            self.position_iterator();
        }
    }

    /// Re-seek the iterator to `last_loc`. Requires the iterator to exist
    /// and the cursor not to be at EOF.
    fn position_iterator(&mut self) {
        self.skip_next_advance = false;
        let target = self.last_loc.to_be_bytes();
        let Some(iter) = self.iterator.as_mut() else {
            return;
        };

        if iter.key() != Some(target.as_slice()) {
            iter.seek(&target);
        }

        if self.forward {
            // If we landed past the target (it was deleted), the iterator
            // already sits on the successor: report it on the next call
            // instead of advancing over it.
            self.skip_next_advance = iter.key() != Some(target.as_slice());
        } else if !iter.valid() {
            // Seek ran off the end; the last record is the first one at
            // or before the target.
            iter.seek_to_last();
            self.skip_next_advance = true;
        } else if iter.key() != Some(target.as_slice()) {
            // Seek lands at-or-after; reverse cursors need at-or-before.
            self.skip_next_advance = true;
            iter.prev();
        }

        let on_target = iter.key() == Some(target.as_slice());
        self.eof = !iter.valid() || (self.visibility.is_some() && !on_target);
    }

    /// Advance and return the next visible record.
    pub fn next(&mut self) -> StoreResult<Option<Record>> {
        if self.eof {
            return Ok(None);
        }
        self.ensure_iterator();

        if !self.skip_next_advance {
            let first_seek = self.need_first_seek;
            self.need_first_seek = false;
            let Some(iter) = self.iterator.as_mut() else {
                return Ok(None);
            };
            if first_seek {
                if self.forward {
                    iter.seek_to_first();
                } else {
                    iter.seek_to_last();
                }
            } else if self.forward {
                iter.next();
            } else {
                iter.prev();
            }
        }
        self.skip_next_advance = false;

        self.current_record()
    }

    /// Point lookup that repositions the cursor. Bypasses the visibility
    /// filter; callers seek only to ids they are entitled to see.
    pub fn seek_exact(&mut self, id: RecordId) -> StoreResult<Option<Record>> {
        self.need_first_seek = false;
        self.skip_next_advance = false;
        self.iterator = None;

        match self.txn.get(&record_key(&self.prefix, id))? {
            Some(data) => {
                self.eof = false;
                self.last_loc = id;
                Ok(Some(Record { id, data }))
            }
            None => {
                self.eof = true;
                Ok(None)
            }
        }
    }

    /// Prepare for a yield. The work happens in [`restore`].
    ///
    /// [`restore`]: RecordCursor::restore
    pub fn save(&mut self) {}

    /// Like [`save`], but the cursor reports EOF until re-seeked.
    ///
    /// [`save`]: RecordCursor::save
    pub fn save_unpositioned(&mut self) {
        self.eof = true;
    }

    /// Re-establish position after a yield. Returns false when the cursor
    /// is dead: on a capped collection the record it stood on was evicted
    /// behind it.
    pub fn restore(&mut self) -> bool {
        let current_seq = self.txn.snapshot_seq();
        if self.iterator.is_none() || self.seq != current_seq {
            let snapshot = self.txn.snapshot();
            self.iterator = Some(self.engine.prefix_iter(&self.prefix, &snapshot));
            self.seq = current_seq;
        }

        self.skip_next_advance = false;

        if self.eof || self.need_first_seek {
            return true;
        }

        self.position_iterator();
        !(self.visibility.is_some() && self.eof)
    }

    /// The record under the iterator, after visibility filtering.
    fn current_record(&mut self) -> StoreResult<Option<Record>> {
        let Some(iter) = self.iterator.as_ref() else {
            self.eof = true;
            return Ok(None);
        };
        let Some((suffix, value)) = iter.entry() else {
            iter.status()?;
            self.eof = true;
            return Ok(None);
        };

        let id = decode_record_id(suffix)?;
        let data = value.to_vec();
        self.eof = false;
        self.last_loc = id;

        if self.forward {
            if let Some(visibility) = &self.visibility {
                let hidden = match self.read_until {
                    // Plain capped collection: stop at the uncommitted
                    // front.
                    None => visibility.is_capped_hidden(id),
                    // Oplog: never read past the pinned ceiling, and take
                    // the ceiling itself only once it is committed.
                    Some(ceiling) => {
                        id > ceiling || (id == ceiling && visibility.is_capped_hidden(id))
                    }
                };
                if hidden {
                    self.eof = true;
                    return Ok(None);
                }
            }
        }

        Ok(Some(Record { id, data }))
    }
}
