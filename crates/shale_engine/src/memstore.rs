//! Versioned ordered in-memory key-value engine.
//!
//! The substrate the record store runs on: a sorted map of version chains,
//! one chain per key, each version stamped with the commit sequence number
//! of the batch that wrote it. This gives the three contracts the layers
//! above consume:
//!
//! - **Atomic write batches** — every op of a batch commits at one new
//!   sequence number.
//! - **Snapshots** — a pinned sequence number; readers at a snapshot see
//!   exactly the versions committed at or before it. Pins are refcounted so
//!   range compaction never reclaims a version a live snapshot can see.
//! - **Prefix iterators** — RocksDB-shaped stateful cursors scoped to a key
//!   prefix, returning prefix-stripped keys.
//!
//! Read path: point lookups and iterator steps take the map read lock per
//! operation; writes serialize on the write lock.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use shale_common::StoreResult;

use crate::batch::{BatchOp, WriteBatch};

/// One committed value (or tombstone) of a key.
#[derive(Debug, Clone)]
struct Version {
    seq: u64,
    /// `None` is a tombstone.
    data: Option<Vec<u8>>,
}

/// All versions of one key, ascending by sequence number.
#[derive(Debug, Default)]
struct VersionChain {
    versions: Vec<Version>,
}

impl VersionChain {
    fn push(&mut self, seq: u64, data: Option<Vec<u8>>) {
        debug_assert!(self.versions.last().map(|v| v.seq <= seq).unwrap_or(true));
        self.versions.push(Version { seq, data });
    }

    /// The value visible at `seq`, or `None` for "absent or tombstoned".
    fn visible_at(&self, seq: u64) -> Option<&[u8]> {
        self.versions
            .iter()
            .rev()
            .find(|v| v.seq <= seq)
            .and_then(|v| v.data.as_deref())
    }

    /// Drop versions shadowed below `safepoint`. Returns the number of
    /// versions dropped and whether the whole chain is now reclaimable
    /// (a lone tombstone no snapshot still needs).
    fn compact(&mut self, safepoint: u64) -> (u64, bool) {
        let mut dropped = 0u64;
        if let Some(cut) = self.versions.iter().rposition(|v| v.seq <= safepoint) {
            dropped = cut as u64;
            self.versions.drain(..cut);
        }
        let reclaimable = self.versions.len() == 1
            && self.versions[0].data.is_none()
            && self.versions[0].seq <= safepoint;
        (dropped, reclaimable)
    }
}

// ── Snapshots ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct SnapshotRegistry {
    /// Pinned sequence number → pin count.
    pinned: Mutex<BTreeMap<u64, usize>>,
}

impl SnapshotRegistry {
    fn unpin(&self, seq: u64) {
        let mut pinned = self.pinned.lock();
        if let Some(count) = pinned.get_mut(&seq) {
            *count -= 1;
            if *count == 0 {
                pinned.remove(&seq);
            }
        }
    }

    fn oldest(&self) -> Option<u64> {
        self.pinned.lock().keys().next().copied()
    }

    fn live_count(&self) -> usize {
        self.pinned.lock().values().sum()
    }
}

struct SnapshotPin {
    seq: u64,
    registry: Arc<SnapshotRegistry>,
}

impl Drop for SnapshotPin {
    fn drop(&mut self) {
        self.registry.unpin(self.seq);
    }
}

/// A pinned, immutable view of the engine at one commit sequence number.
///
/// Cloning shares the pin; the pin is released when the last clone drops.
#[derive(Clone)]
pub struct Snapshot {
    seq: u64,
    _pin: Arc<SnapshotPin>,
}

impl Snapshot {
    /// The sequence number this snapshot reads at. Used by cursors to
    /// detect that their transaction switched snapshots.
    pub fn sequence(&self) -> u64 {
        self.seq
    }
}

// ── Stats ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct EngineStats {
    batches_applied: AtomicU64,
    ops_applied: AtomicU64,
    compactions: AtomicU64,
    versions_dropped: AtomicU64,
}

/// Point-in-time engine statistics.
#[derive(Debug, Clone)]
pub struct EngineStatsSnapshot {
    pub batches_applied: u64,
    pub ops_applied: u64,
    pub compactions: u64,
    pub versions_dropped: u64,
    pub live_keys: usize,
    pub live_snapshots: usize,
    pub last_committed_seq: u64,
}

// ── Engine ─────────────────────────────────────────────────────────────────

/// The ordered key-value engine.
pub struct KvEngine {
    map: RwLock<BTreeMap<Vec<u8>, VersionChain>>,
    /// Sequence number of the newest committed batch. Only written under
    /// the map write lock.
    last_committed: AtomicU64,
    registry: Arc<SnapshotRegistry>,
    stats: EngineStats,
}

impl KvEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            map: RwLock::new(BTreeMap::new()),
            last_committed: AtomicU64::new(0),
            registry: Arc::new(SnapshotRegistry::default()),
            stats: EngineStats::default(),
        })
    }

    pub fn last_committed_seq(&self) -> u64 {
        self.last_committed.load(Ordering::SeqCst)
    }

    /// Sequence number of the oldest live snapshot, if any. Everything
    /// below it is invisible to every current and future reader.
    pub fn oldest_snapshot_seq(&self) -> Option<u64> {
        self.registry.oldest()
    }

    /// Atomically apply a batch; all its ops commit at one new sequence
    /// number, which is returned. An empty batch commits nothing.
    pub fn apply(&self, batch: WriteBatch) -> StoreResult<u64> {
        if batch.is_empty() {
            return Ok(self.last_committed_seq());
        }
        let mut map = self.map.write();
        let seq = self.last_committed.load(Ordering::SeqCst) + 1;
        for op in batch.ops() {
            match op {
                BatchOp::Put { key, value } => {
                    map.entry(key.clone())
                        .or_default()
                        .push(seq, Some(value.clone()));
                }
                BatchOp::Delete { key } => {
                    map.entry(key.clone()).or_default().push(seq, None);
                }
            }
            self.stats.ops_applied.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.batches_applied.fetch_add(1, Ordering::Relaxed);
        self.last_committed.store(seq, Ordering::SeqCst);
        Ok(seq)
    }

    /// Pin the current committed state for reading.
    pub fn snapshot(&self) -> Snapshot {
        let mut pinned = self.registry.pinned.lock();
        let seq = self.last_committed.load(Ordering::SeqCst);
        *pinned.entry(seq).or_insert(0) += 1;
        drop(pinned);
        Snapshot {
            seq,
            _pin: Arc::new(SnapshotPin {
                seq,
                registry: Arc::clone(&self.registry),
            }),
        }
    }

    /// Point read at a snapshot.
    pub fn get(&self, snapshot: &Snapshot, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.get_at(snapshot.seq, key)
    }

    /// Point read of the newest committed value, bypassing snapshots.
    pub fn get_latest(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.get_at(u64::MAX, key)
    }

    fn get_at(&self, seq: u64, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let map = self.map.read();
        Ok(map.get(key).and_then(|c| c.visible_at(seq)).map(Vec::from))
    }

    /// Iterator over `prefix` at a snapshot.
    pub fn prefix_iter(self: &Arc<Self>, prefix: &[u8], snapshot: &Snapshot) -> PrefixIterator {
        PrefixIterator {
            engine: Arc::clone(self),
            prefix: prefix.to_vec(),
            seq: snapshot.seq,
            _snapshot: Some(snapshot.clone()),
            current: None,
        }
    }

    /// Iterator over `prefix` reading the newest committed state. Used when
    /// no snapshot consistency is needed (e.g. the open-time max-id scan).
    pub fn prefix_iter_latest(self: &Arc<Self>, prefix: &[u8]) -> PrefixIterator {
        PrefixIterator {
            engine: Arc::clone(self),
            prefix: prefix.to_vec(),
            seq: u64::MAX,
            _snapshot: None,
            current: None,
        }
    }

    /// Compact `[prefix+begin, prefix+end]`: drop versions shadowed below
    /// the safepoint (the oldest live snapshot) and reclaim chains that
    /// reduce to a dead tombstone. Returns the number of versions dropped.
    pub fn compact_range(&self, prefix: &[u8], begin: &[u8], end: &[u8]) -> u64 {
        let safepoint = self
            .registry
            .oldest()
            .unwrap_or_else(|| self.last_committed.load(Ordering::SeqCst));

        let lower = [prefix, begin].concat();
        let upper = [prefix, end].concat();
        let mut dropped = 0u64;
        let mut reclaim = Vec::new();

        let mut map = self.map.write();
        for (key, chain) in map.range_mut::<[u8], _>((
            Bound::Included(lower.as_slice()),
            Bound::Included(upper.as_slice()),
        )) {
            let (n, reclaimable) = chain.compact(safepoint);
            dropped += n;
            if reclaimable {
                dropped += 1;
                reclaim.push(key.clone());
            }
        }
        for key in reclaim {
            map.remove(&key);
        }
        drop(map);

        self.stats.compactions.fetch_add(1, Ordering::Relaxed);
        self.stats
            .versions_dropped
            .fetch_add(dropped, Ordering::Relaxed);
        dropped
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            batches_applied: self.stats.batches_applied.load(Ordering::Relaxed),
            ops_applied: self.stats.ops_applied.load(Ordering::Relaxed),
            compactions: self.stats.compactions.load(Ordering::Relaxed),
            versions_dropped: self.stats.versions_dropped.load(Ordering::Relaxed),
            live_keys: self.map.read().len(),
            live_snapshots: self.registry.live_count(),
            last_committed_seq: self.last_committed_seq(),
        }
    }

    /// First (or last, when `reverse`) key within `(lower, upper)` carrying
    /// a value visible at `seq`.
    fn scan_visible(
        &self,
        lower: Bound<Vec<u8>>,
        upper: Bound<Vec<u8>>,
        seq: u64,
        reverse: bool,
    ) -> Option<(Vec<u8>, Vec<u8>)> {
        let map = self.map.read();
        let range = map.range::<Vec<u8>, _>((lower, upper));
        let pick = |(key, chain): (&Vec<u8>, &VersionChain)| {
            chain
                .visible_at(seq)
                .map(|value| (key.clone(), value.to_vec()))
        };
        if reverse {
            range.rev().filter_map(pick).next()
        } else {
            range.filter_map(pick).next()
        }
    }
}

/// Exclusive upper bound covering every key starting with `prefix`, or
/// `None` when unbounded (empty or all-0xFF prefix).
fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut out = prefix.to_vec();
    while let Some(last) = out.last_mut() {
        if *last == 0xff {
            out.pop();
        } else {
            *last += 1;
            return Some(out);
        }
    }
    None
}

// ── Prefix iterator ────────────────────────────────────────────────────────

/// Stateful cursor over one key prefix at a fixed sequence number.
///
/// Mirrors the RocksDB iterator surface: seek/next/prev position the
/// cursor, `entry()` exposes the current (prefix-stripped) key and value,
/// and an invalid cursor stays invalid until re-seeked. Tombstoned keys are
/// skipped transparently.
pub struct PrefixIterator {
    engine: Arc<KvEngine>,
    prefix: Vec<u8>,
    seq: u64,
    /// Keeps the snapshot pin alive for the iterator's lifetime.
    _snapshot: Option<Snapshot>,
    /// Current (full key, value); `None` when invalid.
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl PrefixIterator {
    fn lower_edge(&self) -> Bound<Vec<u8>> {
        Bound::Included(self.prefix.clone())
    }

    fn upper_edge(&self) -> Bound<Vec<u8>> {
        match prefix_upper_bound(&self.prefix) {
            Some(bound) => Bound::Excluded(bound),
            None => Bound::Unbounded,
        }
    }

    pub fn seek_to_first(&mut self) {
        self.current = self
            .engine
            .scan_visible(self.lower_edge(), self.upper_edge(), self.seq, false);
    }

    pub fn seek_to_last(&mut self) {
        self.current = self
            .engine
            .scan_visible(self.lower_edge(), self.upper_edge(), self.seq, true);
    }

    /// Position at the first key `>= prefix + suffix`.
    pub fn seek(&mut self, suffix: &[u8]) {
        let target = [self.prefix.as_slice(), suffix].concat();
        self.current =
            self.engine
                .scan_visible(Bound::Included(target), self.upper_edge(), self.seq, false);
    }

    /// Advance. A cursor that was never positioned or already ran off the
    /// end stays invalid.
    pub fn next(&mut self) {
        let Some((key, _)) = self.current.take() else {
            return;
        };
        self.current =
            self.engine
                .scan_visible(Bound::Excluded(key), self.upper_edge(), self.seq, false);
    }

    pub fn prev(&mut self) {
        let Some((key, _)) = self.current.take() else {
            return;
        };
        self.current =
            self.engine
                .scan_visible(self.lower_edge(), Bound::Excluded(key), self.seq, true);
    }

    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    /// Current prefix-stripped key and value, when valid.
    pub fn entry(&self) -> Option<(&[u8], &[u8])> {
        self.current
            .as_ref()
            .map(|(key, value)| (&key[self.prefix.len()..], value.as_slice()))
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.entry().map(|(key, _)| key)
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.entry().map(|(_, value)| value)
    }

    /// Scan status. The memstore cannot fail mid-scan; the method exists so
    /// callers keep the check-status-at-end discipline of the contract.
    pub fn status(&self) -> StoreResult<()> {
        Ok(())
    }
}
