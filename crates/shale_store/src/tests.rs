mod support {
    use std::sync::Arc;

    use shale_engine::{CompactionScheduler, DurabilityManager, KvEngine};
    use shale_txn::ConflictTracker;

    use crate::store::{RecordStore, RecordStoreOptions};

    /// Process-wide services a store gets injected at construction.
    pub struct Services {
        pub engine: Arc<KvEngine>,
        pub durability: Arc<DurabilityManager>,
        pub compaction: Arc<CompactionScheduler>,
        pub conflicts: Arc<ConflictTracker>,
    }

    impl Services {
        pub fn new() -> Self {
            let engine = KvEngine::new();
            let durability = DurabilityManager::new(Arc::clone(&engine));
            let compaction = CompactionScheduler::new(Arc::clone(&engine));
            Self {
                engine,
                durability,
                compaction,
                conflicts: Arc::new(ConflictTracker::new()),
            }
        }

        pub fn open(&self, options: RecordStoreOptions) -> RecordStore {
            RecordStore::open(
                options,
                Arc::clone(&self.engine),
                Arc::clone(&self.durability),
                Arc::clone(&self.compaction),
                Arc::clone(&self.conflicts),
                None,
            )
            .unwrap()
        }
    }

    impl Drop for Services {
        fn drop(&mut self) {
            self.compaction.shutdown_and_join();
        }
    }

    /// All ids visible to a fresh forward cursor.
    pub fn visible_ids(store: &RecordStore) -> Vec<i64> {
        let txn = store.begin();
        let mut cursor = store.get_cursor(&txn, true).unwrap();
        let mut ids = Vec::new();
        while let Some(record) = cursor.next().unwrap() {
            ids.push(record.id.repr());
        }
        ids
    }

    /// All ids physically present under a prefix, ignoring visibility.
    pub fn engine_ids(engine: &Arc<KvEngine>, prefix: &[u8]) -> Vec<i64> {
        let mut iter = engine.prefix_iter_latest(prefix);
        iter.seek_to_first();
        let mut ids = Vec::new();
        while let Some((suffix, _)) = iter.entry() {
            ids.push(crate::keys::decode_record_id(suffix).unwrap().repr());
            iter.next();
        }
        ids
    }
}

#[cfg(test)]
mod record_store_tests {
    use super::support::{engine_ids, visible_ids, Services};
    use crate::store::RecordStoreOptions;
    use shale_common::{RecordId, StoreError};

    #[test]
    fn test_insert_assigns_monotonic_ids() {
        let services = Services::new();
        let store = services.open(RecordStoreOptions::plain("app.s1", "s1", b"P".to_vec()));

        let txn = store.begin();
        assert_eq!(store.insert(&txn, b"a").unwrap(), RecordId::new(1));
        assert_eq!(store.insert(&txn, b"bb").unwrap(), RecordId::new(2));
        assert_eq!(store.insert(&txn, b"ccc").unwrap(), RecordId::new(3));
        txn.commit().unwrap();

        let txn = store.begin();
        assert_eq!(store.num_records(&txn), 3);
        assert_eq!(store.data_size(&txn), 6);
        assert_eq!(visible_ids(&store), vec![1, 2, 3]);
    }

    #[test]
    fn test_rollback_restores_counters_but_not_ids() {
        let services = Services::new();
        let store = services.open(RecordStoreOptions::plain("app.s2", "s2", b"P".to_vec()));

        let txn = store.begin();
        assert_eq!(store.insert(&txn, b"x").unwrap(), RecordId::new(1));
        txn.commit().unwrap();

        let txn = store.begin();
        assert_eq!(store.insert(&txn, b"yy").unwrap(), RecordId::new(2));
        txn.rollback();

        let txn = store.begin();
        assert_eq!(store.num_records(&txn), 1);
        assert_eq!(store.data_size(&txn), 1);

        // Ids never revert, even across rollbacks.
        assert_eq!(store.insert(&txn, b"z").unwrap(), RecordId::new(3));
        txn.commit().unwrap();
        assert_eq!(visible_ids(&store), vec![1, 3]);
    }

    #[test]
    fn test_find_update_delete_roundtrip() {
        let services = Services::new();
        let store = services.open(RecordStoreOptions::plain("app.crud", "crud", b"C".to_vec()));

        let txn = store.begin();
        let id = store.insert(&txn, b"hello").unwrap();
        txn.commit().unwrap();

        let txn = store.begin();
        assert_eq!(store.find_record(&txn, id).unwrap(), Some(b"hello".to_vec()));
        assert_eq!(store.find_record(&txn, RecordId::new(42)).unwrap(), None);
        assert!(store.record_bytes(&txn, RecordId::new(42)).is_err());

        store.update_record(&txn, id, b"hello, world").unwrap();
        txn.commit().unwrap();

        let txn = store.begin();
        assert_eq!(store.data_size(&txn), 12);
        assert_eq!(
            store.record_bytes(&txn, id).unwrap(),
            b"hello, world".to_vec()
        );

        store.delete_record(&txn, id).unwrap();
        txn.commit().unwrap();

        let txn = store.begin();
        assert_eq!(store.num_records(&txn), 0);
        assert_eq!(store.data_size(&txn), 0);
        assert_eq!(store.find_record(&txn, id).unwrap(), None);
    }

    #[test]
    fn test_delete_conflicts_between_transactions() {
        let services = Services::new();
        let store = services.open(RecordStoreOptions::plain("app.confl", "confl", b"W".to_vec()));

        let txn = store.begin();
        let id = store.insert(&txn, b"v").unwrap();
        txn.commit().unwrap();

        let a = store.begin();
        let b = store.begin();
        store.delete_record(&a, id).unwrap();
        match store.delete_record(&b, id) {
            Err(StoreError::WriteConflict) => {}
            other => panic!("expected write conflict, got {:?}", other.map(|_| ())),
        }
        a.rollback();

        // After the rollback the record is free again.
        store.delete_record(&b, id).unwrap();
        b.commit().unwrap();
    }

    #[test]
    fn test_update_in_place_unsupported() {
        let services = Services::new();
        let store = services.open(RecordStoreOptions::plain("app.dmg", "dmg", b"D".to_vec()));
        let txn = store.begin();
        let id = store.insert(&txn, b"abc").unwrap();
        assert!(matches!(
            store.update_in_place(&txn, id, &[(0, b"x".to_vec())]),
            Err(StoreError::Unsupported(_))
        ));
    }

    #[test]
    fn test_truncate_empties_collection() {
        let services = Services::new();
        let store = services.open(RecordStoreOptions::plain("app.trunc", "trunc", b"T".to_vec()));

        let txn = store.begin();
        for payload in [&b"a"[..], b"bb", b"ccc", b"dddd"] {
            store.insert(&txn, payload).unwrap();
        }
        txn.commit().unwrap();

        let txn = store.begin();
        store.truncate(&txn).unwrap();
        txn.commit().unwrap();

        let txn = store.begin();
        assert_eq!(store.num_records(&txn), 0);
        assert_eq!(store.data_size(&txn), 0);
        assert!(engine_ids(&services.engine, b"T").is_empty());
    }

    #[test]
    fn test_reopen_preserves_counters_and_ids() {
        let services = Services::new();
        let options = RecordStoreOptions::plain("app.reopen", "reopen", b"R".to_vec());
        let store = services.open(options.clone());

        let txn = store.begin();
        store.insert(&txn, b"aaa").unwrap();
        store.insert(&txn, b"bb").unwrap();
        txn.commit().unwrap();
        drop(store);

        let store = services.open(options);
        let txn = store.begin();
        assert_eq!(store.num_records(&txn), 2);
        assert_eq!(store.data_size(&txn), 5);
        // The allocator resumes above the highest surviving id.
        assert_eq!(store.insert(&txn, b"c").unwrap(), RecordId::new(3));
    }

    #[test]
    fn test_storage_size_rounds_to_256() {
        let services = Services::new();
        let store = services.open(RecordStoreOptions::plain("app.sz", "sz", b"Z".to_vec()));
        assert_eq!(store.storage_size(), 256);

        let txn = store.begin();
        store.insert(&txn, &[0u8; 1000]).unwrap();
        txn.commit().unwrap();
        assert_eq!(store.storage_size(), 768);
    }

    #[test]
    fn test_insert_many_allocates_in_order() {
        let services = Services::new();
        let store = services.open(RecordStoreOptions::plain("app.many", "many", b"M".to_vec()));
        let txn = store.begin();
        let ids = store.insert_many(&txn, &[b"a", b"b", b"c"]).unwrap();
        txn.commit().unwrap();
        assert_eq!(
            ids,
            vec![RecordId::new(1), RecordId::new(2), RecordId::new(3)]
        );
    }

    #[test]
    fn test_validate_repairs_bad_counters() {
        let services = Services::new();
        let store = services.open(RecordStoreOptions::plain("app.val", "val", b"V".to_vec()));

        let txn = store.begin();
        store.insert(&txn, b"one").unwrap();
        store.insert(&txn, b"four").unwrap();
        txn.commit().unwrap();

        // Wreck the cached counters, then let validation find out.
        let txn = store.begin();
        store.update_stats_after_repair(&txn, 99, 9_999).unwrap();
        drop(txn);

        let txn = store.begin();
        let results = store.validate(&txn).unwrap();
        assert!(results.repaired);
        assert_eq!(results.num_records, 2);
        assert_eq!(results.data_size, 7);

        let txn = store.begin();
        assert_eq!(store.num_records(&txn), 2);
        assert_eq!(store.data_size(&txn), 7);

        // A clean store validates clean.
        assert!(!store.validate(&txn).unwrap().repaired);
    }

    #[test]
    fn test_capped_options_validated() {
        let services = Services::new();
        let mut options =
            RecordStoreOptions::capped("app.bad", "bad", b"B".to_vec(), 0, -1);
        assert!(matches!(
            crate::store::RecordStore::open(
                options.clone(),
                std::sync::Arc::clone(&services.engine),
                std::sync::Arc::clone(&services.durability),
                std::sync::Arc::clone(&services.compaction),
                std::sync::Arc::clone(&services.conflicts),
                None,
            ),
            Err(StoreError::BadValue(_))
        ));

        options.capped = false;
        options.capped_max_size = 100;
        assert!(matches!(
            crate::store::RecordStore::open(
                options,
                std::sync::Arc::clone(&services.engine),
                std::sync::Arc::clone(&services.durability),
                std::sync::Arc::clone(&services.compaction),
                std::sync::Arc::clone(&services.conflicts),
                None,
            ),
            Err(StoreError::BadValue(_))
        ));
    }
}

#[cfg(test)]
mod capped_tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use super::support::{engine_ids, visible_ids, Services};
    use crate::background::CappedBackgroundDeleter;
    use crate::store::RecordStoreOptions;
    use shale_common::{RecordId, StoreError};

    #[test]
    fn test_capped_trims_oldest_by_size() {
        let services = Services::new();
        let store =
            services.open(RecordStoreOptions::capped("app.c3", "c3", b"3".to_vec(), 10, -1));

        for _ in 0..10 {
            let txn = store.begin();
            store.insert(&txn, b"x").unwrap();
            txn.commit().unwrap();
        }
        let txn = store.begin();
        let id = store.insert(&txn, b"yyy").unwrap();
        txn.commit().unwrap();
        assert_eq!(id, RecordId::new(11));

        let txn = store.begin();
        assert_eq!(store.data_size(&txn), 10);
        assert_eq!(store.num_records(&txn), 8);
        assert_eq!(visible_ids(&store), (4..=11).collect::<Vec<_>>());
    }

    #[test]
    fn test_capped_enforces_document_cap() {
        let services = Services::new();
        let store = services.open(RecordStoreOptions::capped(
            "app.c4",
            "c4",
            b"4".to_vec(),
            1 << 30,
            3,
        ));

        for _ in 0..4 {
            let txn = store.begin();
            store.insert(&txn, b"x").unwrap();
            txn.commit().unwrap();
        }

        let txn = store.begin();
        assert_eq!(store.num_records(&txn), 3);
        assert_eq!(visible_ids(&store), vec![2, 3, 4]);
    }

    #[test]
    fn test_oversized_insert_rejected_and_cap_updatable() {
        let services = Services::new();
        let store =
            services.open(RecordStoreOptions::capped("app.big", "big", b"G".to_vec(), 10, -1));

        let txn = store.begin();
        assert!(matches!(
            store.insert(&txn, &[0u8; 11]),
            Err(StoreError::BadValue(_))
        ));

        store.update_capped_size(1000).unwrap();
        store.insert(&txn, &[0u8; 11]).unwrap();
        txn.commit().unwrap();

        assert!(matches!(
            store.update_capped_size(0),
            Err(StoreError::BadValue(_))
        ));
    }

    #[test]
    fn test_uncommitted_inserts_hide_later_records() {
        let services = Services::new();
        let store =
            services.open(RecordStoreOptions::capped("app.vis", "vis", b"H".to_vec(), 1 << 20, -1));

        let txn = store.begin();
        store.insert(&txn, b"a").unwrap();
        store.insert(&txn, b"b").unwrap();
        txn.commit().unwrap();

        // Pending insert of id 3 ...
        let pending = store.begin();
        store.insert(&pending, b"c").unwrap();

        // ... and a committed insert of id 4 behind it.
        let later = store.begin();
        store.insert(&later, b"d").unwrap();
        later.commit().unwrap();

        // Readers stop at the uncommitted front: id 4 is committed but
        // capped-hidden.
        assert_eq!(visible_ids(&store), vec![1, 2]);

        pending.commit().unwrap();
        assert_eq!(visible_ids(&store), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_capped_restore_dies_when_record_evicted() {
        let services = Services::new();
        let store =
            services.open(RecordStoreOptions::capped("app.dead", "dead", b"E".to_vec(), 10, -1));

        for _ in 0..5 {
            let txn = store.begin();
            store.insert(&txn, b"xx").unwrap();
            txn.commit().unwrap();
        }

        let reader = store.begin();
        let mut cursor = store.get_cursor(&reader, true).unwrap();
        assert_eq!(cursor.next().unwrap().unwrap().id, RecordId::new(1));
        cursor.save();

        // Push the store over the cap; id 1 gets evicted.
        let txn = store.begin();
        store.insert(&txn, b"zz").unwrap();
        txn.commit().unwrap();
        assert!(!engine_ids(&services.engine, b"E").contains(&1));

        reader.renew_snapshot();
        assert!(!cursor.restore());
    }

    #[test]
    fn test_capped_truncate_after() {
        let services = Services::new();
        let store =
            services.open(RecordStoreOptions::capped("app.cta", "cta", b"A".to_vec(), 1 << 20, -1));

        let txn = store.begin();
        for payload in [&b"a"[..], b"b", b"c", b"d", b"e"] {
            store.insert(&txn, payload).unwrap();
        }
        txn.commit().unwrap();

        let txn = store.begin();
        txn.set_exclusive(true);
        let removed = store
            .capped_truncate_after(&txn, RecordId::new(3), false)
            .unwrap();
        assert_eq!(removed, 2);
        txn.commit().unwrap();

        assert_eq!(visible_ids(&store), vec![1, 2, 3]);
        let txn = store.begin();
        assert_eq!(store.num_records(&txn), 3);

        // Inclusive form removes the pivot too.
        txn.set_exclusive(true);
        let removed = store
            .capped_truncate_after(&txn, RecordId::new(2), true)
            .unwrap();
        assert_eq!(removed, 2);
        txn.commit().unwrap();
        assert_eq!(visible_ids(&store), vec![1]);
    }

    #[test]
    fn test_background_deleter_restores_bound() {
        let services = Services::new();
        let mut options =
            RecordStoreOptions::capped("app.bg", "bg", b"K".to_vec(), 10, -1);
        options.background_deleter = true;
        let store = Arc::new(services.open(options));
        let deleter =
            CappedBackgroundDeleter::spawn(Arc::clone(&store), Duration::from_millis(10));

        for _ in 0..15 {
            let txn = store.begin();
            store.insert(&txn, b"x").unwrap();
            txn.commit().unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        let txn = store.begin();
        while store.data_size(&txn) > 10 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(store.data_size(&txn) <= 10);

        deleter.shutdown_and_join();
    }
}

#[cfg(test)]
mod oplog_tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{mpsc, Arc};
    use std::time::{Duration, Instant};

    use super::support::{engine_ids, visible_ids, Services};
    use crate::keys::next_prefix;
    use crate::store::{RecordStore, RecordStoreOptions};
    use shale_common::{RecordId, StoreError};

    fn oplog_options(prefix: Vec<u8>) -> RecordStoreOptions {
        RecordStoreOptions {
            ns: "local.oplog.rs".into(),
            ident: "oplog".into(),
            prefix,
            capped: true,
            capped_max_size: 1 << 20,
            capped_max_docs: -1,
            background_deleter: false,
        }
    }

    fn wait_all_visible(store: &RecordStore) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while store
            .visibility_for_tests()
            .and_then(|v| v.lowest_hidden())
            .is_some()
            && Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_oplog_insert_api_boundaries() {
        let services = Services::new();
        let oplog = services.open(oplog_options(vec![0x10]));
        let plain = services.open(RecordStoreOptions::plain("app.p", "p", vec![0x20]));

        let txn = oplog.begin();
        assert!(matches!(
            oplog.insert(&txn, b"entry"),
            Err(StoreError::Unsupported(_))
        ));
        assert!(matches!(
            plain.insert_oplog(&txn, RecordId::new(1), b"entry"),
            Err(StoreError::Unsupported(_))
        ));
        assert!(matches!(
            oplog.insert_oplog(&txn, RecordId::NULL, b"entry"),
            Err(StoreError::BadValue(_))
        ));

        oplog.insert_oplog(&txn, RecordId::new(100), b"entry").unwrap();
        // Ids must keep ascending, even before the first commit.
        assert!(matches!(
            oplog.insert_oplog(&txn, RecordId::new(50), b"early"),
            Err(StoreError::BadValue(_))
        ));
        txn.commit().unwrap();
    }

    #[test]
    fn test_shadow_tracker_mirrors_oplog() {
        let services = Services::new();
        let store = services.open(oplog_options(vec![0x10]));
        let tracker_prefix = next_prefix(&[0x10]);

        let txn = store.begin();
        for (id, payload) in [(100, &b"aa"[..]), (200, b"bbbb"), (300, b"c")] {
            store
                .insert_oplog(&txn, RecordId::new(id), payload)
                .unwrap();
        }
        txn.commit().unwrap();
        wait_all_visible(&store);

        assert_eq!(
            engine_ids(&services.engine, &[0x10]),
            engine_ids(&services.engine, &tracker_prefix)
        );

        let txn = store.begin();
        store.delete_record(&txn, RecordId::new(200)).unwrap();
        txn.commit().unwrap();

        assert_eq!(engine_ids(&services.engine, &[0x10]), vec![100, 300]);
        assert_eq!(
            engine_ids(&services.engine, &tracker_prefix),
            vec![100, 300]
        );
    }

    #[test]
    fn test_oplog_visibility_requires_all_earlier_commits() {
        let services = Services::new();
        let store = services.open(oplog_options(vec![0x10]));

        // A starts first but commits last.
        let txn_a = store.begin();
        store
            .insert_oplog(&txn_a, RecordId::new(100), b"first")
            .unwrap();

        let txn_b = store.begin();
        store
            .insert_oplog(&txn_b, RecordId::new(101), b"second")
            .unwrap();
        txn_b.commit().unwrap();

        // Both entries hidden: the ceiling is the uncommitted id 100.
        assert!(visible_ids(&store).is_empty());

        txn_a.commit().unwrap();
        wait_all_visible(&store);

        assert_eq!(visible_ids(&store), vec![100, 101]);
    }

    #[test]
    fn test_rollback_unblocks_oplog_readers() {
        let services = Services::new();
        let store = services.open(oplog_options(vec![0x10]));

        let txn = store.begin();
        store.insert_oplog(&txn, RecordId::new(100), b"a").unwrap();
        txn.commit().unwrap();
        wait_all_visible(&store);

        let pending = store.begin();
        store
            .insert_oplog(&pending, RecordId::new(200), b"b")
            .unwrap();

        let committed = store.begin();
        store
            .insert_oplog(&committed, RecordId::new(300), b"c")
            .unwrap();
        committed.commit().unwrap();

        // 300 is committed but gapped behind the pending 200.
        assert_eq!(visible_ids(&store), vec![100]);

        pending.rollback();
        wait_all_visible(&store);
        assert_eq!(visible_ids(&store), vec![100, 300]);
    }

    #[test]
    fn test_wait_for_all_earlier_oplog_writes_blocks_until_journal() {
        let services = Services::new();
        let store = Arc::new(services.open(oplog_options(vec![0x10])));

        let txn_a = store.begin();
        store
            .insert_oplog(&txn_a, RecordId::new(100), b"first")
            .unwrap();

        let txn_b = store.begin();
        store
            .insert_oplog(&txn_b, RecordId::new(101), b"second")
            .unwrap();
        txn_b.commit().unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        let waiter_store = Arc::clone(&store);
        let waiter = std::thread::spawn(move || {
            let txn = waiter_store.begin();
            waiter_store
                .wait_for_all_earlier_oplog_writes_to_be_visible(&txn)
                .unwrap();
            done_tx.send(()).unwrap();
        });

        // Still blocked: 100 is uncommitted.
        assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());

        txn_a.commit().unwrap();
        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("waiter should unblock after the journal round-trip");
        waiter.join().unwrap();
    }

    #[test]
    fn test_visibility_wait_is_interruptible() {
        let services = Services::new();
        let store = Arc::new(services.open(oplog_options(vec![0x10])));

        let pending = store.begin();
        store
            .insert_oplog(&pending, RecordId::new(100), b"stuck")
            .unwrap();

        let reader = Arc::new(store.begin());
        let interrupted = Arc::new(AtomicBool::new(false));

        let thread_store = Arc::clone(&store);
        let thread_reader = Arc::clone(&reader);
        let thread_flag = Arc::clone(&interrupted);
        let waiter = std::thread::spawn(move || {
            let result =
                thread_store.wait_for_all_earlier_oplog_writes_to_be_visible(&thread_reader);
            thread_flag.store(
                matches!(result, Err(StoreError::Interrupted)),
                Ordering::SeqCst,
            );
        });

        std::thread::sleep(Duration::from_millis(50));
        reader.interrupt();
        waiter.join().unwrap();
        assert!(interrupted.load(Ordering::SeqCst));
        pending.rollback();
    }

    #[test]
    fn test_reverse_oplog_cursor_starts_below_in_flight_ids() {
        let services = Services::new();
        let store = services.open(oplog_options(vec![0x10]));

        let txn = store.begin();
        store.insert_oplog(&txn, RecordId::new(100), b"a").unwrap();
        txn.commit().unwrap();
        wait_all_visible(&store);

        let pending = store.begin();
        store
            .insert_oplog(&pending, RecordId::new(200), b"b")
            .unwrap();

        let committed = store.begin();
        store
            .insert_oplog(&committed, RecordId::new(300), b"c")
            .unwrap();
        committed.commit().unwrap();

        // 300 is committed but sits above the in-flight 200; a reverse
        // scan starts at the ceiling, not the raw end of the prefix.
        {
            let reader = store.begin();
            let mut cursor = store.get_cursor(&reader, false).unwrap();
            assert_eq!(cursor.next().unwrap().unwrap().id, RecordId::new(100));
            assert!(cursor.next().unwrap().is_none());
        }

        pending.rollback();
        wait_all_visible(&store);

        let reader = store.begin();
        let mut cursor = store.get_cursor(&reader, false).unwrap();
        assert_eq!(cursor.next().unwrap().unwrap().id, RecordId::new(300));
        assert_eq!(cursor.next().unwrap().unwrap().id, RecordId::new(100));
        assert!(cursor.next().unwrap().is_none());
    }

    #[test]
    fn test_oplog_rejects_prefix_without_successor() {
        let services = Services::new();
        let result = RecordStore::open(
            oplog_options(vec![0xff]),
            Arc::clone(&services.engine),
            Arc::clone(&services.durability),
            Arc::clone(&services.compaction),
            Arc::clone(&services.conflicts),
            None,
        );
        assert!(matches!(result, Err(StoreError::BadValue(_))));
    }

    #[test]
    fn test_oplog_cursor_refuses_stale_snapshot() {
        let services = Services::new();
        let store = services.open(oplog_options(vec![0x10]));

        let txn = store.begin();
        txn.snapshot();
        assert!(matches!(
            store.get_cursor(&txn, true),
            Err(StoreError::WriteConflict)
        ));

        // Holding the collection exclusively makes it legal again.
        txn.set_exclusive(true);
        assert!(store.get_cursor(&txn, true).is_ok());
    }

    #[test]
    fn test_oplog_entry_at_or_before() {
        let services = Services::new();
        let store = services.open(oplog_options(vec![0x10]));

        let txn = store.begin();
        for id in [100, 200, 300] {
            store.insert_oplog(&txn, RecordId::new(id), b"e").unwrap();
        }
        txn.commit().unwrap();
        wait_all_visible(&store);

        let txn = store.begin();
        let lookup = |target: i64| {
            store
                .oplog_entry_at_or_before(&txn, RecordId::new(target))
                .unwrap()
                .map(|id| id.repr())
        };
        assert_eq!(lookup(250), Some(200));
        assert_eq!(lookup(300), Some(300));
        assert_eq!(lookup(400), Some(300));
        assert_eq!(lookup(99), None);

        // Not an oplog: no answer.
        let plain = services.open(RecordStoreOptions::plain("app.x", "x", vec![0x30]));
        let plain_txn = plain.begin();
        assert_eq!(
            plain
                .oplog_entry_at_or_before(&plain_txn, RecordId::new(100))
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_oplog_eviction_walks_tracker() {
        let services = Services::new();
        let mut options = oplog_options(vec![0x10]);
        options.capped_max_size = 10;
        let store = services.open(options);
        let tracker_prefix = next_prefix(&[0x10]);

        for id in 1..=10 {
            let txn = store.begin();
            store.insert_oplog(&txn, RecordId::new(id), b"x").unwrap();
            txn.commit().unwrap();
        }
        wait_all_visible(&store);

        // The oplog trigger reads only the committed totals, so the insert
        // that crosses the cap does not trim yet.
        let txn = store.begin();
        store.insert_oplog(&txn, RecordId::new(11), b"yyy").unwrap();
        txn.commit().unwrap();
        wait_all_visible(&store);
        let txn = store.begin();
        assert_eq!(store.data_size(&txn), 13);

        let txn = store.begin();
        store.insert_oplog(&txn, RecordId::new(12), b"x").unwrap();
        txn.commit().unwrap();
        wait_all_visible(&store);

        let txn = store.begin();
        assert_eq!(store.data_size(&txn), 10);
        assert_eq!(
            engine_ids(&services.engine, &[0x10]),
            (5..=12).collect::<Vec<_>>()
        );
        assert_eq!(
            engine_ids(&services.engine, &tracker_prefix),
            (5..=12).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_oplog_truncate_after_allows_id_reuse() {
        let services = Services::new();
        let store = services.open(oplog_options(vec![0x10]));

        let txn = store.begin();
        for id in [100, 200, 300] {
            store.insert_oplog(&txn, RecordId::new(id), b"e").unwrap();
        }
        txn.commit().unwrap();
        wait_all_visible(&store);

        let txn = store.begin();
        txn.set_exclusive(true);
        let removed = store
            .capped_truncate_after(&txn, RecordId::new(100), false)
            .unwrap();
        assert_eq!(removed, 2);
        txn.commit().unwrap();

        // The highest-seen id was rewound, so 150 is in order again.
        let txn = store.begin();
        store.insert_oplog(&txn, RecordId::new(150), b"f").unwrap();
        txn.commit().unwrap();
        wait_all_visible(&store);
        assert_eq!(visible_ids(&store), vec![100, 150]);
    }
}

#[cfg(test)]
mod concurrency_tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::{Arc, Mutex};

    use super::support::{visible_ids, Services};
    use crate::store::RecordStoreOptions;
    use shale_common::RecordId;

    #[test]
    fn test_concurrent_inserts_never_reuse_ids() {
        let services = Services::new();
        let store = Arc::new(services.open(RecordStoreOptions::plain(
            "app.conc",
            "conc",
            b"N".to_vec(),
        )));

        let all_ids = Mutex::new(BTreeSet::new());
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..50 {
                        let txn = store.begin();
                        let id = store.insert(&txn, b"payload").unwrap();
                        txn.commit().unwrap();
                        assert!(all_ids.lock().unwrap().insert(id.repr()));
                    }
                });
            }
        });

        let ids = all_ids.into_inner().unwrap();
        assert_eq!(ids.len(), 200);
        assert_eq!(*ids.iter().next().unwrap(), 1);
        assert_eq!(*ids.iter().next_back().unwrap(), 200);

        let txn = store.begin();
        assert_eq!(store.num_records(&txn), 200);
    }

    #[test]
    fn test_concurrent_capped_inserts_eventually_bounded() {
        let services = Services::new();
        let store = Arc::new(services.open(RecordStoreOptions::capped(
            "app.cbound",
            "cbound",
            b"Q".to_vec(),
            100,
            -1,
        )));

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..30 {
                        let txn = store.begin();
                        store.insert(&txn, &[7u8; 10]).unwrap();
                        txn.commit().unwrap();
                    }
                });
            }
        });

        // Conflicted eviction passes are swallowed; drain to quiescence.
        loop {
            let txn = store.begin();
            if store.background_delete_excess(&txn).unwrap() == 0 {
                break;
            }
        }

        let txn = store.begin();
        assert!(store.data_size(&txn) <= 100);
        assert_eq!(visible_ids(&store), (111..=120).collect::<Vec<_>>());
    }

    #[test]
    fn test_oplog_interleaved_commits_keep_order() {
        let services = Services::new();
        let store = Arc::new(services.open(RecordStoreOptions {
            ns: "local.oplog.rs".into(),
            ident: "oplogc".into(),
            prefix: vec![0x40],
            capped: true,
            capped_max_size: 1 << 20,
            capped_max_docs: -1,
            background_deleter: false,
        }));

        // Id assignment must be serialized (the oplog contract); commits
        // race freely afterwards, exercising the journal path.
        let next_ts = AtomicI64::new(0);
        let insert_lock = Mutex::new(());
        std::thread::scope(|scope| {
            for _ in 0..2 {
                scope.spawn(|| {
                    for _ in 0..50 {
                        let txn = store.begin();
                        {
                            let _serialized = insert_lock.lock().unwrap();
                            let ts = next_ts.fetch_add(1, Ordering::SeqCst) + 1;
                            store
                                .insert_oplog(&txn, RecordId::new(ts), b"entry")
                                .unwrap();
                        }
                        txn.commit().unwrap();
                    }
                });
            }
        });

        let reader = store.begin();
        store
            .wait_for_all_earlier_oplog_writes_to_be_visible(&reader)
            .unwrap();
        drop(reader);

        assert_eq!(visible_ids(&store), (1..=100).collect::<Vec<_>>());
    }
}

#[cfg(test)]
mod cursor_tests {
    use super::support::Services;
    use crate::store::RecordStoreOptions;
    use shale_common::RecordId;

    #[test]
    fn test_forward_and_reverse_scans() {
        let services = Services::new();
        let store = services.open(RecordStoreOptions::plain("app.scan", "scan", b"S".to_vec()));

        let txn = store.begin();
        for payload in [&b"a"[..], b"b", b"c"] {
            store.insert(&txn, payload).unwrap();
        }
        txn.commit().unwrap();

        let txn = store.begin();
        let mut forward = store.get_cursor(&txn, true).unwrap();
        let mut seen = Vec::new();
        while let Some(record) = forward.next().unwrap() {
            seen.push((record.id.repr(), record.data));
        }
        assert_eq!(
            seen,
            vec![
                (1, b"a".to_vec()),
                (2, b"b".to_vec()),
                (3, b"c".to_vec())
            ]
        );

        let mut reverse = store.get_cursor(&txn, false).unwrap();
        let mut seen = Vec::new();
        while let Some(record) = reverse.next().unwrap() {
            seen.push(record.id.repr());
        }
        assert_eq!(seen, vec![3, 2, 1]);
    }

    #[test]
    fn test_seek_exact() {
        let services = Services::new();
        let store = services.open(RecordStoreOptions::plain("app.seek", "seek", b"K".to_vec()));

        let txn = store.begin();
        for payload in [&b"a"[..], b"b", b"c"] {
            store.insert(&txn, payload).unwrap();
        }
        txn.commit().unwrap();

        let txn = store.begin();
        let mut cursor = store.get_cursor(&txn, true).unwrap();
        let record = cursor.seek_exact(RecordId::new(2)).unwrap().unwrap();
        assert_eq!(record.data, b"b".to_vec());
        // The cursor continues from the seek point.
        assert_eq!(cursor.next().unwrap().unwrap().id, RecordId::new(3));

        assert!(cursor.seek_exact(RecordId::new(99)).unwrap().is_none());
        assert!(cursor.next().unwrap().is_none());
    }

    #[test]
    fn test_restore_skips_deleted_record_on_plain_store() {
        let services = Services::new();
        let store = services.open(RecordStoreOptions::plain("app.rst", "rst", b"U".to_vec()));

        let txn = store.begin();
        for payload in [&b"a"[..], b"b", b"c"] {
            store.insert(&txn, payload).unwrap();
        }
        txn.commit().unwrap();

        let reader = store.begin();
        let mut cursor = store.get_cursor(&reader, true).unwrap();
        assert_eq!(cursor.next().unwrap().unwrap().id, RecordId::new(1));
        cursor.save();

        let writer = store.begin();
        store.delete_record(&writer, RecordId::new(1)).unwrap();
        writer.commit().unwrap();

        reader.renew_snapshot();
        // Non-capped: the cursor survives and lands on the successor.
        assert!(cursor.restore());
        assert_eq!(cursor.next().unwrap().unwrap().id, RecordId::new(2));
    }

    #[test]
    fn test_restore_same_snapshot_keeps_position() {
        let services = Services::new();
        let store = services.open(RecordStoreOptions::plain("app.pos", "pos", b"O".to_vec()));

        let txn = store.begin();
        for payload in [&b"a"[..], b"b", b"c"] {
            store.insert(&txn, payload).unwrap();
        }
        txn.commit().unwrap();

        let reader = store.begin();
        let mut cursor = store.get_cursor(&reader, true).unwrap();
        assert_eq!(cursor.next().unwrap().unwrap().id, RecordId::new(1));
        cursor.save();
        assert!(cursor.restore());
        assert_eq!(cursor.next().unwrap().unwrap().id, RecordId::new(2));
    }

    #[test]
    fn test_save_unpositioned_reports_eof() {
        let services = Services::new();
        let store = services.open(RecordStoreOptions::plain("app.unp", "unp", b"Y".to_vec()));

        let txn = store.begin();
        store.insert(&txn, b"a").unwrap();
        txn.commit().unwrap();

        let reader = store.begin();
        let mut cursor = store.get_cursor(&reader, true).unwrap();
        cursor.save_unpositioned();
        assert!(cursor.restore());
        assert!(cursor.next().unwrap().is_none());
    }
}
