//! # comprehensive storage tests
//!
//! why: verify all storage scenarios work correctly
//! relations: tests raft-storage crate
//! what: persistence, crash recovery, snapshots, membership, kv engine, edge cases

use raft_core::{ClusterConfig, EntryPayload, LogEntry, RequestId};
use raft_storage::{
    FileStorage, InMemoryStorage, KvCommand, KvResult, KvStateMachine, Snapshot, SnapshotMeta,
    StateMachine, Storage,
};
use std::fs;
use tempfile::tempdir;

fn cmd(term: u64, index: u64, data: &[u8]) -> LogEntry {
    LogEntry::command(term, index, RequestId { node: 1, seq: index }, data.to_vec())
}

fn data_of(entry: &LogEntry) -> &[u8] {
    match &entry.payload {
        EntryPayload::Command { data, .. } => data,
        other => panic!("expected command entry, got {other:?}"),
    }
}

fn three_node_config() -> ClusterConfig {
    ClusterConfig::from_members([
        (1, "10.0.0.1:7000".to_string()),
        (2, "10.0.0.2:7000".to_string()),
        (3, "10.0.0.3:7000".to_string()),
    ])
}

fn snapshot_at(index: u64, term: u64, data: &[u8]) -> Snapshot {
    Snapshot {
        meta: SnapshotMeta {
            last_included_index: index,
            last_included_term: term,
            config: three_node_config(),
            applied_requests: Default::default(),
        },
        data: data.to_vec(),
    }
}

// =============================================================================
// SECTION 1: IN-MEMORY STORAGE TESTS
// =============================================================================

mod in_memory_basic {
    use super::*;

    #[test]
    fn new_storage_has_default_values() {
        let storage = InMemoryStorage::new();
        let (term, voted_for) = storage.load_term_and_vote().unwrap();

        assert_eq!(term, 0);
        assert_eq!(voted_for, None);
        assert!(storage.load_config().unwrap().is_none());
        assert!(storage.load_snapshot().unwrap().is_none());
    }

    #[test]
    fn save_voted_for_none() {
        let mut storage = InMemoryStorage::new();

        storage.save_term_and_vote(10, None).unwrap();
        let (term, voted_for) = storage.load_term_and_vote().unwrap();

        assert_eq!(term, 10);
        assert_eq!(voted_for, None);
    }

    #[test]
    fn overwrite_term_and_vote() {
        let mut storage = InMemoryStorage::new();

        storage.save_term_and_vote(1, Some(1)).unwrap();
        storage.save_term_and_vote(5, Some(3)).unwrap();

        let (term, voted_for) = storage.load_term_and_vote().unwrap();
        assert_eq!(term, 5);
        assert_eq!(voted_for, Some(3));
    }
}

mod in_memory_log {
    use super::*;

    #[test]
    fn append_multiple_entries() {
        let mut storage = InMemoryStorage::new();
        let entries = vec![cmd(1, 1, b"cmd1"), cmd(1, 2, b"cmd2"), cmd(2, 3, b"cmd3")];

        storage.append_entries(&entries).unwrap();
        let log = storage.load_log().unwrap();

        assert_eq!(log.len(), 3);
        assert_eq!(data_of(&log[0]), b"cmd1");
        assert_eq!(log[2].term, 2);
    }

    #[test]
    fn append_in_batches() {
        let mut storage = InMemoryStorage::new();

        storage.append_entries(&[cmd(1, 1, b"a")]).unwrap();
        storage.append_entries(&[cmd(1, 2, b"b")]).unwrap();
        storage.append_entries(&[cmd(1, 3, b"c")]).unwrap();

        let log = storage.load_log().unwrap();
        assert_eq!(log.iter().map(|e| e.index).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn noop_and_config_entries_persist() {
        let mut storage = InMemoryStorage::new();
        let change = raft_core::ConfigChange::add(4, "10.0.0.4:7000");
        storage
            .append_entries(&[
                LogEntry::new(1, 1, EntryPayload::Noop),
                LogEntry::new(
                    1,
                    2,
                    EntryPayload::ConfigChange { request_id: RequestId { node: 1, seq: 9 }, change },
                ),
            ])
            .unwrap();

        let log = storage.load_log().unwrap();
        assert_eq!(log[0].payload, EntryPayload::Noop);
        assert!(log[1].is_config_change());
    }

    #[test]
    fn truncate_log_from_index() {
        let mut storage = InMemoryStorage::new();
        storage
            .append_entries(&[cmd(1, 1, b"a"), cmd(1, 2, b"b"), cmd(1, 3, b"c"), cmd(1, 4, b"d")])
            .unwrap();

        storage.truncate_log_from(3).unwrap();

        let log = storage.load_log().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].index, 2);
    }

    #[test]
    fn truncate_empty_log() {
        let mut storage = InMemoryStorage::new();

        storage.truncate_log_from(5).unwrap();

        assert!(storage.load_log().unwrap().is_empty());
    }

    #[test]
    fn purge_drops_prefix() {
        let mut storage = InMemoryStorage::new();
        storage
            .append_entries(&[cmd(1, 1, b"a"), cmd(1, 2, b"b"), cmd(1, 3, b"c")])
            .unwrap();

        storage.purge_log_through(2).unwrap();

        let log = storage.load_log().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].index, 3);
    }

    #[test]
    fn failed_write_leaves_previous_state() {
        let mut storage = InMemoryStorage::new();
        storage.append_entries(&[cmd(1, 1, b"a")]).unwrap();
        storage.fail_writes(true);

        assert!(storage.append_entries(&[cmd(1, 2, b"b")]).is_err());
        assert!(storage.truncate_log_from(1).is_err());
        assert_eq!(storage.load_log().unwrap().len(), 1);

        storage.fail_writes(false);
        storage.append_entries(&[cmd(1, 2, b"b")]).unwrap();
        assert_eq!(storage.load_log().unwrap().len(), 2);
    }
}

// =============================================================================
// SECTION 2: FILE STORAGE TESTS
// =============================================================================

mod file_storage_basic {
    use super::*;

    #[test]
    fn create_storage_creates_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raft_data");

        let storage = FileStorage::new(&path).unwrap();

        assert!(path.exists());
        assert_eq!(storage.dir(), path.as_path());
    }

    #[test]
    fn new_storage_has_default_values() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();

        assert_eq!(storage.load_term_and_vote().unwrap(), (0, None));
        assert!(storage.load_log().unwrap().is_empty());
        assert!(storage.load_config().unwrap().is_none());
    }

    #[test]
    fn save_creates_meta_file() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.save_term_and_vote(5, Some(2)).unwrap();

        assert!(dir.path().join("meta.json").exists());
    }
}

mod file_storage_log {
    use super::*;

    #[test]
    fn append_and_load_entries() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage
            .append_entries(&[cmd(1, 1, b"SET key1 value1"), cmd(1, 2, b"SET key2 value2")])
            .unwrap();

        let log = storage.load_log().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(data_of(&log[0]), b"SET key1 value1");
        assert!(dir.path().join("log.json").exists());
    }

    #[test]
    fn truncate_log() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage
            .append_entries(&[cmd(1, 1, &[1]), cmd(2, 2, &[2]), cmd(3, 3, &[3])])
            .unwrap();

        storage.truncate_log_from(2).unwrap();

        let log = storage.load_log().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].index, 1);
    }

    #[test]
    fn truncate_then_append_replaces_tail() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage
            .append_entries(&[cmd(1, 1, b"a"), cmd(1, 2, b"stale"), cmd(1, 3, b"stale")])
            .unwrap();

        storage.truncate_log_from(2).unwrap();
        storage.append_entries(&[cmd(2, 2, b"fresh")]).unwrap();

        let log = storage.load_log().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].term, 2);
        assert_eq!(data_of(&log[1]), b"fresh");
    }
}

// =============================================================================
// SECTION 3: CRASH RECOVERY / PERSISTENCE TESTS
// =============================================================================

mod crash_recovery {
    use super::*;

    #[test]
    fn log_survives_restart() {
        let dir = tempdir().unwrap();

        // first "session"
        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage.append_entries(&[cmd(1, 1, b"cmd1"), cmd(1, 2, b"cmd2")]).unwrap();
        }

        // "restart"
        {
            let storage = FileStorage::new(dir.path()).unwrap();
            let log = storage.load_log().unwrap();

            assert_eq!(log.len(), 2);
            assert_eq!(data_of(&log[1]), b"cmd2");
            assert_eq!(log[1].request_id(), Some(RequestId { node: 1, seq: 2 }));
        }
    }

    #[test]
    fn multiple_restarts_preserve_state() {
        let dir = tempdir().unwrap();

        // session 1
        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage.save_term_and_vote(1, Some(1)).unwrap();
            storage.append_entries(&[cmd(1, 1, b"a")]).unwrap();
        }

        // session 2
        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage.save_term_and_vote(2, Some(2)).unwrap();
            storage.append_entries(&[cmd(2, 2, b"b")]).unwrap();
            storage.save_config(2, &three_node_config()).unwrap();
        }

        // session 3 - verify
        {
            let storage = FileStorage::new(dir.path()).unwrap();

            assert_eq!(storage.load_term_and_vote().unwrap(), (2, Some(2)));
            assert_eq!(storage.load_log().unwrap().len(), 2);
            assert_eq!(storage.load_config().unwrap(), Some((2, three_node_config())));
        }
    }

    #[test]
    fn snapshot_and_purged_log_survive_restart() {
        let dir = tempdir().unwrap();

        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage
                .append_entries(&[cmd(1, 1, b"a"), cmd(1, 2, b"b"), cmd(2, 3, b"c")])
                .unwrap();
            storage.save_snapshot(&snapshot_at(2, 1, b"image")).unwrap();
            storage.purge_log_through(2).unwrap();
        }

        {
            let storage = FileStorage::new(dir.path()).unwrap();
            let snapshot = storage.load_snapshot().unwrap().unwrap();
            let log = storage.load_log().unwrap();

            assert_eq!(snapshot.meta.last_included_index, 2);
            assert_eq!(snapshot.data, b"image".to_vec());
            assert_eq!(log.iter().map(|e| e.index).collect::<Vec<_>>(), vec![3]);
        }
    }
}

// =============================================================================
// SECTION 4: ATOMIC WRITE TESTS
// =============================================================================

mod atomic_writes {
    use super::*;

    #[test]
    fn state_files_are_valid_json() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.save_term_and_vote(5, Some(2)).unwrap();
        storage.append_entries(&[cmd(1, 1, b"cmd")]).unwrap();
        storage.save_config(1, &three_node_config()).unwrap();

        for name in ["meta.json", "log.json", "config.json"] {
            let contents = fs::read_to_string(dir.path().join(name)).unwrap();
            let _: serde_json::Value = serde_json::from_str(&contents).expect("valid JSON");
        }
    }

    #[test]
    fn no_temp_files_remain() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.save_term_and_vote(5, Some(2)).unwrap();
        storage.append_entries(&[cmd(1, 1, b"cmd")]).unwrap();
        storage.save_snapshot(&snapshot_at(1, 1, b"img")).unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn stale_temp_file_does_not_affect_load() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.save_term_and_vote(4, Some(1)).unwrap();

        // crash between write and rename leaves a half-written temp file behind
        fs::write(dir.path().join("meta.json.tmp"), "{ \"term\": 9").unwrap();

        assert_eq!(storage.load_term_and_vote().unwrap(), (4, Some(1)));
    }
}

// =============================================================================
// SECTION 5: EDGE CASES
// =============================================================================

mod edge_cases {
    use super::*;

    #[test]
    fn large_log_entry() {
        let mut storage = InMemoryStorage::new();

        // 1MB command
        let large_command = vec![0u8; 1024 * 1024];
        storage.append_entries(&[cmd(1, 1, &large_command)]).unwrap();

        let log = storage.load_log().unwrap();
        assert_eq!(data_of(&log[0]).len(), 1024 * 1024);
    }

    #[test]
    fn many_log_entries() {
        let mut storage = InMemoryStorage::new();
        let entries: Vec<LogEntry> = (1..=1000)
            .map(|i| cmd(1, i, format!("cmd{}", i).as_bytes()))
            .collect();

        storage.append_entries(&entries).unwrap();

        assert_eq!(storage.load_log().unwrap().len(), 1000);
    }

    #[test]
    fn binary_command_data_survives_file_round_trip() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        let binary: Vec<u8> = (0..=255).collect();

        storage.append_entries(&[cmd(1, 1, &binary)]).unwrap();

        let reopened = FileStorage::new(dir.path()).unwrap();
        assert_eq!(data_of(&reopened.load_log().unwrap()[0]), binary.as_slice());
    }

    #[test]
    fn max_term_value() {
        let mut storage = InMemoryStorage::new();

        storage.save_term_and_vote(u64::MAX, Some(u64::MAX)).unwrap();

        assert_eq!(storage.load_term_and_vote().unwrap(), (u64::MAX, Some(u64::MAX)));
    }

    #[test]
    fn later_snapshot_replaces_earlier() {
        let mut storage = InMemoryStorage::new();

        storage.save_snapshot(&snapshot_at(10, 1, b"old")).unwrap();
        storage.save_snapshot(&snapshot_at(20, 2, b"new")).unwrap();

        let snapshot = storage.load_snapshot().unwrap().unwrap();
        assert_eq!(snapshot.meta.last_included_index, 20);
        assert_eq!(snapshot.data, b"new".to_vec());
    }
}

// =============================================================================
// SECTION 6: KV STATE MACHINE
// =============================================================================

mod kv_state_machine {
    use super::*;

    fn apply(sm: &mut KvStateMachine, index: u64, command: KvCommand) -> KvResult {
        let out = sm.apply(index, &command.encode().unwrap()).unwrap();
        KvResult::decode(&out).unwrap()
    }

    #[test]
    fn batch_applies_in_order() {
        let mut sm = KvStateMachine::new();

        apply(&mut sm, 1, KvCommand::new().put("user/1", "ada").put("user/2", "bob"));
        let result = apply(&mut sm, 2, KvCommand::new().delete("user/2").get("user/1").get("user/2"));

        assert_eq!(result.reads, vec![Some(b"ada".to_vec()), None]);
        assert_eq!(sm.len(), 1);
    }

    #[test]
    fn compare_and_set_succeeds_when_expectation_holds() {
        let mut sm = KvStateMachine::new();
        apply(&mut sm, 1, KvCommand::new().put("lock", "free"));

        apply(
            &mut sm,
            2,
            KvCommand::new().expect("lock", Some(b"free".to_vec())).put("lock", "held"),
        );

        assert_eq!(sm.get(b"lock"), Some(&b"held"[..]));
    }

    #[test]
    fn expect_absent_guards_creation() {
        let mut sm = KvStateMachine::new();
        apply(&mut sm, 1, KvCommand::new().expect("k", None).put("k", "first"));

        let rejected = sm.apply(2, &KvCommand::new().expect("k", None).put("k", "second").encode().unwrap());

        assert!(rejected.is_err());
        assert_eq!(sm.get(b"k"), Some(&b"first"[..]));
    }

    #[test]
    fn snapshot_persists_through_storage() {
        let mut sm = KvStateMachine::new();
        apply(&mut sm, 1, KvCommand::new().put("a", "1").put("b", "2"));

        let mut storage = InMemoryStorage::new();
        storage.save_snapshot(&snapshot_at(1, 1, &sm.snapshot())).unwrap();

        let loaded = storage.load_snapshot().unwrap().unwrap();
        let mut restored = KvStateMachine::new();
        restored.restore(loaded.meta.last_included_index, &loaded.data).unwrap();

        assert_eq!(restored.get(b"b"), Some(&b"2"[..]));
        assert_eq!(restored.applied_index(), 1);
    }

    #[test]
    fn restore_rejects_garbage() {
        let mut sm = KvStateMachine::new();
        assert!(sm.restore(3, b"\x00\x01").is_err());
        assert_eq!(sm.applied_index(), 0);
    }
}

// =============================================================================
// SECTION 7: TRAIT POLYMORPHISM
// =============================================================================

mod trait_polymorphism {
    use super::*;

    fn test_storage_impl<S: Storage>(storage: &mut S) {
        storage.save_term_and_vote(3, Some(1)).unwrap();
        storage.append_entries(&[cmd(3, 1, b"test")]).unwrap();
        storage.save_config(1, &three_node_config()).unwrap();

        let (term, voted_for) = storage.load_term_and_vote().unwrap();
        let log = storage.load_log().unwrap();
        let (config_index, config) = storage.load_config().unwrap().unwrap();

        assert_eq!(term, 3);
        assert_eq!(voted_for, Some(1));
        assert_eq!(log.len(), 1);
        assert_eq!(config_index, 1);
        assert_eq!(config.len(), 3);
    }

    #[test]
    fn in_memory_implements_storage() {
        let mut storage = InMemoryStorage::new();
        test_storage_impl(&mut storage);
    }

    #[test]
    fn file_storage_implements_storage() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        test_storage_impl(&mut storage);
    }

    #[test]
    fn boxed_storage_works() {
        let mut storage: Box<dyn Storage> = Box::new(InMemoryStorage::new());

        storage.save_term_and_vote(8, None).unwrap();

        assert_eq!(storage.load_term_and_vote().unwrap(), (8, None));
    }
}
