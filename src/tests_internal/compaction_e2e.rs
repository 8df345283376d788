use std::collections::HashSet;

use super::{bigint_row, commit_rows, executor, pk_table, read_all};
use crate::row::RowKind;

/// After any sequence of writes and compactions, a point lookup equals the
/// sequence-ordered merge of every live record of the key.
#[test]
fn compaction_preserves_merge_semantics() {
    let dir = tempfile::tempdir().unwrap();
    let table = pk_table(
        dir.path(),
        &[
            ("num-sorted-run.compaction-trigger", "2"),
            ("num-sorted-run.stop-trigger", "4"),
        ],
    );
    let mut write = table.new_write("test-user", executor()).unwrap();

    // every commit flushes one run; the low trigger keeps compactions
    // flowing between commits
    for round in 0..6i64 {
        let rows = (0..8)
            .map(|k| (RowKind::Insert, bigint_row(&[k, k * 100 + round])))
            .collect();
        commit_rows(&table, &mut write, round + 1, rows);
    }
    write.close().unwrap();

    let expected: Vec<crate::row::Row> = (0..8).map(|k| bigint_row(&[k, k * 100 + 5])).collect();
    assert_eq!(read_all(&table), expected);

    // the table went through at least one COMPACT commit
    let manager = table.snapshot_manager();
    let kinds: Vec<_> = manager
        .list_ids()
        .unwrap()
        .into_iter()
        .map(|id| manager.snapshot(id).unwrap().commit_kind)
        .collect();
    assert!(kinds.contains(&crate::snapshot::CommitKind::Compact));
}

#[test]
fn concurrent_committers_all_land() {
    let dir = tempfile::tempdir().unwrap();
    let table = pk_table(dir.path(), &[]);
    let table_root = dir.path().to_path_buf();

    let mut handles = Vec::new();
    for writer_id in 0..2i64 {
        let root = table_root.clone();
        handles.push(std::thread::spawn(move || {
            let table =
                crate::table::FileStoreTable::open(super::file_io(), &root).unwrap();
            let user = format!("writer-{writer_id}");
            let mut write = table.new_write(user.clone(), executor()).unwrap();
            let commit = table.new_commit(user);
            for round in 0..4i64 {
                let key = writer_id * 100 + round;
                write.write(bigint_row(&[key, round])).unwrap();
                let committable = write.prepare_commit(true, round + 1).unwrap();
                commit.commit(&committable).unwrap();
            }
            write.close().unwrap();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // every commit won exactly one snapshot id (P3), each parses (P1)
    let manager = table.snapshot_manager();
    let ids = manager.list_ids().unwrap();
    assert_eq!(ids, (1..=8).collect::<Vec<i64>>());
    let users: HashSet<String> = ids
        .iter()
        .map(|id| manager.snapshot(*id).unwrap().commit_user)
        .collect();
    assert_eq!(users.len(), 2);

    // all eight keys are visible
    assert_eq!(read_all(&table).len(), 8);
}

#[test]
fn write_only_mode_never_compacts() {
    let dir = tempfile::tempdir().unwrap();
    let table = pk_table(
        dir.path(),
        &[
            ("write-only", "true"),
            ("num-sorted-run.compaction-trigger", "2"),
            ("changelog-producer", "input"),
        ],
    );
    let mut write = table.new_write("test-user", executor()).unwrap();
    for identifier in 1..=4 {
        commit_rows(
            &table,
            &mut write,
            identifier,
            vec![(RowKind::Insert, bigint_row(&[1, identifier]))],
        );
    }
    write.close().unwrap();

    let manager = table.snapshot_manager();
    for id in manager.list_ids().unwrap() {
        let snapshot = manager.snapshot(id).unwrap();
        assert_eq!(snapshot.commit_kind, crate::snapshot::CommitKind::Append);
        // write-only also suppresses changelog emission
        assert!(snapshot.changelog_manifest_list.is_none());
    }
    // all four runs still sit at level 0
    let plan = table.new_scan().plan().unwrap();
    assert_eq!(plan.files.len(), 4);
    assert!(plan.files.iter().all(|e| e.file.level == 0));
    assert_eq!(read_all(&table), vec![bigint_row(&[1, 4])]);
}
