use std::collections::HashMap;

use super::{bigint_row, commit_rows, executor, pk_table};
use crate::{
    enumerate::{ContinuousFileSplitEnumerator, EnumeratorResult, SnapshotEnumerator},
    row::RowKind,
};

#[test]
fn enumerator_follows_snapshots_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let table = pk_table(dir.path(), &[("scan.mode", "latest")]);
    let mut enumerator = SnapshotEnumerator::new(&table);

    // empty table: nothing to discover yet
    assert!(matches!(enumerator.enumerate().unwrap(), EnumeratorResult::Empty));

    let mut write = table.new_write("test-user", executor()).unwrap();
    commit_rows(
        &table,
        &mut write,
        1,
        vec![(RowKind::Insert, bigint_row(&[1, 10]))],
    );

    // first tick resolves the start position after the current snapshot
    assert!(matches!(enumerator.enumerate().unwrap(), EnumeratorResult::Empty));

    commit_rows(
        &table,
        &mut write,
        2,
        vec![(RowKind::Insert, bigint_row(&[2, 20]))],
    );
    commit_rows(
        &table,
        &mut write,
        3,
        vec![(RowKind::Insert, bigint_row(&[3, 30]))],
    );
    write.close().unwrap();

    let mut seen_snapshots = Vec::new();
    loop {
        match enumerator.enumerate().unwrap() {
            EnumeratorResult::Plan(splits) => {
                for split in splits {
                    seen_snapshots.push(split.snapshot_id);
                }
            }
            EnumeratorResult::Empty => break,
            EnumeratorResult::Finished => panic!("nothing expired"),
        }
    }
    assert_eq!(seen_snapshots, vec![2, 3]);
}

#[test]
fn enumerator_restarts_after_expired_gap() {
    let dir = tempfile::tempdir().unwrap();
    let table = pk_table(dir.path(), &[("scan.mode", "from-snapshot"), ("scan.snapshot-id", "1")]);
    let mut enumerator = SnapshotEnumerator::new(&table);

    let mut write = table.new_write("test-user", executor()).unwrap();
    for id in 1..=3 {
        commit_rows(
            &table,
            &mut write,
            id,
            vec![(RowKind::Insert, bigint_row(&[id, id]))],
        );
    }
    write.close().unwrap();

    // resolve the start position
    assert!(matches!(enumerator.enumerate().unwrap(), EnumeratorResult::Empty));
    // the consumer falls behind and snapshot 1 expires
    std::fs::remove_file(table.snapshot_manager().snapshot_path(1)).unwrap();
    assert!(matches!(
        enumerator.enumerate().unwrap(),
        EnumeratorResult::Finished
    ));
}

#[test]
fn latest_full_plans_current_state_then_increments() {
    let dir = tempfile::tempdir().unwrap();
    let table = pk_table(dir.path(), &[("scan.mode", "latest-full")]);

    let mut write = table.new_write("test-user", executor()).unwrap();
    commit_rows(
        &table,
        &mut write,
        1,
        vec![
            (RowKind::Insert, bigint_row(&[1, 10])),
            (RowKind::Insert, bigint_row(&[2, 20])),
        ],
    );

    let mut enumerator = SnapshotEnumerator::new(&table);
    let initial = match enumerator.enumerate().unwrap() {
        EnumeratorResult::Plan(splits) => splits,
        other => panic!("expected a full plan, got {other:?}"),
    };
    assert!(!initial.is_empty());
    assert!(initial.iter().all(|s| s.snapshot_id == 1));

    commit_rows(
        &table,
        &mut write,
        2,
        vec![(RowKind::Insert, bigint_row(&[3, 30]))],
    );
    write.close().unwrap();

    let incremental = match enumerator.enumerate().unwrap() {
        EnumeratorResult::Plan(splits) => splits,
        other => panic!("expected an incremental plan, got {other:?}"),
    };
    assert_eq!(incremental.len(), 1);
    assert_eq!(incremental[0].snapshot_id, 2);
    assert_eq!(incremental[0].files.len(), 1);
}

#[test]
fn splits_flow_to_readers_with_bucket_affinity() {
    let dir = tempfile::tempdir().unwrap();
    let table = pk_table(
        dir.path(),
        &[
            ("scan.mode", "from-snapshot"),
            ("scan.snapshot-id", "1"),
            ("bucket", "2"),
        ],
    );

    let mut write = table.new_write("test-user", executor()).unwrap();
    // enough keys that both buckets receive data in both snapshots
    for identifier in 1..=2 {
        let rows = (0..64)
            .map(|k| (RowKind::Insert, bigint_row(&[k, k + identifier * 1000])))
            .collect();
        commit_rows(&table, &mut write, identifier, rows);
    }
    write.close().unwrap();

    let mut enumerator = SnapshotEnumerator::new(&table);
    // resolve the start position
    assert!(matches!(enumerator.enumerate().unwrap(), EnumeratorResult::Empty));

    let mut assigner = ContinuousFileSplitEnumerator::new();
    assigner.register_reader(0);
    assigner.register_reader(1);
    loop {
        match enumerator.enumerate().unwrap() {
            EnumeratorResult::Plan(splits) => assigner.add_splits(splits),
            EnumeratorResult::Empty => break,
            EnumeratorResult::Finished => panic!("nothing expired"),
        }
    }
    assert_eq!(assigner.pending_count(), 4);

    // both readers pull concurrently, one split at a time
    let mut per_reader: HashMap<usize, Vec<(usize, i64)>> = HashMap::new();
    let mut progressed = true;
    while progressed {
        progressed = false;
        for reader in [0, 1] {
            if let Some(split) = assigner.next_split(reader) {
                per_reader
                    .entry(reader)
                    .or_default()
                    .push((split.bucket, split.snapshot_id));
                progressed = true;
            }
        }
    }

    assert_eq!(per_reader.len(), 2);
    for (_, received) in per_reader {
        // one bucket per reader, snapshots strictly in order
        let buckets: Vec<usize> = received.iter().map(|(b, _)| *b).collect();
        assert!(buckets.windows(2).all(|w| w[0] == w[1]));
        let snapshots: Vec<i64> = received.iter().map(|(_, s)| *s).collect();
        assert_eq!(snapshots, vec![1, 2]);
    }
}
