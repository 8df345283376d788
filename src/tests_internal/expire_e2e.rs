use std::collections::HashSet;

use super::{bigint_row, commit_rows, executor, pk_table, read_all};
use crate::row::RowKind;

#[test]
fn expire_with_missing_snapshot_from_prior_crash() {
    let dir = tempfile::tempdir().unwrap();
    let table = pk_table(
        dir.path(),
        &[
            ("snapshot.num-retained.min", "2"),
            ("snapshot.num-retained.max", "2"),
        ],
    );
    let mut write = table.new_write("test-user", executor()).unwrap();
    for id in 1..=5 {
        commit_rows(
            &table,
            &mut write,
            id,
            vec![(RowKind::Insert, bigint_row(&[id, id * 10]))],
        );
    }
    write.close().unwrap();

    let manager = table.snapshot_manager();
    assert_eq!(manager.list_ids().unwrap(), vec![1, 2, 3, 4, 5]);

    // a previous expiration removed 1 and 2, then crashed while
    // removing 3
    std::fs::remove_file(manager.snapshot_path(1)).unwrap();
    std::fs::remove_file(manager.snapshot_path(2)).unwrap();
    std::fs::remove_file(manager.snapshot_path(3)).unwrap();

    table.new_expire().expire().unwrap();

    assert_eq!(manager.list_ids().unwrap(), vec![4, 5]);
    assert_eq!(manager.read_hint(crate::snapshot::EARLIEST), Some(4));
    // the retained state still reads fully
    assert_eq!(read_all(&table).len(), 5);
}

#[test]
fn expire_preserves_retained_snapshot_plans() {
    let dir = tempfile::tempdir().unwrap();
    let table = pk_table(
        dir.path(),
        &[
            ("snapshot.num-retained.min", "2"),
            ("snapshot.num-retained.max", "2"),
            // age everything out immediately
            ("snapshot.time-retained", "0s"),
        ],
    );
    let mut write = table.new_write("test-user", executor()).unwrap();
    for id in 1..=4 {
        commit_rows(
            &table,
            &mut write,
            id,
            vec![(RowKind::Insert, bigint_row(&[id, id]))],
        );
    }
    write.close().unwrap();

    let scan_before = table.new_scan().with_snapshot(3).plan().unwrap();
    let names_before: HashSet<String> = scan_before
        .files
        .iter()
        .map(|e| e.file.file_name.clone())
        .collect();

    table.new_expire().expire().unwrap();

    let manager = table.snapshot_manager();
    assert_eq!(manager.list_ids().unwrap(), vec![3, 4]);

    // the first retained snapshot plans exactly the same files
    let scan_after = table.new_scan().with_snapshot(3).plan().unwrap();
    let names_after: HashSet<String> = scan_after
        .files
        .iter()
        .map(|e| e.file.file_name.clone())
        .collect();
    assert_eq!(names_before, names_after);
    assert_eq!(read_all(&table).len(), 4);
}

#[test]
fn compacted_away_files_are_deleted_with_their_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let table = pk_table(
        dir.path(),
        &[
            ("snapshot.num-retained.min", "1"),
            ("snapshot.num-retained.max", "1"),
            ("snapshot.time-retained", "0s"),
        ],
    );
    let mut write = table.new_write("test-user", executor()).unwrap();
    commit_rows(
        &table,
        &mut write,
        1,
        vec![(RowKind::Insert, bigint_row(&[1, 10]))],
    );
    commit_rows(
        &table,
        &mut write,
        2,
        vec![(RowKind::Insert, bigint_row(&[1, 11]))],
    );
    // rewrite everything into one terminal run, retiring the L0 files
    write.compact(true).unwrap();
    let committable = write.prepare_commit(true, 3).unwrap();
    table.new_commit("test-user").commit(&committable).unwrap();
    write.close().unwrap();

    table.new_expire().expire().unwrap();

    let manager = table.snapshot_manager();
    let ids = manager.list_ids().unwrap();
    assert_eq!(ids.len(), 1);

    // only the compacted output remains on disk
    let bucket_dir = dir.path().join("bucket-0");
    let live = table.new_scan().plan().unwrap();
    let live_names: HashSet<String> =
        live.files.iter().map(|e| e.file.file_name.clone()).collect();
    let on_disk: HashSet<String> = std::fs::read_dir(&bucket_dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(on_disk, live_names);
    assert_eq!(read_all(&table), vec![bigint_row(&[1, 11])]);
}
