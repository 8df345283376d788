use super::{bigint_row, commit_rows, executor, pk_table, read_all};
use crate::{row::RowKind, snapshot::CommitKind};

#[test]
fn dedup_pk_write_delete_compact() {
    let dir = tempfile::tempdir().unwrap();
    let table = pk_table(dir.path(), &[]);
    let mut write = table.new_write("test-user", executor()).unwrap();

    commit_rows(
        &table,
        &mut write,
        1,
        vec![
            (RowKind::Insert, bigint_row(&[1, 10])),
            (RowKind::Insert, bigint_row(&[1, 11])),
            (RowKind::Insert, bigint_row(&[2, 20])),
        ],
    );
    assert_eq!(read_all(&table), vec![bigint_row(&[1, 11]), bigint_row(&[2, 20])]);

    commit_rows(
        &table,
        &mut write,
        2,
        vec![(RowKind::Delete, bigint_row(&[1, 11]))],
    );
    assert_eq!(read_all(&table), vec![bigint_row(&[2, 20])]);

    // a full compaction physically drops the deleted key
    write.compact(true).unwrap();
    let committable = write.prepare_commit(true, 3).unwrap();
    table.new_commit("test-user").commit(&committable).unwrap();
    write.close().unwrap();

    let manager = table.snapshot_manager();
    let latest = manager.latest_snapshot().unwrap().unwrap();
    assert_eq!(latest.commit_kind, CommitKind::Compact);
    assert_eq!(read_all(&table), vec![bigint_row(&[2, 20])]);

    // everything now lives in one terminal-level run
    let plan = table.new_scan().plan().unwrap();
    let max_level = table.options().num_levels - 1;
    assert!(plan.files.iter().all(|e| e.file.level == max_level));
    assert_eq!(plan.files.len(), 1);
}

#[test]
fn restart_resumes_sequence_numbers() {
    let dir = tempfile::tempdir().unwrap();
    let table = pk_table(dir.path(), &[]);

    let mut write = table.new_write("test-user", executor()).unwrap();
    commit_rows(
        &table,
        &mut write,
        1,
        vec![(RowKind::Insert, bigint_row(&[7, 70]))],
    );
    write.close().unwrap();

    // a fresh writer restores levels from the snapshot and writes with
    // higher sequence numbers, so the new value wins the merge
    let mut restarted = table.new_write("test-user", executor()).unwrap();
    commit_rows(
        &table,
        &mut restarted,
        2,
        vec![(RowKind::Insert, bigint_row(&[7, 71]))],
    );
    restarted.close().unwrap();

    assert_eq!(read_all(&table), vec![bigint_row(&[7, 71])]);

    let plan = table.new_scan().plan().unwrap();
    let max_seq = plan
        .files
        .iter()
        .map(|e| e.file.max_sequence_number)
        .max()
        .unwrap();
    let min_seq = plan
        .files
        .iter()
        .map(|e| e.file.min_sequence_number)
        .min()
        .unwrap();
    assert!(max_seq > min_seq, "restored writer must not reuse sequences");
}
