use super::{bigint_row, commit_rows, executor, pk_table};
use crate::{
    io::KeyValue,
    row::RowKind,
    scan::ScanKind,
    table::FileStoreTable,
};

fn read_changelog(table: &FileStoreTable, snapshot_id: i64) -> Vec<KeyValue> {
    let plan = table
        .new_scan()
        .with_kind(ScanKind::Changelog)
        .with_snapshot(snapshot_id)
        .plan()
        .unwrap();
    let mut records = Vec::new();
    for entry in plan.files {
        let reader = table
            .context()
            .reader_factory(&entry.partition, entry.bucket)
            .create_reader(&entry.file)
            .unwrap();
        for kv in reader {
            records.push(kv.unwrap());
        }
    }
    records
}

#[test]
fn input_producer_preserves_write_order() {
    let dir = tempfile::tempdir().unwrap();
    let table = pk_table(dir.path(), &[("changelog-producer", "input")]);
    let mut write = table.new_write("test-user", executor()).unwrap();

    // deliberately out of key order; the changelog must keep write order
    let ingested = vec![
        (RowKind::Insert, bigint_row(&[5, 50])),
        (RowKind::Insert, bigint_row(&[1, 10])),
        (RowKind::UpdateAfter, bigint_row(&[5, 51])),
        (RowKind::Delete, bigint_row(&[1, 10])),
    ];
    commit_rows(&table, &mut write, 1, ingested.clone());
    write.close().unwrap();

    let changelog = read_changelog(&table, 1);
    let observed: Vec<(RowKind, crate::row::Row)> = changelog
        .into_iter()
        .map(|kv| (kv.kind, kv.value))
        .collect();
    assert_eq!(
        observed,
        ingested
            .into_iter()
            .map(|(kind, row)| (kind, row))
            .collect::<Vec<_>>()
    );

    let snapshot = table.snapshot_manager().snapshot(1).unwrap();
    assert_eq!(snapshot.changelog_record_count, 4);
    assert!(snapshot.changelog_manifest_list.is_some());
}

#[test]
fn lookup_producer_emits_updates_against_prior_state() {
    let dir = tempfile::tempdir().unwrap();
    let table = pk_table(dir.path(), &[("changelog-producer", "lookup")]);
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
        vec![
            (RowKind::Insert, bigint_row(&[1, 11])),
            (RowKind::Insert, bigint_row(&[2, 20])),
            (RowKind::Delete, bigint_row(&[3, 30])),
        ],
    );
    write.close().unwrap();

    // first snapshot: no prior state, plain inserts
    let first: Vec<RowKind> = read_changelog(&table, 1).iter().map(|kv| kv.kind).collect();
    assert_eq!(first, vec![RowKind::Insert]);

    let second = read_changelog(&table, 2);
    let kinds_and_values: Vec<(RowKind, i64)> = second
        .iter()
        .map(|kv| {
            let v = match kv.value.get(1) {
                crate::row::Datum::BigInt(v) => *v,
                other => panic!("unexpected value {other:?}"),
            };
            (kv.kind, v)
        })
        .collect();
    // key 1 existed: -U old, +U new; key 2 is new: +I; key 3 never
    // existed: nothing
    assert_eq!(
        kinds_and_values,
        vec![
            (RowKind::UpdateBefore, 10),
            (RowKind::UpdateAfter, 11),
            (RowKind::Insert, 20),
        ]
    );
}

#[test]
fn full_compaction_producer_diffs_terminal_state() {
    let dir = tempfile::tempdir().unwrap();
    let table = pk_table(
        dir.path(),
        &[
            ("changelog-producer", "full-compaction"),
            ("changelog-producer.compaction-interval", "0s"),
        ],
    );
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
    // the forced full compaction commits separately as COMPACT
    let changelog_snapshot = table
        .snapshot_manager()
        .traverse_from_latest_safely(|s| s.changelog_manifest_list.is_some())
        .unwrap()
        .expect("full compaction must produce a changelog");
    let kinds: Vec<RowKind> = read_changelog(&table, changelog_snapshot.id)
        .iter()
        .map(|kv| kv.kind)
        .collect();
    assert_eq!(kinds, vec![RowKind::Insert, RowKind::Insert]);

    commit_rows(
        &table,
        &mut write,
        2,
        vec![
            (RowKind::UpdateAfter, bigint_row(&[1, 12])),
            (RowKind::Delete, bigint_row(&[2, 20])),
        ],
    );
    write.close().unwrap();

    let latest_changelog = table
        .snapshot_manager()
        .traverse_from_latest_safely(|s| s.changelog_manifest_list.is_some())
        .unwrap()
        .unwrap();
    let observed: Vec<(RowKind, i64)> = read_changelog(&table, latest_changelog.id)
        .iter()
        .map(|kv| {
            let v = match kv.value.get(1) {
                crate::row::Datum::BigInt(v) => *v,
                other => panic!("unexpected value {other:?}"),
            };
            (kv.kind, v)
        })
        .collect();
    assert_eq!(
        observed,
        vec![
            (RowKind::UpdateBefore, 10),
            (RowKind::UpdateAfter, 12),
            (RowKind::Delete, 20),
        ]
    );
}
