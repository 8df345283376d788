use super::{executor, file_io, options_map};
use crate::{
    commit::MAINTENANCE_COMMIT_IDENTIFIER,
    row::{Datum, Row},
    schema::{column, ColumnDef, TableDefinition},
    snapshot::CommitKind,
    table::{system::read_system_table, FileStoreTable},
    types::DataType,
};

fn partitioned_table(dir: &std::path::Path, extra: &[(&str, &str)]) -> FileStoreTable {
    let mut options = vec![("write-mode", "append-only")];
    options.extend_from_slice(extra);
    FileStoreTable::create(
        file_io(),
        dir,
        TableDefinition {
            columns: vec![
                ColumnDef {
                    nullable: false,
                    ..column("dt", DataType::String)
                },
                column("v", DataType::BigInt),
            ],
            partition_keys: vec!["dt".to_string()],
            options: options_map(&options),
            ..Default::default()
        },
    )
    .unwrap()
}

fn row(dt: &str, v: i64) -> Row {
    Row::new(vec![Datum::String(dt.to_string()), Datum::BigInt(v)])
}

#[test]
fn stale_partitions_are_dropped_by_one_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let table = partitioned_table(
        dir.path(),
        &[
            ("partition.expiration-time", "1d"),
            ("partition.expiration-check-interval", "0s"),
        ],
    );
    let today = chrono::Utc::now().format("%Y-%m-%d").to_string();

    let mut write = table.new_write("test-user", executor()).unwrap();
    write.write(row("2020-01-01", 1)).unwrap();
    write.write(row(&today, 2)).unwrap();
    let committable = write.prepare_commit(true, 1).unwrap();
    table.new_commit("test-user").commit(&committable).unwrap();
    write.close().unwrap();

    let mut expire = table.new_partition_expire("maintenance").unwrap();
    expire
        .expire_at(chrono::Utc::now().naive_utc() + chrono::Duration::seconds(5))
        .unwrap();

    assert_eq!(super::read_all(&table), vec![row(&today, 2)]);

    let latest = table.snapshot_manager().latest_snapshot().unwrap().unwrap();
    assert_eq!(latest.commit_kind, CommitKind::Overwrite);
    // the sentinel keeps maintenance commits out of replay bookkeeping
    assert_eq!(latest.commit_identifier, MAINTENANCE_COMMIT_IDENTIFIER);
    assert_eq!(
        table
            .new_commit("maintenance")
            .filter_committed(vec![1])
            .unwrap(),
        vec![1]
    );
}

#[test]
fn orphan_files_are_collected_after_the_safety_window() {
    let dir = tempfile::tempdir().unwrap();
    let table = partitioned_table(dir.path(), &[]);
    let mut write = table.new_write("test-user", executor()).unwrap();
    write.write(row("2026-08-01", 1)).unwrap();
    let committable = write.prepare_commit(true, 1).unwrap();
    table.new_commit("test-user").commit(&committable).unwrap();
    write.close().unwrap();

    // debris of a failed commit
    let junk_manifest = dir.path().join("manifest").join("manifest-junk");
    std::fs::write(&junk_manifest, b"{}").unwrap();
    let bucket_dir = dir.path().join("dt=2026-08-01").join("bucket-0");
    let junk_data = bucket_dir.join("data-junk.parquet");
    std::fs::write(&junk_data, b"junk").unwrap();

    // a negative safety window puts the cutoff in the future, so the
    // fresh junk is already eligible
    let removed = table.new_orphan_files_clean(-60_000).clean().unwrap();
    assert_eq!(removed, 2);
    assert!(!junk_manifest.exists());
    assert!(!junk_data.exists());

    // live files survive and the table still reads
    assert_eq!(super::read_all(&table), vec![row("2026-08-01", 1)]);
}

#[test]
fn system_tables_expose_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let table = partitioned_table(dir.path(), &[]);
    let mut write = table.new_write("test-user", executor()).unwrap();
    write.write(row("2026-08-01", 1)).unwrap();
    write.write(row("2026-08-02", 2)).unwrap();
    let committable = write.prepare_commit(true, 1).unwrap();
    table.new_commit("test-user").commit(&committable).unwrap();
    write.close().unwrap();

    let (row_type, rows) = read_system_table(&table, "snapshots").unwrap();
    assert_eq!(row_type.field_names()[0], "snapshot_id");
    let snapshots: Vec<Row> = rows.map(|r| r.unwrap()).collect();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].get(0), &Datum::BigInt(1));
    assert_eq!(snapshots[0].get(4), &Datum::String("APPEND".to_string()));

    let (_, rows) = read_system_table(&table, "schemas").unwrap();
    assert_eq!(rows.count(), 1);

    let (_, rows) = read_system_table(&table, "options").unwrap();
    let options: Vec<Row> = rows.map(|r| r.unwrap()).collect();
    assert!(options
        .iter()
        .any(|r| r.get(0) == &Datum::String("write-mode".to_string())));

    let (_, rows) = read_system_table(&table, "files").unwrap();
    let files: Vec<Row> = rows.map(|r| r.unwrap()).collect();
    assert_eq!(files.len(), 2);
    assert!(files
        .iter()
        .any(|r| r.get(0) == &Datum::String("dt=2026-08-01".to_string())));

    let (audit_type, rows) = read_system_table(&table, "audit_log").unwrap();
    assert_eq!(audit_type.field_names()[0], "rowkind");
    let audit: Vec<Row> = rows.map(|r| r.unwrap()).collect();
    assert_eq!(audit.len(), 2);
    assert!(audit
        .iter()
        .all(|r| r.get(0) == &Datum::String("+I".to_string())));
}
