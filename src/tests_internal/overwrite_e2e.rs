use super::{executor, file_io, options_map};
use crate::{
    predicate::Predicate,
    row::{Datum, Row},
    schema::{column, ColumnDef, TableDefinition},
    snapshot::CommitKind,
    table::FileStoreTable,
    types::DataType,
};

fn partitioned_append_table(dir: &std::path::Path) -> FileStoreTable {
    FileStoreTable::create(
        file_io(),
        dir,
        TableDefinition {
            columns: vec![
                column("id", DataType::BigInt),
                ColumnDef {
                    nullable: false,
                    ..column("p", DataType::String)
                },
                column("v", DataType::BigInt),
            ],
            partition_keys: vec!["p".to_string()],
            options: options_map(&[("write-mode", "append-only")]),
            ..Default::default()
        },
    )
    .unwrap()
}

fn row(id: i64, p: &str, v: i64) -> Row {
    Row::new(vec![
        Datum::BigInt(id),
        Datum::String(p.to_string()),
        Datum::BigInt(v),
    ])
}

#[test]
fn overwrite_replaces_one_partition() {
    let dir = tempfile::tempdir().unwrap();
    let table = partitioned_append_table(dir.path());
    let commit = table.new_commit("test-user");

    let mut write = table.new_write("test-user", executor()).unwrap();
    write.write(row(0, "p1", 2)).unwrap();
    write.write(row(3, "p2", 1)).unwrap();
    commit.commit(&write.prepare_commit(true, 1).unwrap()).unwrap();

    write.write(row(5, "p1", 1)).unwrap();
    commit.commit(&write.prepare_commit(true, 2).unwrap()).unwrap();

    // replace everything in p2
    let mut overwrite_write = table.new_write("test-user", executor()).unwrap();
    overwrite_write.write(row(9, "p2", 5)).unwrap();
    let committable = overwrite_write.prepare_commit(true, 3).unwrap();
    let partition_filter = Predicate::equal(0, "p", Datum::String("p2".to_string()));
    commit.overwrite(Some(partition_filter), &committable).unwrap();
    overwrite_write.close().unwrap();
    write.close().unwrap();

    let latest = table.snapshot_manager().latest_snapshot().unwrap().unwrap();
    assert_eq!(latest.commit_kind, CommitKind::Overwrite);

    assert_eq!(
        super::read_all(&table),
        vec![row(0, "p1", 2), row(5, "p1", 1), row(9, "p2", 5)]
    );
}

#[test]
fn overwrite_all_partitions_when_unfiltered() {
    let dir = tempfile::tempdir().unwrap();
    let table = partitioned_append_table(dir.path());
    let commit = table.new_commit("test-user");

    let mut write = table.new_write("test-user", executor()).unwrap();
    write.write(row(1, "p1", 1)).unwrap();
    write.write(row(2, "p2", 2)).unwrap();
    commit.commit(&write.prepare_commit(true, 1).unwrap()).unwrap();
    write.close().unwrap();

    let mut replacement = table.new_write("test-user", executor()).unwrap();
    replacement.write(row(9, "p3", 9)).unwrap();
    let committable = replacement.prepare_commit(true, 2).unwrap();
    commit.overwrite(None, &committable).unwrap();
    replacement.close().unwrap();

    assert_eq!(super::read_all(&table), vec![row(9, "p3", 9)]);
}
