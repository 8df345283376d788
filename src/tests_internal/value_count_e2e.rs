use super::{commit_rows, executor, file_io, read_all};
use crate::{
    row::{Datum, Row, RowKind},
    schema::{column, TableDefinition},
    table::{FileStoreTable, TableKind},
    types::DataType,
};

fn value_count_table(dir: &std::path::Path) -> FileStoreTable {
    // no primary key and the default change-log write mode
    FileStoreTable::create(
        file_io(),
        dir,
        TableDefinition {
            columns: vec![column("word", DataType::String), column("len", DataType::BigInt)],
            ..Default::default()
        },
    )
    .unwrap()
}

fn row(word: &str, len: i64) -> Row {
    Row::new(vec![Datum::String(word.to_string()), Datum::BigInt(len)])
}

#[test]
fn duplicate_rows_multiply_and_retract() {
    let dir = tempfile::tempdir().unwrap();
    let table = value_count_table(dir.path());
    assert_eq!(table.kind(), TableKind::ChangelogValueCount);

    let mut write = table.new_write("test-user", executor()).unwrap();
    commit_rows(
        &table,
        &mut write,
        1,
        vec![
            (RowKind::Insert, row("ant", 3)),
            (RowKind::Insert, row("ant", 3)),
            (RowKind::Insert, row("bee", 3)),
        ],
    );
    assert_eq!(
        read_all(&table),
        vec![row("ant", 3), row("ant", 3), row("bee", 3)]
    );

    // retract one duplicate and the whole other row
    commit_rows(
        &table,
        &mut write,
        2,
        vec![
            (RowKind::Delete, row("ant", 3)),
            (RowKind::Delete, row("bee", 3)),
        ],
    );
    write.close().unwrap();
    assert_eq!(read_all(&table), vec![row("ant", 3)]);
}

#[test]
fn compaction_keeps_counts_correct() {
    let dir = tempfile::tempdir().unwrap();
    let table = value_count_table(dir.path());
    let mut write = table.new_write("test-user", executor()).unwrap();

    for identifier in 1..=3 {
        commit_rows(
            &table,
            &mut write,
            identifier,
            vec![(RowKind::Insert, row("ant", 3))],
        );
    }
    write.compact(true).unwrap();
    let committable = write.prepare_commit(true, 4).unwrap();
    table.new_commit("test-user").commit(&committable).unwrap();
    write.close().unwrap();

    assert_eq!(
        read_all(&table),
        vec![row("ant", 3), row("ant", 3), row("ant", 3)]
    );
}
