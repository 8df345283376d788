use super::{commit_rows, executor, file_io, options_map};
use crate::{
    predicate::Predicate,
    row::{Datum, Row, RowKind},
    schema::{column, ColumnDef, TableDefinition},
    table::FileStoreTable,
    types::DataType,
};

fn partial_update_table(dir: &std::path::Path) -> FileStoreTable {
    FileStoreTable::create(
        file_io(),
        dir,
        TableDefinition {
            columns: vec![
                ColumnDef {
                    nullable: false,
                    ..column("k", DataType::Int)
                },
                column("a", DataType::Int),
                column("b", DataType::Int),
                column("c", DataType::String),
            ],
            primary_keys: vec!["k".to_string()],
            options: options_map(&[("merge-engine", "partial-update")]),
            ..Default::default()
        },
    )
    .unwrap()
}

fn row(k: i32, a: Option<i32>, b: Option<i32>, c: Option<&str>) -> Row {
    Row::new(vec![
        Datum::Int(k),
        a.map(Datum::Int).unwrap_or(Datum::Null),
        b.map(Datum::Int).unwrap_or(Datum::Null),
        c.map(|s| Datum::String(s.to_string())).unwrap_or(Datum::Null),
    ])
}

#[test]
fn non_null_fields_fold_across_writes() {
    let dir = tempfile::tempdir().unwrap();
    let table = partial_update_table(dir.path());
    let mut write = table.new_write("test-user", executor()).unwrap();

    commit_rows(
        &table,
        &mut write,
        1,
        vec![
            (RowKind::Insert, row(1, Some(23), Some(10), None)),
            (RowKind::Insert, row(1, None, None, Some("book"))),
            (RowKind::Insert, row(1, Some(25), None, None)),
        ],
    );
    write.close().unwrap();

    // point lookup on k = 1
    let scan = table.new_scan();
    let splits = table.plan_splits(&scan).unwrap();
    let read = table
        .new_read()
        .with_filter(Predicate::equal(0, "k", Datum::Int(1)));
    let mut rows = Vec::new();
    for split in &splits {
        for item in read.create_reader(split).unwrap() {
            rows.push(item.unwrap());
        }
    }
    assert_eq!(rows, vec![row(1, Some(25), Some(10), Some("book"))]);
}

#[test]
fn delete_rejected_without_ignore_delete() {
    let dir = tempfile::tempdir().unwrap();
    let table = partial_update_table(dir.path());
    let mut write = table.new_write("test-user", executor()).unwrap();

    write
        .write_kind(RowKind::Insert, row(1, Some(1), None, None))
        .unwrap();
    write
        .write_kind(RowKind::Delete, row(1, None, None, None))
        .unwrap();
    let err = write.prepare_commit(true, 1).unwrap_err();
    assert!(matches!(err, crate::error::Error::MergeUnsupported(_)));
    write.close().unwrap();
}
