use super::{commit_rows, executor, file_io, read_all};
use crate::{
    row::{Datum, Row, RowKind},
    schema::{column, ColumnDef, SchemaChange, SchemaManager, TableDefinition},
    table::FileStoreTable,
    types::DataType,
};

#[test]
fn rows_written_before_evolution_read_under_new_schema() {
    let dir = tempfile::tempdir().unwrap();
    let table = FileStoreTable::create(
        file_io(),
        dir.path(),
        TableDefinition {
            columns: vec![
                ColumnDef {
                    nullable: false,
                    ..column("k", DataType::BigInt)
                },
                column("v", DataType::Int),
            ],
            primary_keys: vec!["k".to_string()],
            ..Default::default()
        },
    )
    .unwrap();

    let mut write = table.new_write("test-user", executor()).unwrap();
    commit_rows(
        &table,
        &mut write,
        1,
        vec![(
            RowKind::Insert,
            Row::new(vec![Datum::BigInt(1), Datum::Int(7)]),
        )],
    );
    write.close().unwrap();

    // widen v and add a column, then write under the new schema
    let manager = SchemaManager::new(file_io(), dir.path());
    manager
        .commit_changes(vec![
            SchemaChange::UpdateColumnType {
                name: "v".to_string(),
                new_type: DataType::BigInt,
            },
            SchemaChange::AddColumn {
                name: "note".to_string(),
                data_type: DataType::String,
                nullable: true,
                description: None,
            },
        ])
        .unwrap();

    let evolved = FileStoreTable::open(file_io(), dir.path()).unwrap();
    let mut write = evolved.new_write("test-user", executor()).unwrap();
    commit_rows(
        &evolved,
        &mut write,
        2,
        vec![(
            RowKind::Insert,
            Row::new(vec![
                Datum::BigInt(2),
                Datum::BigInt(9),
                Datum::String("new".into()),
            ]),
        )],
    );
    write.close().unwrap();

    // the old row comes back widened, with the added column null
    assert_eq!(
        read_all(&evolved),
        vec![
            Row::new(vec![Datum::BigInt(1), Datum::BigInt(7), Datum::Null]),
            Row::new(vec![
                Datum::BigInt(2),
                Datum::BigInt(9),
                Datum::String("new".into())
            ]),
        ]
    );
}

#[test]
fn stale_writer_cannot_commit_across_schema_change() {
    let dir = tempfile::tempdir().unwrap();
    let table = FileStoreTable::create(
        file_io(),
        dir.path(),
        TableDefinition {
            columns: vec![
                ColumnDef {
                    nullable: false,
                    ..column("k", DataType::BigInt)
                },
                column("v", DataType::BigInt),
            ],
            primary_keys: vec!["k".to_string()],
            ..Default::default()
        },
    )
    .unwrap();

    let mut write = table.new_write("test-user", executor()).unwrap();
    write
        .write(Row::new(vec![Datum::BigInt(1), Datum::BigInt(1)]))
        .unwrap();
    let committable = write.prepare_commit(true, 1).unwrap();

    // schema evolves between prepare and commit
    SchemaManager::new(file_io(), dir.path())
        .commit_changes(vec![SchemaChange::AddColumn {
            name: "late".to_string(),
            data_type: DataType::String,
            nullable: true,
            description: None,
        }])
        .unwrap();

    let err = table.new_commit("test-user").commit(&committable).unwrap_err();
    assert!(matches!(err, crate::error::Error::SchemaMismatch(_)));
    write.close().unwrap();
}

#[test]
fn key_stats_prune_after_widening() {
    let dir = tempfile::tempdir().unwrap();
    let table = FileStoreTable::create(
        file_io(),
        dir.path(),
        TableDefinition {
            columns: vec![
                ColumnDef {
                    nullable: false,
                    ..column("k", DataType::BigInt)
                },
                column("v", DataType::Int),
            ],
            primary_keys: vec!["k".to_string()],
            ..Default::default()
        },
    )
    .unwrap();
    let mut write = table.new_write("test-user", executor()).unwrap();
    commit_rows(
        &table,
        &mut write,
        1,
        vec![(
            RowKind::Insert,
            Row::new(vec![Datum::BigInt(5), Datum::Int(1)]),
        )],
    );
    write.close().unwrap();

    SchemaManager::new(file_io(), dir.path())
        .commit_changes(vec![SchemaChange::UpdateColumnType {
            name: "v".to_string(),
            new_type: DataType::BigInt,
        }])
        .unwrap();
    let evolved = FileStoreTable::open(file_io(), dir.path()).unwrap();

    // a key filter over the old file's stats still prunes correctly
    let hit = evolved
        .new_scan()
        .with_key_filter(crate::predicate::Predicate::equal(
            0,
            "k",
            Datum::BigInt(5),
        ))
        .plan()
        .unwrap();
    assert_eq!(hit.files.len(), 1);

    let miss = evolved
        .new_scan()
        .with_key_filter(crate::predicate::Predicate::equal(
            0,
            "k",
            Datum::BigInt(99),
        ))
        .plan()
        .unwrap();
    assert!(miss.files.is_empty());
}
