use super::{commit_rows, executor, file_io, options_map, read_all};
use crate::{
    row::{Datum, Row, RowKind},
    schema::{column, ColumnDef, TableDefinition},
    table::FileStoreTable,
    types::DataType,
};

#[test]
fn max_price_sum_sales() {
    let dir = tempfile::tempdir().unwrap();
    let table = FileStoreTable::create(
        file_io(),
        dir.path(),
        TableDefinition {
            columns: vec![
                ColumnDef {
                    nullable: false,
                    ..column("pid", DataType::BigInt)
                },
                column("price", DataType::Double),
                column("sales", DataType::BigInt),
            ],
            primary_keys: vec!["pid".to_string()],
            options: options_map(&[
                ("merge-engine", "aggregation"),
                ("fields.price.aggregate-function", "max"),
                ("fields.sales.aggregate-function", "sum"),
            ]),
            ..Default::default()
        },
    )
    .unwrap();

    let mut write = table.new_write("test-user", executor()).unwrap();
    commit_rows(
        &table,
        &mut write,
        1,
        vec![
            (
                RowKind::Insert,
                Row::new(vec![Datum::BigInt(1), Datum::Double(23.0), Datum::BigInt(15)]),
            ),
            (
                RowKind::Insert,
                Row::new(vec![Datum::BigInt(1), Datum::Double(30.2), Datum::BigInt(20)]),
            ),
        ],
    );
    write.close().unwrap();

    assert_eq!(
        read_all(&table),
        vec![Row::new(vec![
            Datum::BigInt(1),
            Datum::Double(30.2),
            Datum::BigInt(35)
        ])]
    );
}

#[test]
fn aggregation_folds_across_commits() {
    let dir = tempfile::tempdir().unwrap();
    let table = FileStoreTable::create(
        file_io(),
        dir.path(),
        TableDefinition {
            columns: vec![
                ColumnDef {
                    nullable: false,
                    ..column("pid", DataType::BigInt)
                },
                column("sales", DataType::BigInt),
            ],
            primary_keys: vec!["pid".to_string()],
            options: options_map(&[
                ("merge-engine", "aggregation"),
                ("fields.sales.aggregate-function", "sum"),
            ]),
            ..Default::default()
        },
    )
    .unwrap();

    let mut write = table.new_write("test-user", executor()).unwrap();
    for (identifier, sales) in [(1, 5), (2, 7), (3, 8)] {
        commit_rows(
            &table,
            &mut write,
            identifier,
            vec![(
                RowKind::Insert,
                Row::new(vec![Datum::BigInt(9), Datum::BigInt(sales)]),
            )],
        );
    }
    write.close().unwrap();

    assert_eq!(
        read_all(&table),
        vec![Row::new(vec![Datum::BigInt(9), Datum::BigInt(20)])]
    );
}
