//! End-to-end scenarios across the write, commit, scan, read, expire and
//! streaming paths, over a real local filesystem workspace.

mod aggregation_e2e;
mod changelog_e2e;
mod compaction_e2e;
mod dedup_e2e;
mod expire_e2e;
mod maintenance_e2e;
mod overwrite_e2e;
mod partial_update_e2e;
mod schema_evolution_e2e;
mod streaming_e2e;
mod value_count_e2e;

use std::{collections::HashMap, path::Path, sync::Arc};

use crate::{
    executor::CompactExecutor,
    fs::local::LocalFileIO,
    row::{Row, RowKind},
    schema::{column, ColumnDef, TableDefinition},
    table::{FileStoreTable, TableWrite},
    types::DataType,
};

pub(crate) fn file_io() -> Arc<dyn crate::fs::FileIO> {
    Arc::new(LocalFileIO::new())
}

pub(crate) fn executor() -> Arc<CompactExecutor> {
    Arc::new(CompactExecutor::new(2))
}

pub(crate) fn options_map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// `(k BIGINT PRIMARY KEY, v BIGINT)` with extra options.
pub(crate) fn pk_table(dir: &Path, options: &[(&str, &str)]) -> FileStoreTable {
    FileStoreTable::create(
        file_io(),
        dir,
        TableDefinition {
            columns: vec![
                ColumnDef {
                    nullable: false,
                    ..column("k", DataType::BigInt)
                },
                column("v", DataType::BigInt),
            ],
            primary_keys: vec!["k".to_string()],
            options: options_map(options),
            ..Default::default()
        },
    )
    .unwrap()
}

/// Write rows (with kinds) and commit them under `identifier`.
pub(crate) fn commit_rows(
    table: &FileStoreTable,
    write: &mut TableWrite,
    identifier: i64,
    rows: Vec<(RowKind, Row)>,
) {
    for (kind, row) in rows {
        write.write_kind(kind, row).unwrap();
    }
    let committable = write.prepare_commit(true, identifier).unwrap();
    table.new_commit("test-user").commit(&committable).unwrap();
}

/// Scan the latest snapshot and read every row, sorted for comparison.
pub(crate) fn read_all(table: &FileStoreTable) -> Vec<Row> {
    let scan = table.new_scan();
    let splits = table.plan_splits(&scan).unwrap();
    let read = table.new_read();
    let mut rows = Vec::new();
    for split in &splits {
        for row in read.create_reader(split).unwrap() {
            rows.push(row.unwrap());
        }
    }
    rows.sort();
    rows
}

pub(crate) fn bigint_row(values: &[i64]) -> Row {
    Row::new(values.iter().map(|v| crate::row::Datum::BigInt(*v)).collect())
}
