use std::sync::Arc;

use crate::{
    error::{Error, Result},
    partition::partition_path,
    row::{Datum, Row},
    schema::{DataField, RowType},
    snapshot::{CommitKind, SnapshotManager},
    table::FileStoreTable,
    types::DataType,
};

/// Read-only virtual tables over table metadata, addressed by logical
/// name: `snapshots`, `schemas`, `options`, `audit_log`, `files`.
pub fn read_system_table(
    table: &FileStoreTable,
    name: &str,
) -> Result<(RowType, Box<dyn Iterator<Item = Result<Row>> + Send>)> {
    match name {
        "snapshots" => snapshots(table),
        "schemas" => schemas(table),
        "options" => options(table),
        "files" => files(table),
        "audit_log" => audit_log(table),
        other => Err(Error::ConfigInvalid(format!(
            "unknown system table '{other}'"
        ))),
    }
}

fn field(id: i32, name: &str, data_type: DataType) -> DataField {
    DataField::new(id, name, data_type)
}

fn snapshots(
    table: &FileStoreTable,
) -> Result<(RowType, Box<dyn Iterator<Item = Result<Row>> + Send>)> {
    let row_type = RowType::new(vec![
        field(0, "snapshot_id", DataType::BigInt),
        field(1, "schema_id", DataType::BigInt),
        field(2, "commit_user", DataType::String),
        field(3, "commit_identifier", DataType::BigInt),
        field(4, "commit_kind", DataType::String),
        field(5, "commit_time", DataType::Timestamp),
        field(6, "total_record_count", DataType::BigInt),
        field(7, "delta_record_count", DataType::BigInt),
        field(8, "changelog_record_count", DataType::BigInt),
        field(9, "watermark", DataType::BigInt),
    ]);
    let ctx = table.context().clone();
    let manager = SnapshotManager::new(ctx.file_io.clone(), &ctx.table_root);
    let ids = manager.list_ids()?;
    let rows = ids.into_iter().map(move |id| {
        let snapshot = manager.snapshot(id)?;
        let kind = match snapshot.commit_kind {
            CommitKind::Append => "APPEND",
            CommitKind::Compact => "COMPACT",
            CommitKind::Overwrite => "OVERWRITE",
            CommitKind::Analyze => "ANALYZE",
        };
        Ok(Row::new(vec![
            Datum::BigInt(snapshot.id),
            Datum::BigInt(snapshot.schema_id),
            Datum::String(snapshot.commit_user),
            Datum::BigInt(snapshot.commit_identifier),
            Datum::String(kind.to_string()),
            Datum::Timestamp(snapshot.time_millis),
            Datum::BigInt(snapshot.total_record_count as i64),
            Datum::BigInt(snapshot.delta_record_count as i64),
            Datum::BigInt(snapshot.changelog_record_count as i64),
            snapshot
                .watermark
                .map(Datum::BigInt)
                .unwrap_or(Datum::Null),
        ]))
    });
    Ok((row_type, Box::new(rows)))
}

fn schemas(
    table: &FileStoreTable,
) -> Result<(RowType, Box<dyn Iterator<Item = Result<Row>> + Send>)> {
    let row_type = RowType::new(vec![
        field(0, "schema_id", DataType::BigInt),
        field(1, "fields", DataType::String),
        field(2, "partition_keys", DataType::String),
        field(3, "primary_keys", DataType::String),
        field(4, "options", DataType::String),
        field(5, "comment", DataType::String),
    ]);
    let ctx = table.context().clone();
    let ids = ctx.schema_manager.list_all_ids()?;
    let rows = ids.into_iter().map(move |id| {
        let schema = ctx.schema_manager.schema(id)?;
        Ok(Row::new(vec![
            Datum::BigInt(schema.id),
            Datum::String(serde_json::to_string(&schema.fields)?),
            Datum::String(serde_json::to_string(&schema.partition_keys)?),
            Datum::String(serde_json::to_string(&schema.primary_keys)?),
            Datum::String(serde_json::to_string(&schema.options)?),
            schema
                .comment
                .map(Datum::String)
                .unwrap_or(Datum::Null),
        ]))
    });
    Ok((row_type, Box::new(rows)))
}

fn options(
    table: &FileStoreTable,
) -> Result<(RowType, Box<dyn Iterator<Item = Result<Row>> + Send>)> {
    let row_type = RowType::new(vec![
        field(0, "key", DataType::String),
        field(1, "value", DataType::String),
    ]);
    let mut pairs: Vec<(String, String)> = table
        .schema()
        .options
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    pairs.sort();
    let rows = pairs
        .into_iter()
        .map(|(k, v)| Ok(Row::new(vec![Datum::String(k), Datum::String(v)])));
    Ok((row_type, Box::new(rows)))
}

fn files(
    table: &FileStoreTable,
) -> Result<(RowType, Box<dyn Iterator<Item = Result<Row>> + Send>)> {
    let row_type = RowType::new(vec![
        field(0, "partition", DataType::String),
        field(1, "bucket", DataType::Int),
        field(2, "file_name", DataType::String),
        field(3, "schema_id", DataType::BigInt),
        field(4, "level", DataType::Int),
        field(5, "record_count", DataType::BigInt),
        field(6, "file_size_in_bytes", DataType::BigInt),
        field(7, "min_sequence_number", DataType::BigInt),
        field(8, "max_sequence_number", DataType::BigInt),
        field(9, "creation_time", DataType::Timestamp),
    ]);
    let partition_type = table.schema().partition_type();
    let default_name = table.options().partition_default_name.clone();
    let entries = table.new_scan().plan()?.files;
    let rows = entries.into_iter().map(move |entry| {
        let partition = partition_path(&entry.partition, &partition_type, &default_name).join("/");
        Ok(Row::new(vec![
            Datum::String(partition),
            Datum::Int(entry.bucket as i32),
            Datum::String(entry.file.file_name),
            Datum::BigInt(entry.file.schema_id),
            Datum::Int(entry.file.level as i32),
            Datum::BigInt(entry.file.row_count as i64),
            Datum::BigInt(entry.file.file_size as i64),
            Datum::BigInt(entry.file.min_sequence_number),
            Datum::BigInt(entry.file.max_sequence_number),
            Datum::Timestamp(entry.file.creation_time),
        ]))
    });
    Ok((row_type, Box::new(rows)))
}

/// The table's rows with a leading `rowkind` column exposing the change
/// kind the merge produced.
fn audit_log(
    table: &FileStoreTable,
) -> Result<(RowType, Box<dyn Iterator<Item = Result<Row>> + Send>)> {
    let mut fields = vec![field(-10, "rowkind", DataType::String)];
    fields.extend(table.schema().fields.iter().cloned());
    let row_type = RowType::new(fields);

    let scan = table.new_scan();
    let splits = table.plan_splits(&scan)?;
    let read = Arc::new(table.new_read().with_row_kind());
    let mut split_queue: std::collections::VecDeque<_> = splits.into();
    let mut current: Option<Box<dyn Iterator<Item = Result<Row>> + Send>> = None;
    let rows = std::iter::from_fn(move || loop {
        if let Some(reader) = &mut current {
            match reader.next() {
                Some(item) => return Some(item),
                None => current = None,
            }
        }
        let split = split_queue.pop_front()?;
        match read.create_reader(&split) {
            Ok(reader) => current = Some(reader),
            Err(err) => return Some(Err(err)),
        }
    });
    Ok((row_type, Box::new(rows)))
}
