use std::{
    path::PathBuf,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    format::{FileFormat, FormatWriter, FormatWriterFactory},
    fs::FileIO,
    id::FileNames,
    partition::partition_path,
    row::{Datum, Row, RowKind},
    schema::{DataField, RowType},
    stats::{StatsCollector, StatsMap},
    types::DataType,
};

/// Synthetic field id of the `_SEQUENCE_NUMBER` column in data files.
pub const SEQUENCE_FIELD_ID: i32 = -1;
/// Synthetic field id of the `_VALUE_KIND` column in data files.
pub const VALUE_KIND_FIELD_ID: i32 = -2;

pub use crate::id::{CHANGELOG_FILE_PREFIX, DATA_FILE_PREFIX};

/// One keyed record flowing through the merge tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Row,
    pub sequence: i64,
    pub kind: RowKind,
    pub value: Row,
}

impl KeyValue {
    pub fn new(key: Row, sequence: i64, kind: RowKind, value: Row) -> Self {
        KeyValue {
            key,
            sequence,
            kind,
            value,
        }
    }

    pub fn estimated_size(&self) -> usize {
        self.key.estimated_size() + self.value.estimated_size() + 16
    }
}

fn kind_code(kind: RowKind) -> i32 {
    match kind {
        RowKind::Insert => 0,
        RowKind::UpdateBefore => 1,
        RowKind::UpdateAfter => 2,
        RowKind::Delete => 3,
    }
}

fn kind_from_code(code: i32) -> Result<RowKind> {
    match code {
        0 => Ok(RowKind::Insert),
        1 => Ok(RowKind::UpdateBefore),
        2 => Ok(RowKind::UpdateAfter),
        3 => Ok(RowKind::Delete),
        other => Err(Error::IoFatal(format!("unknown row kind code {other}"))),
    }
}

/// Synthetic field id of the `_VALUE_COUNT` column of value-count tables.
pub const VALUE_COUNT_FIELD_ID: i32 = -3;

/// The single-column value shape of a value-count table.
pub fn count_value_type() -> RowType {
    RowType::new(vec![
        DataField::new(VALUE_COUNT_FIELD_ID, "_VALUE_COUNT", DataType::BigInt).not_null(),
    ])
}

/// The physical row shape of a key-value data file:
/// `_KEY_*` columns, `_SEQUENCE_NUMBER`, `_VALUE_KIND`, then value columns.
pub fn key_value_row_type(key_type: &RowType, value_type: &RowType) -> RowType {
    let mut fields = Vec::with_capacity(key_type.len() + 2 + value_type.len());
    for field in key_type.fields() {
        let mut key_field = field.clone();
        key_field.name = format!("_KEY_{}", field.name);
        fields.push(key_field);
    }
    fields.push(DataField::new(SEQUENCE_FIELD_ID, "_SEQUENCE_NUMBER", DataType::BigInt).not_null());
    fields.push(DataField::new(VALUE_KIND_FIELD_ID, "_VALUE_KIND", DataType::Int).not_null());
    fields.extend(value_type.fields().iter().cloned());
    RowType::new(fields)
}

/// Flattens a [`KeyValue`] into the physical row of a data file and back.
#[derive(Debug, Clone, Copy)]
pub struct KeyValueSerializer {
    key_arity: usize,
    value_arity: usize,
}

impl KeyValueSerializer {
    pub fn new(key_type: &RowType, value_type: &RowType) -> Self {
        KeyValueSerializer {
            key_arity: key_type.len(),
            value_arity: value_type.len(),
        }
    }

    pub fn to_row(&self, kv: &KeyValue) -> Row {
        debug_assert_eq!(kv.key.len(), self.key_arity);
        debug_assert_eq!(kv.value.len(), self.value_arity);
        let mut fields = Vec::with_capacity(self.key_arity + 2 + self.value_arity);
        fields.extend(kv.key.fields().iter().cloned());
        fields.push(Datum::BigInt(kv.sequence));
        fields.push(Datum::Int(kind_code(kv.kind)));
        fields.extend(kv.value.fields().iter().cloned());
        Row::new(fields)
    }

    pub fn from_row(&self, row: &Row) -> Result<KeyValue> {
        if row.len() != self.key_arity + 2 + self.value_arity {
            return Err(Error::SchemaMismatch(format!(
                "data row has {} fields, expected {}",
                row.len(),
                self.key_arity + 2 + self.value_arity
            )));
        }
        let key = Row::new(row.fields()[..self.key_arity].to_vec());
        let sequence = match row.get(self.key_arity) {
            Datum::BigInt(v) => *v,
            other => {
                return Err(Error::IoFatal(format!(
                    "sequence column holds {other:?}"
                )))
            }
        };
        let kind = match row.get(self.key_arity + 1) {
            Datum::Int(v) => kind_from_code(*v)?,
            other => return Err(Error::IoFatal(format!("value kind column holds {other:?}"))),
        };
        let value = Row::new(row.fields()[self.key_arity + 2..].to_vec());
        Ok(KeyValue::new(key, sequence, kind, value))
    }
}

/// Metadata of one immutable data (or changelog) file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataFileMeta {
    pub file_name: String,
    pub file_size: u64,
    pub row_count: u64,
    pub min_key: Row,
    pub max_key: Row,
    pub key_stats: StatsMap,
    pub value_stats: StatsMap,
    pub min_sequence_number: i64,
    pub max_sequence_number: i64,
    pub schema_id: i64,
    pub level: usize,
    pub extra_files: Vec<String>,
    /// Unix millis at creation.
    pub creation_time: i64,
}

impl DataFileMeta {
    /// The same physical file re-registered at a higher level.
    pub fn upgrade(&self, level: usize) -> DataFileMeta {
        DataFileMeta {
            level,
            ..self.clone()
        }
    }

    pub fn max_sequence_number(files: &[DataFileMeta]) -> i64 {
        files
            .iter()
            .map(|f| f.max_sequence_number)
            .max()
            .unwrap_or(-1)
    }
}

pub(crate) fn current_time_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Produces paths for the data files of one `(partition, bucket)`.
pub struct DataFilePathFactory {
    bucket_dir: PathBuf,
    extension: String,
    names: FileNames,
}

impl DataFilePathFactory {
    pub fn new(
        table_root: &std::path::Path,
        partition: &Row,
        partition_type: &RowType,
        bucket: usize,
        default_partition_name: &str,
        extension: &str,
    ) -> Self {
        let mut bucket_dir = table_root.to_path_buf();
        for segment in partition_path(partition, partition_type, default_partition_name) {
            bucket_dir = bucket_dir.join(segment);
        }
        bucket_dir = bucket_dir.join(format!("bucket-{bucket}"));
        DataFilePathFactory {
            bucket_dir,
            extension: extension.to_string(),
            names: FileNames::new(),
        }
    }

    pub fn bucket_dir(&self) -> &std::path::Path {
        &self.bucket_dir
    }

    pub fn new_data_file_name(&self) -> String {
        self.names.data_file(&self.extension)
    }

    pub fn new_changelog_file_name(&self) -> String {
        self.names.changelog_file(&self.extension)
    }

    pub fn to_path(&self, file_name: &str) -> PathBuf {
        self.bucket_dir.join(file_name)
    }
}

/// Writes one key-value data file, collecting stats and key/sequence bounds.
pub struct KeyValueFileWriter {
    file_io: Arc<dyn FileIO>,
    writer: Option<Box<dyn FormatWriter>>,
    serializer: KeyValueSerializer,
    key_collector: StatsCollector,
    value_collector: StatsCollector,
    path: PathBuf,
    file_name: String,
    schema_id: i64,
    level: usize,
    row_count: u64,
    min_key: Option<Row>,
    max_key: Option<Row>,
    min_sequence: i64,
    max_sequence: i64,
    estimated_bytes: usize,
}

impl KeyValueFileWriter {
    pub fn write(&mut self, kv: &KeyValue) -> Result<()> {
        let row = self.serializer.to_row(kv);
        self.writer
            .as_mut()
            .expect("writer open")
            .write(&row)?;
        self.key_collector.collect(&kv.key);
        self.value_collector.collect(&kv.value);
        if self.min_key.is_none() {
            self.min_key = Some(kv.key.clone());
        }
        self.max_key = Some(kv.key.clone());
        self.min_sequence = self.min_sequence.min(kv.sequence);
        self.max_sequence = self.max_sequence.max(kv.sequence);
        self.row_count += 1;
        self.estimated_bytes += kv.estimated_size();
        Ok(())
    }

    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    pub fn estimated_bytes(&self) -> usize {
        self.estimated_bytes
    }

    pub fn close(mut self) -> Result<DataFileMeta> {
        self.writer.take().expect("writer open").finish()?;
        let file_size = self.file_io.file_size(&self.path)?;
        Ok(DataFileMeta {
            file_name: self.file_name,
            file_size,
            row_count: self.row_count,
            min_key: self.min_key.unwrap_or_else(Row::empty),
            max_key: self.max_key.unwrap_or_else(Row::empty),
            key_stats: self.key_collector.finish(),
            value_stats: self.value_collector.finish(),
            min_sequence_number: if self.row_count == 0 { 0 } else { self.min_sequence },
            max_sequence_number: if self.row_count == 0 { 0 } else { self.max_sequence },
            schema_id: self.schema_id,
            level: self.level,
            extra_files: Vec::new(),
            creation_time: current_time_millis(),
        })
    }

    /// Drop the partially written file, e.g. when a compaction is cancelled.
    pub fn abort(mut self) {
        drop(self.writer.take());
        self.file_io.delete_quietly(&self.path);
    }
}

/// Creates single or rolling key-value file writers for one bucket.
pub struct KeyValueFileWriterFactory {
    file_io: Arc<dyn FileIO>,
    schema_id: i64,
    key_type: RowType,
    value_type: RowType,
    writer_factory: Arc<dyn FormatWriterFactory>,
    path_factory: Arc<DataFilePathFactory>,
    target_file_size: u64,
}

impl KeyValueFileWriterFactory {
    pub fn new(
        file_io: Arc<dyn FileIO>,
        schema_id: i64,
        key_type: RowType,
        value_type: RowType,
        format: &dyn FileFormat,
        path_factory: Arc<DataFilePathFactory>,
        target_file_size: u64,
    ) -> Result<Self> {
        let row_type = key_value_row_type(&key_type, &value_type);
        let writer_factory = format.create_writer_factory(&row_type)?;
        Ok(KeyValueFileWriterFactory {
            file_io,
            schema_id,
            key_type,
            value_type,
            writer_factory,
            path_factory,
            target_file_size,
        })
    }

    pub fn path_factory(&self) -> &DataFilePathFactory {
        &self.path_factory
    }

    pub fn create_data(&self, level: usize) -> Result<KeyValueFileWriter> {
        self.create_with(self.path_factory.new_data_file_name(), level)
    }

    pub fn create_changelog(&self, level: usize) -> Result<KeyValueFileWriter> {
        self.create_with(self.path_factory.new_changelog_file_name(), level)
    }

    fn create_with(&self, file_name: String, level: usize) -> Result<KeyValueFileWriter> {
        let path = self.path_factory.to_path(&file_name);
        let out = self.file_io.create(&path, false)?;
        let writer = self.writer_factory.create_writer(out)?;
        Ok(KeyValueFileWriter {
            file_io: self.file_io.clone(),
            writer: Some(writer),
            serializer: KeyValueSerializer::new(&self.key_type, &self.value_type),
            key_collector: StatsCollector::new(self.key_type.field_ids()),
            value_collector: StatsCollector::new(self.value_type.field_ids()),
            path,
            file_name,
            schema_id: self.schema_id,
            level,
            row_count: 0,
            min_key: None,
            max_key: None,
            min_sequence: i64::MAX,
            max_sequence: i64::MIN,
            estimated_bytes: 0,
        })
    }

    pub fn create_rolling_data(&self, level: usize) -> RollingKeyValueFileWriter<'_> {
        RollingKeyValueFileWriter {
            factory: self,
            changelog: false,
            level,
            current: None,
            closed: Vec::new(),
        }
    }

    pub fn create_rolling_changelog(&self, level: usize) -> RollingKeyValueFileWriter<'_> {
        RollingKeyValueFileWriter {
            factory: self,
            changelog: true,
            level,
            current: None,
            closed: Vec::new(),
        }
    }
}

/// Rolls to a fresh data file whenever the estimated written size passes the
/// target file size. Compaction and flush outputs go through here.
pub struct RollingKeyValueFileWriter<'a> {
    factory: &'a KeyValueFileWriterFactory,
    changelog: bool,
    level: usize,
    current: Option<KeyValueFileWriter>,
    closed: Vec<DataFileMeta>,
}

impl RollingKeyValueFileWriter<'_> {
    pub fn write(&mut self, kv: &KeyValue) -> Result<()> {
        if self.current.is_none() {
            self.current = Some(if self.changelog {
                self.factory.create_changelog(self.level)?
            } else {
                self.factory.create_data(self.level)?
            });
        }
        let writer = self.current.as_mut().expect("writer just created");
        writer.write(kv)?;
        if writer.estimated_bytes() as u64 >= self.factory.target_file_size {
            let finished = self.current.take().expect("writer present");
            self.closed.push(finished.close()?);
        }
        Ok(())
    }

    pub fn close(mut self) -> Result<Vec<DataFileMeta>> {
        if let Some(writer) = self.current.take() {
            if writer.row_count() > 0 {
                self.closed.push(writer.close()?);
            } else {
                writer.abort();
            }
        }
        Ok(self.closed)
    }

    pub fn abort(mut self) {
        if let Some(writer) = self.current.take() {
            writer.abort();
        }
        // already closed outputs are unlinked too; a cancelled compaction
        // leaves no trace
        for meta in self.closed.drain(..) {
            let path = self.factory.path_factory.to_path(&meta.file_name);
            self.factory.file_io.delete_quietly(&path);
        }
    }
}

/// Writes plain value rows for append-only tables; the physical file has
/// no key, sequence or kind columns.
pub struct RowFileWriter {
    file_io: Arc<dyn FileIO>,
    writer: Option<Box<dyn FormatWriter>>,
    collector: StatsCollector,
    path: PathBuf,
    file_name: String,
    schema_id: i64,
    row_count: u64,
    sequence_start: i64,
    estimated_bytes: usize,
}

impl RowFileWriter {
    pub fn write(&mut self, row: &Row) -> Result<()> {
        self.writer.as_mut().expect("writer open").write(row)?;
        self.collector.collect(row);
        self.row_count += 1;
        self.estimated_bytes += row.estimated_size();
        Ok(())
    }

    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    pub fn estimated_bytes(&self) -> usize {
        self.estimated_bytes
    }

    pub fn close(mut self) -> Result<DataFileMeta> {
        self.writer.take().expect("writer open").finish()?;
        let file_size = self.file_io.file_size(&self.path)?;
        let max_sequence = self.sequence_start + self.row_count.max(1) as i64 - 1;
        Ok(DataFileMeta {
            file_name: self.file_name,
            file_size,
            row_count: self.row_count,
            min_key: Row::empty(),
            max_key: Row::empty(),
            key_stats: StatsMap::new(),
            value_stats: self.collector.finish(),
            min_sequence_number: self.sequence_start,
            max_sequence_number: max_sequence,
            schema_id: self.schema_id,
            level: 0,
            extra_files: Vec::new(),
            creation_time: current_time_millis(),
        })
    }

    pub fn abort(mut self) {
        drop(self.writer.take());
        self.file_io.delete_quietly(&self.path);
    }
}

/// Creates rolling plain-row writers for one bucket of an append-only
/// table.
pub struct RowFileWriterFactory {
    file_io: Arc<dyn FileIO>,
    schema_id: i64,
    row_type: RowType,
    writer_factory: Arc<dyn FormatWriterFactory>,
    path_factory: Arc<DataFilePathFactory>,
    target_file_size: u64,
}

impl RowFileWriterFactory {
    pub fn new(
        file_io: Arc<dyn FileIO>,
        schema_id: i64,
        row_type: RowType,
        format: &dyn FileFormat,
        path_factory: Arc<DataFilePathFactory>,
        target_file_size: u64,
    ) -> Result<Self> {
        let writer_factory = format.create_writer_factory(&row_type)?;
        Ok(RowFileWriterFactory {
            file_io,
            schema_id,
            row_type,
            writer_factory,
            path_factory,
            target_file_size,
        })
    }

    pub fn target_file_size(&self) -> u64 {
        self.target_file_size
    }

    pub fn path_factory(&self) -> &Arc<DataFilePathFactory> {
        &self.path_factory
    }

    pub fn create(&self, sequence_start: i64) -> Result<RowFileWriter> {
        let file_name = self.path_factory.new_data_file_name();
        let path = self.path_factory.to_path(&file_name);
        let out = self.file_io.create(&path, false)?;
        Ok(RowFileWriter {
            file_io: self.file_io.clone(),
            writer: Some(self.writer_factory.create_writer(out)?),
            collector: StatsCollector::new(self.row_type.field_ids()),
            path,
            file_name,
            schema_id: self.schema_id,
            row_count: 0,
            sequence_start,
            estimated_bytes: 0,
        })
    }
}
