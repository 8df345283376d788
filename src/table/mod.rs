pub mod system;

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use crc::{Crc, CRC_32_ISCSI};
use tracing::debug;

use crate::{
    commit::{CommitMessage, FileStoreCommit, ManifestCommittable},
    error::{Error, Result},
    executor::CompactExecutor,
    expire::{OrphanFilesClean, SnapshotExpire},
    format::{self, FileFormat},
    fs::FileIO,
    io::{
        DataFileMeta, DataFilePathFactory, KeyValueFileWriterFactory, RowFileWriter,
        RowFileWriterFactory,
    },
    mergefn::MergeFunctionFactory,
    mergetree::{
        buffer::{ScratchSpace, WriteBuffer},
        compact::{
            CompactManager, FullChangelogMergeTreeCompactRewriter, MergeTreeCompactManager,
            MergeTreeCompactRewriter, NoopCompactManager, UniversalCompaction,
        },
        levels::Levels,
        writer::{MergeTreeWriter, MergeTreeWriterContext},
    },
    options::{ChangelogProducer, CoreOptions, WriteMode},
    partition::{PartitionExpire, PartitionTimeExtractor},
    predicate::Predicate,
    read::{ConcatRecordReader, KeyValueFileReaderFactory, KeyValueTableRead, ReadShape},
    row::{Datum, Row, RowKind},
    scan::{split::DataSplit, split::SplitGenerator, FileStoreScan},
    schema::{RowType, SchemaManager, TableDefinition, TableSchema},
};

const BUCKET_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// The three logical table shapes sharing one metadata plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    AppendOnly,
    ChangelogWithKey,
    ChangelogValueCount,
}

/// Immutable wiring shared by every component of one table instance.
/// Cross-references flow through this context, never through object
/// back-pointers.
pub struct StoreContext {
    pub file_io: Arc<dyn FileIO>,
    pub table_root: PathBuf,
    pub schema: TableSchema,
    pub options: CoreOptions,
    pub format: Arc<dyn FileFormat>,
    pub schema_manager: Arc<SchemaManager>,
}

impl StoreContext {
    pub fn path_factory(&self, partition: &Row, bucket: usize) -> Arc<DataFilePathFactory> {
        Arc::new(DataFilePathFactory::new(
            &self.table_root,
            partition,
            &self.schema.partition_type(),
            bucket,
            &self.options.partition_default_name,
            self.format.extension(),
        ))
    }

    pub fn reader_factory(
        &self,
        partition: &Row,
        bucket: usize,
    ) -> Arc<KeyValueFileReaderFactory> {
        Arc::new(KeyValueFileReaderFactory::new(
            self.file_io.clone(),
            self.format.clone(),
            self.path_factory(partition, bucket),
            self.schema_manager.clone(),
            self.schema.clone(),
        ))
    }
}

/// Entry point: a table bound to its root directory and current schema.
pub struct FileStoreTable {
    ctx: Arc<StoreContext>,
    kind: TableKind,
}

impl FileStoreTable {
    pub fn create(
        file_io: Arc<dyn FileIO>,
        table_root: impl Into<PathBuf>,
        definition: TableDefinition,
    ) -> Result<Self> {
        let table_root = table_root.into();
        let schema_manager = SchemaManager::new(file_io.clone(), &table_root);
        schema_manager.create_table(definition)?;
        Self::open(file_io, table_root)
    }

    pub fn open(file_io: Arc<dyn FileIO>, table_root: impl Into<PathBuf>) -> Result<Self> {
        let table_root = table_root.into();
        let schema_manager = Arc::new(SchemaManager::new(file_io.clone(), &table_root));
        let schema = schema_manager.latest()?.ok_or_else(|| {
            Error::IoFatal(format!("no table found at {}", table_root.display()))
        })?;
        let options = schema.core_options()?;
        let format = format::discover(&options)?;
        let kind = if schema.has_primary_keys() {
            TableKind::ChangelogWithKey
        } else if options.write_mode == WriteMode::AppendOnly {
            TableKind::AppendOnly
        } else {
            TableKind::ChangelogValueCount
        };
        Ok(FileStoreTable {
            ctx: Arc::new(StoreContext {
                file_io,
                table_root,
                schema,
                options,
                format,
                schema_manager,
            }),
            kind,
        })
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    pub fn schema(&self) -> &TableSchema {
        &self.ctx.schema
    }

    pub fn options(&self) -> &CoreOptions {
        &self.ctx.options
    }

    pub fn context(&self) -> &Arc<StoreContext> {
        &self.ctx
    }

    pub fn snapshot_manager(&self) -> crate::snapshot::SnapshotManager {
        crate::snapshot::SnapshotManager::new(self.ctx.file_io.clone(), &self.ctx.table_root)
    }

    pub fn new_scan(&self) -> FileStoreScan {
        FileStoreScan::new(
            self.ctx.file_io.clone(),
            &self.ctx.table_root,
            self.ctx.schema.clone(),
            &self.ctx.options,
        )
    }

    pub fn new_split_generator(&self) -> SplitGenerator {
        SplitGenerator::new(
            self.ctx.options.split_target_size,
            self.ctx.options.split_open_file_cost,
        )
    }

    /// Plan the latest snapshot into splits, shaped per table kind.
    pub fn plan_splits(&self, scan: &FileStoreScan) -> Result<Vec<DataSplit>> {
        let plan = scan.plan()?;
        let generator = self.new_split_generator();
        Ok(match self.kind {
            TableKind::AppendOnly => generator.append_splits(&plan),
            TableKind::ChangelogWithKey | TableKind::ChangelogValueCount => {
                generator.merge_tree_splits(&plan)
            }
        })
    }

    pub fn new_commit(&self, commit_user: impl Into<String>) -> FileStoreCommit {
        FileStoreCommit::new(
            self.ctx.file_io.clone(),
            &self.ctx.table_root,
            self.ctx.schema.partition_type(),
            self.ctx.options.clone(),
            commit_user.into(),
            self.ctx.schema.id,
        )
    }

    pub fn new_write(
        &self,
        commit_user: impl Into<String>,
        executor: Arc<CompactExecutor>,
    ) -> Result<TableWrite> {
        TableWrite::new(self.ctx.clone(), self.kind, commit_user.into(), executor)
    }

    pub fn new_read(&self) -> TableRead {
        TableRead::new(self.ctx.clone(), self.kind)
    }

    pub fn new_expire(&self) -> SnapshotExpire {
        SnapshotExpire::new(
            self.ctx.file_io.clone(),
            &self.ctx.table_root,
            self.ctx.schema.partition_type(),
            &self.ctx.options,
        )
    }

    pub fn new_orphan_files_clean(&self, older_than_millis: i64) -> OrphanFilesClean {
        OrphanFilesClean::new(
            self.ctx.file_io.clone(),
            &self.ctx.table_root,
            self.ctx.schema.partition_type(),
            &self.ctx.options,
            older_than_millis,
        )
    }

    /// `None` unless `partition.expiration-time` is configured.
    pub fn new_partition_expire(&self, commit_user: impl Into<String>) -> Option<PartitionExpire> {
        let expiration = self.ctx.options.partition_expiration_time?;
        let extractor = PartitionTimeExtractor::new(
            self.ctx.options.partition_timestamp_pattern.clone(),
            self.ctx.options.partition_timestamp_formatter.clone(),
        );
        Some(PartitionExpire::new(
            &self.ctx.schema.partition_type(),
            expiration,
            self.ctx.options.partition_expiration_check_interval,
            extractor,
            self.new_scan(),
            self.new_commit(commit_user),
        ))
    }
}

fn bucket_of(bucket_key: &Row, total_buckets: usize) -> usize {
    let hash = BUCKET_CRC.checksum(&bucket_key.canonical_bytes());
    hash as usize % total_buckets
}

enum BucketWriter {
    MergeTree(MergeTreeWriter),
    Append(AppendOnlyBucketWriter),
}

/// Rolling plain-row writer for one append-only bucket; rows keep their
/// arrival order and take increasing sequence numbers for incremental
/// reads.
struct AppendOnlyBucketWriter {
    factory: RowFileWriterFactory,
    current: Option<RowFileWriter>,
    next_sequence: i64,
    new_files: Vec<DataFileMeta>,
}

impl AppendOnlyBucketWriter {
    fn write(&mut self, row: &Row) -> Result<()> {
        if self.current.is_none() {
            self.current = Some(self.factory.create(self.next_sequence)?);
        }
        let writer = self.current.as_mut().expect("writer just created");
        writer.write(row)?;
        self.next_sequence += 1;
        if writer.estimated_bytes() as u64 >= self.factory.target_file_size() {
            let finished = self.current.take().expect("writer present");
            self.new_files.push(finished.close()?);
        }
        Ok(())
    }

    fn prepare_commit(&mut self) -> Result<Vec<DataFileMeta>> {
        if let Some(writer) = self.current.take() {
            if writer.row_count() > 0 {
                self.new_files.push(writer.close()?);
            } else {
                writer.abort();
            }
        }
        Ok(std::mem::take(&mut self.new_files))
    }
}

/// Routes rows to per-`(partition, bucket)` writers and assembles the
/// committable at `prepare_commit`.
pub struct TableWrite {
    ctx: Arc<StoreContext>,
    kind: TableKind,
    executor: Arc<CompactExecutor>,
    writers: HashMap<(Vec<u8>, usize), (Row, BucketWriter)>,
    partition_indexes: Vec<usize>,
    key_indexes: Vec<usize>,
    bucket_key_indexes: Vec<usize>,
    sequence_field_index: Option<usize>,
    merge_factory: MergeFunctionFactory,
    scratch_root: PathBuf,
    write_only: bool,
}

impl TableWrite {
    fn new(
        ctx: Arc<StoreContext>,
        kind: TableKind,
        commit_user: String,
        executor: Arc<CompactExecutor>,
    ) -> Result<Self> {
        let schema = &ctx.schema;
        let options = &ctx.options;
        let partition_indexes = schema.field_indexes(&schema.partition_keys);
        let key_indexes = schema.field_indexes(&schema.trimmed_primary_keys());
        let bucket_key_indexes = schema.field_indexes(&schema.bucket_key_fields(options));
        let sequence_field_index = options
            .sequence_field
            .as_ref()
            .and_then(|name| schema.field_index(name));
        let merge_factory = match kind {
            TableKind::ChangelogWithKey => MergeFunctionFactory::from_options(schema, options)?,
            TableKind::ChangelogValueCount => MergeFunctionFactory::ValueCount,
            TableKind::AppendOnly => MergeFunctionFactory::Deduplicate, // unused
        };
        let scratch_root = std::env::temp_dir().join(format!("strata-{commit_user}"));
        Ok(TableWrite {
            write_only: ctx.options.write_only,
            ctx,
            kind,
            executor,
            writers: HashMap::new(),
            partition_indexes,
            key_indexes,
            bucket_key_indexes,
            sequence_field_index,
            merge_factory,
            scratch_root,
        })
    }

    pub fn write(&mut self, row: Row) -> Result<()> {
        self.write_kind(RowKind::Insert, row)
    }

    pub fn write_kind(&mut self, kind: RowKind, row: Row) -> Result<()> {
        let partition = row.project(&self.partition_indexes);
        let bucket_key = row.project(&self.bucket_key_indexes);
        let bucket = bucket_of(&bucket_key, self.ctx.options.bucket);
        let slot = (partition.canonical_bytes(), bucket);
        if !self.writers.contains_key(&slot) {
            let writer = self.create_bucket_writer(&partition, bucket)?;
            self.writers.insert(slot.clone(), (partition.clone(), writer));
        }
        let (_, writer) = self.writers.get_mut(&slot).expect("writer just inserted");

        match (self.kind, writer) {
            (TableKind::AppendOnly, BucketWriter::Append(writer)) => {
                if kind != RowKind::Insert {
                    return Err(Error::MergeUnsupported(
                        "append-only tables accept only insert records".to_string(),
                    ));
                }
                writer.write(&row)
            }
            (TableKind::ChangelogWithKey, BucketWriter::MergeTree(writer)) => {
                let key = row.project(&self.key_indexes);
                writer.write(kind, key, row)
            }
            (TableKind::ChangelogValueCount, BucketWriter::MergeTree(writer)) => {
                let count = if kind.is_add() { 1 } else { -1 };
                writer.write(
                    RowKind::Insert,
                    row,
                    Row::new(vec![Datum::BigInt(count)]),
                )
            }
            _ => unreachable!("writer shape always matches the table kind"),
        }
    }

    /// Restore the bucket's state from the latest snapshot and build the
    /// matching writer.
    fn create_bucket_writer(&self, partition: &Row, bucket: usize) -> Result<BucketWriter> {
        let restored = self.scan_existing_files(partition, bucket)?;
        debug!(
            bucket,
            restored = restored.len(),
            "creating bucket writer"
        );
        let ctx = &self.ctx;
        let path_factory = ctx.path_factory(partition, bucket);

        if self.kind == TableKind::AppendOnly {
            let factory = RowFileWriterFactory::new(
                ctx.file_io.clone(),
                ctx.schema.id,
                ctx.schema.row_type(),
                ctx.format.as_ref(),
                path_factory,
                ctx.options.target_file_size,
            )?;
            return Ok(BucketWriter::Append(AppendOnlyBucketWriter {
                factory,
                current: None,
                next_sequence: DataFileMeta::max_sequence_number(&restored) + 1,
                new_files: Vec::new(),
            }));
        }

        let (key_type, value_type) = self.key_value_types();
        let writer_factory = Arc::new(KeyValueFileWriterFactory::new(
            ctx.file_io.clone(),
            ctx.schema.id,
            key_type,
            value_type,
            ctx.format.as_ref(),
            path_factory.clone(),
            ctx.options.target_file_size,
        )?);
        let reader_factory = self.kv_reader_factory(partition, bucket);

        let max_sequence = DataFileMeta::max_sequence_number(&restored);
        let levels = Levels::new(restored, ctx.options.num_levels);
        let compact_manager: Box<dyn CompactManager> = if self.write_only {
            Box::new(NoopCompactManager::new(levels))
        } else {
            let rewriter: Arc<dyn crate::mergetree::compact::CompactRewriter> =
                if ctx.options.changelog_producer == ChangelogProducer::FullCompaction {
                    Arc::new(FullChangelogMergeTreeCompactRewriter {
                        inner: MergeTreeCompactRewriter {
                            reader_factory: reader_factory.clone(),
                            writer_factory: writer_factory.clone(),
                            merge_factory: self.merge_factory.clone(),
                        },
                        max_level: ctx.options.num_levels - 1,
                    })
                } else {
                    Arc::new(MergeTreeCompactRewriter {
                        reader_factory: reader_factory.clone(),
                        writer_factory: writer_factory.clone(),
                        merge_factory: self.merge_factory.clone(),
                    })
                };
            Box::new(MergeTreeCompactManager::new(
                self.executor.clone(),
                levels,
                UniversalCompaction::new(
                    ctx.options.max_size_amplification_percent,
                    ctx.options.sorted_run_size_ratio,
                    ctx.options.num_sorted_run_compaction_trigger,
                ),
                ctx.options.num_sorted_run_stop_trigger,
                rewriter,
                ctx.file_io.clone(),
                path_factory,
            ))
        };

        let spillable = ctx
            .options
            .write_buffer_spillable(ctx.file_io.is_object_store());
        let buffer = WriteBuffer::new(
            ctx.options.write_buffer_size as usize,
            ctx.options.page_size as usize,
            spillable,
            ScratchSpace::new(&self.scratch_root)?,
        );
        // write-only writers also skip changelog emission
        let changelog_producer = if self.write_only {
            ChangelogProducer::None
        } else {
            ctx.options.changelog_producer
        };
        Ok(BucketWriter::MergeTree(MergeTreeWriter::new(
            MergeTreeWriterContext {
                buffer,
                compact_manager,
                writer_factory,
                reader_factory,
                merge_factory: self.merge_factory.clone(),
                changelog_producer,
                commit_force_compact: ctx.options.commit_force_compact,
                full_compaction_interval: ctx.options.changelog_compaction_interval,
                sort_spill_threshold: ctx.options.sort_spill_threshold,
                restored_max_sequence: max_sequence,
                // the value row of a value-count table is the count, not
                // the user row; a sequence field cannot apply there
                sequence_field_index: (self.kind == TableKind::ChangelogWithKey)
                    .then_some(self.sequence_field_index)
                    .flatten(),
            },
        )))
    }

    fn key_value_types(&self) -> (RowType, RowType) {
        match self.kind {
            TableKind::ChangelogValueCount => {
                (self.ctx.schema.row_type(), crate::io::count_value_type())
            }
            _ => (self.ctx.schema.key_type(), self.ctx.schema.row_type()),
        }
    }

    fn kv_reader_factory(&self, partition: &Row, bucket: usize) -> Arc<KeyValueFileReaderFactory> {
        match self.kind {
            TableKind::ChangelogValueCount => Arc::new(KeyValueFileReaderFactory::for_value_count(
                self.ctx.file_io.clone(),
                self.ctx.format.clone(),
                self.ctx.path_factory(partition, bucket),
                self.ctx.schema_manager.clone(),
                self.ctx.schema.clone(),
            )),
            _ => self.ctx.reader_factory(partition, bucket),
        }
    }

    fn scan_existing_files(&self, partition: &Row, bucket: usize) -> Result<Vec<DataFileMeta>> {
        let mut scan = FileStoreScan::new(
            self.ctx.file_io.clone(),
            &self.ctx.table_root,
            self.ctx.schema.clone(),
            &self.ctx.options,
        )
        .with_bucket(bucket);
        if !partition.is_empty() {
            let filter = Predicate::and(
                partition
                    .fields()
                    .iter()
                    .enumerate()
                    .map(|(i, datum)| {
                        Predicate::equal(
                            i,
                            self.ctx.schema.partition_keys[i].clone(),
                            datum.clone(),
                        )
                    })
                    .collect(),
            );
            scan = scan.with_partition_filter(filter);
        }
        Ok(scan.plan()?.files.into_iter().map(|e| e.file).collect())
    }

    /// Trigger a compaction in every merge-tree bucket and wait for the
    /// outcomes; they surface in the next `prepare_commit`.
    pub fn compact(&mut self, full: bool) -> Result<()> {
        for (_, (_, writer)) in self.writers.iter_mut() {
            if let BucketWriter::MergeTree(writer) = writer {
                writer.compact(full)?;
            }
        }
        Ok(())
    }

    /// Flush every bucket and assemble the committable for `identifier`.
    pub fn prepare_commit(
        &mut self,
        wait_compaction: bool,
        identifier: i64,
    ) -> Result<ManifestCommittable> {
        let mut committable = ManifestCommittable::new(identifier);
        for ((_, bucket), (partition, writer)) in self.writers.iter_mut() {
            let message = match writer {
                BucketWriter::Append(writer) => CommitMessage {
                    partition: partition.clone(),
                    bucket: *bucket,
                    new_files: writer.prepare_commit()?,
                    ..Default::default()
                },
                BucketWriter::MergeTree(writer) => {
                    let (new_files, compact) = writer.prepare_commit(wait_compaction)?;
                    CommitMessage {
                        partition: partition.clone(),
                        bucket: *bucket,
                        new_files: new_files.new_files,
                        changelog_files: new_files.changelog_files,
                        compact_before: compact.compact_before,
                        compact_after: compact.compact_after,
                        compact_changelog: compact.compact_changelog,
                    }
                }
            };
            if !message.new_files.is_empty()
                || !message.changelog_files.is_empty()
                || !message.compact_before.is_empty()
                || !message.compact_after.is_empty()
                || !message.compact_changelog.is_empty()
            {
                committable.add_message(message);
            }
        }
        Ok(committable)
    }

    /// Cancel in-flight work; cancelled compaction outputs are unlinked.
    pub fn close(&mut self) -> Result<()> {
        for (_, (_, writer)) in self.writers.iter_mut() {
            if let BucketWriter::MergeTree(writer) = writer {
                writer.close()?;
            }
        }
        self.writers.clear();
        Ok(())
    }
}

/// Reading side of a table: builds per-split readers honoring projection
/// and filter pushdown.
pub struct TableRead {
    ctx: Arc<StoreContext>,
    kind: TableKind,
    projection: Option<Vec<usize>>,
    filter: Option<Predicate>,
    with_row_kind: bool,
}

impl TableRead {
    fn new(ctx: Arc<StoreContext>, kind: TableKind) -> Self {
        TableRead {
            ctx,
            kind,
            projection: None,
            filter: None,
            with_row_kind: false,
        }
    }

    /// Project output rows to the given table-field positions.
    pub fn with_projection(mut self, projection: Vec<usize>) -> Self {
        self.projection = Some(projection);
        self
    }

    /// Row-level filter; for primary-key tables it applies after merging.
    pub fn with_filter(mut self, filter: Predicate) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Prepend a virtual `rowkind` column (the audit-log shape).
    pub fn with_row_kind(mut self) -> Self {
        self.with_row_kind = true;
        self
    }

    pub fn create_reader(
        &self,
        split: &DataSplit,
    ) -> Result<Box<dyn Iterator<Item = Result<Row>> + Send>> {
        match self.kind {
            TableKind::AppendOnly => {
                let factory = self.ctx.format.create_reader_factory(
                    &self.ctx.schema.row_type(),
                    self.projection.clone(),
                    self.filter.clone(),
                )?;
                let path_factory = self.ctx.path_factory(&split.partition, split.bucket);
                let reader = ConcatRecordReader::new(
                    self.ctx.file_io.clone(),
                    factory,
                    path_factory,
                    split.files.clone(),
                );
                if self.with_row_kind {
                    // append streams only ever carry inserts
                    Ok(Box::new(reader.map(|item| {
                        item.map(|row| {
                            let mut fields = Vec::with_capacity(row.len() + 1);
                            fields.push(Datum::String(RowKind::Insert.short_string().to_string()));
                            fields.extend(row.0);
                            Row::new(fields)
                        })
                    })))
                } else {
                    Ok(Box::new(reader))
                }
            }
            TableKind::ChangelogWithKey | TableKind::ChangelogValueCount => {
                let reader_factory = self.kv_reader_factory(&split.partition, split.bucket);
                let (merge_factory, shape) = match self.kind {
                    TableKind::ChangelogValueCount => (
                        MergeFunctionFactory::ValueCount,
                        ReadShape::ValueCount {
                            with_row_kind: self.with_row_kind,
                        },
                    ),
                    _ => (
                        MergeFunctionFactory::from_options(&self.ctx.schema, &self.ctx.options)?,
                        ReadShape::ValueContent {
                            with_row_kind: self.with_row_kind,
                        },
                    ),
                };
                let mut read = KeyValueTableRead::new(reader_factory, merge_factory, shape);
                if let Some(filter) = &self.filter {
                    read = read.with_filter(filter.clone());
                }
                let reader = read.create_reader(split)?;
                match self.projection.clone() {
                    None => Ok(reader),
                    Some(mut projection) => {
                        if self.with_row_kind {
                            // account for the prepended rowkind column
                            projection = std::iter::once(0)
                                .chain(projection.into_iter().map(|i| i + 1))
                                .collect();
                        }
                        Ok(Box::new(reader.map(move |row| {
                            row.map(|row| row.project(&projection))
                        })))
                    }
                }
            }
        }
    }

    fn kv_reader_factory(&self, partition: &Row, bucket: usize) -> Arc<KeyValueFileReaderFactory> {
        match self.kind {
            TableKind::ChangelogValueCount => Arc::new(KeyValueFileReaderFactory::for_value_count(
                self.ctx.file_io.clone(),
                self.ctx.format.clone(),
                self.ctx.path_factory(partition, bucket),
                self.ctx.schema_manager.clone(),
                self.ctx.schema.clone(),
            )),
            _ => self.ctx.reader_factory(partition, bucket),
        }
    }
}
