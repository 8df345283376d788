pub mod split;

use std::{collections::HashMap, path::Path, sync::Arc};

use tracing::debug;

use crate::{
    error::{Error, Result},
    fs::FileIO,
    manifest::{merge_entries, FileKind, ManifestEntry, ManifestFile, ManifestFileMeta, ManifestList},
    options::CoreOptions,
    predicate::Predicate,
    row::Datum,
    schema::{RowType, SchemaManager, TableSchema},
    snapshot::{Snapshot, SnapshotManager},
    stats::{FieldStats, StatsMap},
};

/// Which part of a snapshot a plan covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanKind {
    /// The merged table state: base plus delta.
    All,
    /// Only the files the snapshot itself added.
    Delta,
    /// The changelog files the snapshot produced.
    Changelog,
}

/// The outcome of a scan: surviving ADD entries of one snapshot.
#[derive(Debug, Clone)]
pub struct Plan {
    pub snapshot_id: Option<i64>,
    pub files: Vec<ManifestEntry>,
}

/// Turns a snapshot into filtered manifest entries, honoring partition,
/// bucket, key and value predicates through per-file statistics.
pub struct FileStoreScan {
    snapshot_manager: SnapshotManager,
    schema_manager: SchemaManager,
    manifest_file: ManifestFile,
    manifest_list: ManifestList,
    table_schema: TableSchema,
    key_type: RowType,
    value_type: RowType,
    partition_type: RowType,

    kind: ScanKind,
    snapshot_id: Option<i64>,
    partition_filter: Option<Predicate>,
    bucket_filter: Option<usize>,
    key_filter: Option<Predicate>,
    value_filter: Option<Predicate>,
}

impl FileStoreScan {
    pub fn new(
        file_io: Arc<dyn FileIO>,
        table_root: &Path,
        table_schema: TableSchema,
        options: &CoreOptions,
    ) -> Self {
        let partition_type = table_schema.partition_type();
        FileStoreScan {
            snapshot_manager: SnapshotManager::new(file_io.clone(), table_root),
            schema_manager: SchemaManager::new(file_io.clone(), table_root),
            manifest_file: ManifestFile::new(
                file_io.clone(),
                table_root,
                partition_type.clone(),
                options.manifest_target_file_size,
                table_schema.id,
            ),
            manifest_list: ManifestList::new(file_io, table_root),
            key_type: table_schema.key_type(),
            value_type: table_schema.row_type(),
            partition_type,
            table_schema,
            kind: ScanKind::All,
            snapshot_id: None,
            partition_filter: None,
            bucket_filter: None,
            key_filter: None,
            value_filter: None,
        }
    }

    pub fn with_kind(mut self, kind: ScanKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_snapshot(mut self, snapshot_id: i64) -> Self {
        self.snapshot_id = Some(snapshot_id);
        self
    }

    /// Predicate over the partition columns, by partition position.
    pub fn with_partition_filter(mut self, predicate: Predicate) -> Self {
        self.partition_filter = Some(predicate);
        self
    }

    pub fn with_bucket(mut self, bucket: usize) -> Self {
        self.bucket_filter = Some(bucket);
        self
    }

    /// Predicate over the trimmed primary key columns. Only meaningful for
    /// primary-key tables.
    pub fn with_key_filter(mut self, predicate: Predicate) -> Self {
        self.key_filter = Some(predicate);
        self
    }

    /// Predicate over the value columns. Only applied for tables without a
    /// primary key: older values of an unchanged key may be shadowed by
    /// newer files, so pruning by value stats would be unsound under a
    /// merge engine.
    pub fn with_value_filter(mut self, predicate: Predicate) -> Self {
        self.value_filter = Some(predicate);
        self
    }

    pub fn snapshot_manager(&self) -> &SnapshotManager {
        &self.snapshot_manager
    }

    pub fn plan(&self) -> Result<Plan> {
        let snapshot = match self.snapshot_id {
            Some(id) => Some(self.snapshot_manager.snapshot(id)?),
            None => self.snapshot_manager.latest_snapshot()?,
        };
        let Some(snapshot) = snapshot else {
            return Ok(Plan {
                snapshot_id: None,
                files: Vec::new(),
            });
        };

        let metas = self.manifests_of(&snapshot)?;
        let mut entries = Vec::new();
        for meta in metas {
            if !self.manifest_may_match(&meta) {
                continue;
            }
            for entry in self.manifest_file.read(&meta.file_name)? {
                if self.entry_matches(&entry) {
                    entries.push(entry);
                }
            }
        }

        let merged = merge_entries(entries);
        let mut files: Vec<ManifestEntry> = merged
            .into_iter()
            .filter(|e| e.kind == FileKind::Add)
            .collect();
        files.retain(|entry| self.file_may_match(entry));
        debug!(
            snapshot = snapshot.id,
            files = files.len(),
            kind = ?self.kind,
            "planned scan"
        );
        Ok(Plan {
            snapshot_id: Some(snapshot.id),
            files,
        })
    }

    fn manifests_of(&self, snapshot: &Snapshot) -> Result<Vec<ManifestFileMeta>> {
        match self.kind {
            ScanKind::All => snapshot.data_manifests(&self.manifest_list),
            ScanKind::Delta => self.manifest_list.read(&snapshot.delta_manifest_list),
            ScanKind::Changelog => match &snapshot.changelog_manifest_list {
                Some(list) => self.manifest_list.read(list),
                None => Ok(Vec::new()),
            },
        }
    }

    fn manifest_may_match(&self, meta: &ManifestFileMeta) -> bool {
        let Some(filter) = &self.partition_filter else {
            return true;
        };
        if meta.partition_stats.is_empty() {
            return true;
        }
        let total = meta.num_added_files + meta.num_deleted_files;
        filter.test_stats(total.max(1), &|pos| {
            stats_by_position(&meta.partition_stats, &self.partition_type, pos)
        })
    }

    fn entry_matches(&self, entry: &ManifestEntry) -> bool {
        if let Some(bucket) = self.bucket_filter {
            if entry.bucket != bucket {
                return false;
            }
        }
        if let Some(filter) = &self.partition_filter {
            if !filter.test_row(&entry.partition) {
                return false;
            }
        }
        true
    }

    fn file_may_match(&self, entry: &ManifestEntry) -> bool {
        let file = &entry.file;
        if let Some(filter) = &self.key_filter {
            let passes = filter.test_stats(file.row_count, &|pos| {
                stats_by_position(&file.key_stats, &self.key_type, pos)
            });
            if !passes {
                return false;
            }
        }
        if let Some(filter) = &self.value_filter {
            let passes = filter.test_stats(file.row_count, &|pos| {
                stats_by_position(&file.value_stats, &self.value_type, pos)
            });
            if !passes {
                return false;
            }
        }
        true
    }

    /// Distinct partitions present in the current state; drives partition
    /// expiration.
    pub fn list_partitions(&self) -> Result<Vec<crate::row::Row>> {
        let plan = self.plan()?;
        let mut seen: HashMap<Vec<u8>, crate::row::Row> = HashMap::new();
        for entry in plan.files {
            seen.entry(entry.partition.canonical_bytes())
                .or_insert(entry.partition);
        }
        Ok(seen.into_values().collect())
    }

    /// The schema a data file was written under, for evolution-aware reads.
    pub fn data_schema(&self, schema_id: i64) -> Result<TableSchema> {
        if schema_id == self.table_schema.id {
            Ok(self.table_schema.clone())
        } else {
            self.schema_manager.schema(schema_id)
        }
    }
}

/// Resolve positional stats, widening old stats to the current field type
/// so comparisons against literals stay meaningful after evolution.
fn stats_by_position(stats: &StatsMap, row_type: &RowType, pos: usize) -> Option<FieldStats> {
    let field = row_type.fields().get(pos)?;
    let raw = stats.get(&field.id)?;
    let cast = |datum: &Datum| datum.cast(field.data_type).unwrap_or(Datum::Null);
    Some(FieldStats {
        min: cast(&raw.min),
        max: cast(&raw.max),
        null_count: raw.null_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        commit::{CommitMessage, FileStoreCommit, ManifestCommittable},
        fs::local::LocalFileIO,
        io::DataFileMeta,
        predicate::{CompareOp, Predicate},
        row::Row,
        schema::{column, ColumnDef, SchemaManager, TableDefinition},
        stats::StatsCollector,
        types::DataType,
    };

    fn schema(dir: &Path, file_io: Arc<dyn FileIO>) -> TableSchema {
        SchemaManager::new(file_io, dir)
            .create_table(TableDefinition {
                columns: vec![
                    ColumnDef {
                        nullable: false,
                        ..column("p", DataType::String)
                    },
                    ColumnDef {
                        nullable: false,
                        ..column("k", DataType::BigInt)
                    },
                    column("v", DataType::BigInt),
                ],
                partition_keys: vec!["p".to_string()],
                primary_keys: vec!["p".to_string(), "k".to_string()],
                ..Default::default()
            })
            .unwrap()
    }

    fn data_file(name: &str, key_min: i64, key_max: i64) -> DataFileMeta {
        let mut keys = StatsCollector::new(vec![1]);
        keys.collect(&Row::new(vec![Datum::BigInt(key_min)]));
        keys.collect(&Row::new(vec![Datum::BigInt(key_max)]));
        DataFileMeta {
            file_name: name.to_string(),
            file_size: 10,
            row_count: 2,
            min_key: Row::new(vec![Datum::BigInt(key_min)]),
            max_key: Row::new(vec![Datum::BigInt(key_max)]),
            key_stats: keys.finish(),
            value_stats: StatsMap::new(),
            min_sequence_number: 0,
            max_sequence_number: 1,
            schema_id: 0,
            level: 0,
            extra_files: Vec::new(),
            creation_time: 0,
        }
    }

    fn commit_files(dir: &Path, schema: &TableSchema, partition: &str, files: Vec<DataFileMeta>) {
        let file_io: Arc<dyn FileIO> = Arc::new(LocalFileIO::new());
        let commit = FileStoreCommit::new(
            file_io,
            dir,
            schema.partition_type(),
            CoreOptions::defaults(),
            "scan-test".to_string(),
            schema.id,
        );
        let mut committable = ManifestCommittable::new(1);
        committable.add_message(CommitMessage {
            partition: Row::new(vec![Datum::String(partition.to_string())]),
            bucket: 0,
            new_files: files,
            ..Default::default()
        });
        commit.commit(&committable).unwrap();
    }

    #[test]
    fn plan_filters_by_partition_and_key_stats() {
        let dir = tempfile::tempdir().unwrap();
        let file_io: Arc<dyn FileIO> = Arc::new(LocalFileIO::new());
        let schema = schema(dir.path(), file_io.clone());
        commit_files(
            dir.path(),
            &schema,
            "p1",
            vec![data_file("low", 0, 9), data_file("high", 100, 199)],
        );
        commit_files(dir.path(), &schema, "p2", vec![data_file("other", 0, 9)]);

        let options = CoreOptions::defaults();
        let all = FileStoreScan::new(file_io.clone(), dir.path(), schema.clone(), &options)
            .plan()
            .unwrap();
        assert_eq!(all.files.len(), 3);

        let partition_only =
            FileStoreScan::new(file_io.clone(), dir.path(), schema.clone(), &options)
                .with_partition_filter(Predicate::equal(0, "p", Datum::String("p1".into())))
                .plan()
                .unwrap();
        assert_eq!(partition_only.files.len(), 2);

        let keyed = FileStoreScan::new(file_io, dir.path(), schema, &options)
            .with_partition_filter(Predicate::equal(0, "p", Datum::String("p1".into())))
            .with_key_filter(Predicate::leaf(
                0,
                "k",
                CompareOp::GtEq,
                Some(Datum::BigInt(50)),
            ))
            .plan()
            .unwrap();
        let names: Vec<&str> = keyed.files.iter().map(|e| e.file.file_name.as_str()).collect();
        assert_eq!(names, vec!["high"]);
    }

    #[test]
    fn delta_plan_sees_only_new_files() {
        let dir = tempfile::tempdir().unwrap();
        let file_io: Arc<dyn FileIO> = Arc::new(LocalFileIO::new());
        let schema = schema(dir.path(), file_io.clone());
        commit_files(dir.path(), &schema, "p1", vec![data_file("first", 0, 9)]);
        commit_files(dir.path(), &schema, "p1", vec![data_file("second", 10, 19)]);

        let options = CoreOptions::defaults();
        let plan = FileStoreScan::new(file_io, dir.path(), schema, &options)
            .with_kind(ScanKind::Delta)
            .with_snapshot(2)
            .plan()
            .unwrap();
        let names: Vec<&str> = plan.files.iter().map(|e| e.file.file_name.as_str()).collect();
        assert_eq!(names, vec!["second"]);
    }
}
