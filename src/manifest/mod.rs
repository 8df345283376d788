use std::{
    collections::BTreeMap,
    io::Write as _,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    error::Result,
    fs::{retry_read, FileIO},
    id::FileNames,
    io::DataFileMeta,
    row::Row,
    schema::RowType,
    stats::{StatsCollector, StatsMap},
};

/// Whether an entry introduces or retires a data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    #[serde(rename = "ADD")]
    Add,
    #[serde(rename = "DELETE")]
    Delete,
}

/// One data-file event recorded in a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub kind: FileKind,
    pub partition: Row,
    pub bucket: usize,
    pub total_buckets: usize,
    pub file: DataFileMeta,
}

/// Key identifying the data file an entry refers to.
pub type EntryIdentifier = (Vec<u8>, usize, String);

impl ManifestEntry {
    pub fn add(partition: Row, bucket: usize, total_buckets: usize, file: DataFileMeta) -> Self {
        ManifestEntry {
            kind: FileKind::Add,
            partition,
            bucket,
            total_buckets,
            file,
        }
    }

    pub fn delete(partition: Row, bucket: usize, total_buckets: usize, file: DataFileMeta) -> Self {
        ManifestEntry {
            kind: FileKind::Delete,
            partition,
            bucket,
            total_buckets,
            file,
        }
    }

    pub fn identifier(&self) -> EntryIdentifier {
        (
            self.partition.canonical_bytes(),
            self.bucket,
            self.file.file_name.clone(),
        )
    }
}

/// Apply entries in order with ADD/DELETE semantics keyed by file name.
/// A DELETE cancels the matching ADD; a DELETE with no visible ADD is kept
/// so that merging a suffix of manifests stays correct.
pub fn merge_entries<I>(entries: I) -> Vec<ManifestEntry>
where
    I: IntoIterator<Item = ManifestEntry>,
{
    let mut map = ordered::EntryMap::new();
    for entry in entries {
        match entry.kind {
            FileKind::Add => map.insert(entry.identifier(), entry),
            FileKind::Delete => {
                if !map.remove(&entry.identifier()) {
                    map.insert(entry.identifier(), entry);
                }
            }
        }
    }
    map.into_values()
}

/// Insertion-ordered map specialized for entry merging.
mod ordered {
    use std::collections::HashMap;

    use super::{EntryIdentifier, ManifestEntry};

    pub struct EntryMap {
        order: Vec<EntryIdentifier>,
        map: HashMap<EntryIdentifier, ManifestEntry>,
    }

    impl EntryMap {
        pub fn new() -> Self {
            EntryMap {
                order: Vec::new(),
                map: HashMap::new(),
            }
        }

        pub fn insert(&mut self, key: EntryIdentifier, entry: ManifestEntry) {
            if self.map.insert(key.clone(), entry).is_none() {
                self.order.push(key);
            }
        }

        pub fn remove(&mut self, key: &EntryIdentifier) -> bool {
            self.map.remove(key).is_some()
        }

        pub fn into_values(mut self) -> Vec<ManifestEntry> {
            self.order
                .drain(..)
                .filter_map(|key| self.map.remove(&key))
                .collect()
        }
    }
}

/// Metadata of one manifest file, stored in a manifest list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestFileMeta {
    pub file_name: String,
    pub file_size: u64,
    pub num_added_files: u64,
    pub num_deleted_files: u64,
    /// Stats over the partition columns of the contained entries, keyed by
    /// partition field id. Lets a scan skip whole manifests.
    pub partition_stats: StatsMap,
    pub schema_id: i64,
}

/// Reads and writes manifest files: JSON-lines of [`ManifestEntry`],
/// split at `manifest.target-file-size`.
pub struct ManifestFile {
    file_io: Arc<dyn FileIO>,
    dir: PathBuf,
    partition_type: RowType,
    target_size: u64,
    schema_id: i64,
    names: FileNames,
}

impl ManifestFile {
    pub fn new(
        file_io: Arc<dyn FileIO>,
        table_root: &Path,
        partition_type: RowType,
        target_size: u64,
        schema_id: i64,
    ) -> Self {
        ManifestFile {
            file_io,
            dir: table_root.join("manifest"),
            partition_type,
            target_size,
            schema_id,
            names: FileNames::new(),
        }
    }

    fn path(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    /// Write entries into one or more manifest objects bounded by the
    /// target size.
    pub fn write(&self, entries: &[ManifestEntry]) -> Result<Vec<ManifestFileMeta>> {
        let mut metas = Vec::new();
        let mut chunk: Vec<&ManifestEntry> = Vec::new();
        let mut chunk_bytes: u64 = 0;
        for entry in entries {
            let line = serde_json::to_vec(entry)?;
            let line_len = line.len() as u64 + 1;
            if !chunk.is_empty() && chunk_bytes + line_len > self.target_size {
                metas.push(self.write_one(&chunk)?);
                chunk.clear();
                chunk_bytes = 0;
            }
            chunk.push(entry);
            chunk_bytes += line_len;
        }
        if !chunk.is_empty() {
            metas.push(self.write_one(&chunk)?);
        }
        Ok(metas)
    }

    fn write_one(&self, entries: &[&ManifestEntry]) -> Result<ManifestFileMeta> {
        let file_name = self.names.manifest();
        let path = self.path(&file_name);
        let mut out = self.file_io.create(&path, false)?;
        let mut added = 0u64;
        let mut deleted = 0u64;
        let mut stats = StatsCollector::new(self.partition_type.field_ids());
        for entry in entries {
            let line = serde_json::to_vec(entry)?;
            out.write_all(&line)?;
            out.write_all(b"\n")?;
            match entry.kind {
                FileKind::Add => added += 1,
                FileKind::Delete => deleted += 1,
            }
            stats.collect(&entry.partition);
        }
        out.flush()?;
        drop(out);
        let file_size = self.file_io.file_size(&path)?;
        Ok(ManifestFileMeta {
            file_name,
            file_size,
            num_added_files: added,
            num_deleted_files: deleted,
            partition_stats: stats.finish(),
            schema_id: self.schema_id,
        })
    }

    pub fn read(&self, file_name: &str) -> Result<Vec<ManifestEntry>> {
        let path = self.path(file_name);
        let text = retry_read(|| self.file_io.read_to_string(&path))?;
        let mut entries = Vec::new();
        for line in text.lines().filter(|l| !l.is_empty()) {
            entries.push(serde_json::from_str(line)?);
        }
        Ok(entries)
    }

    /// Read tolerating a missing or unreadable file; a concurrent expire
    /// may have removed it.
    pub fn try_read(&self, file_name: &str) -> Vec<ManifestEntry> {
        match self.read(file_name) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(file_name, %err, "failed to read manifest file");
                Vec::new()
            }
        }
    }

    pub fn delete(&self, file_name: &str) {
        self.file_io.delete_quietly(&self.path(file_name));
    }

    /// Compact many small manifests into fewer. Produces new manifest
    /// objects (originals stay, earlier snapshots still reference them) by
    /// re-emitting merged entries; ADD+DELETE pairs for the same file
    /// cancel out.
    pub fn merge(
        &self,
        metas: Vec<ManifestFileMeta>,
        min_count_to_merge: usize,
        _target_size: u64,
    ) -> Result<Vec<ManifestFileMeta>> {
        if metas.len() < min_count_to_merge {
            return Ok(metas);
        }
        let mut entries = Vec::new();
        for meta in &metas {
            entries.extend(self.read(&meta.file_name)?);
        }
        let merged = merge_entries(entries);
        self.write(&merged)
    }
}

/// Reads and writes manifest lists: one JSON document naming the manifests
/// of a snapshot, in order.
pub struct ManifestList {
    file_io: Arc<dyn FileIO>,
    dir: PathBuf,
    names: FileNames,
}

impl ManifestList {
    pub fn new(file_io: Arc<dyn FileIO>, table_root: &Path) -> Self {
        ManifestList {
            file_io,
            dir: table_root.join("manifest"),
            names: FileNames::new(),
        }
    }

    fn path(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    pub fn write(&self, metas: &[ManifestFileMeta]) -> Result<String> {
        let file_name = self.names.manifest_list();
        let content = serde_json::to_vec_pretty(metas)?;
        let mut out = self.file_io.create(&self.path(&file_name), false)?;
        out.write_all(&content)?;
        out.flush()?;
        Ok(file_name)
    }

    pub fn read(&self, file_name: &str) -> Result<Vec<ManifestFileMeta>> {
        let path = self.path(file_name);
        let text = retry_read(|| self.file_io.read_to_string(&path))?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn try_read(&self, file_name: &str) -> Vec<ManifestFileMeta> {
        match self.read(file_name) {
            Ok(metas) => metas,
            Err(err) => {
                warn!(file_name, %err, "failed to read manifest list");
                Vec::new()
            }
        }
    }

    pub fn delete(&self, file_name: &str) {
        self.file_io.delete_quietly(&self.path(file_name));
    }
}

/// Combined partition stats over a set of manifest metas.
pub fn combined_partition_stats(metas: &[ManifestFileMeta]) -> StatsMap {
    let mut combined: BTreeMap<i32, crate::stats::FieldStats> = BTreeMap::new();
    for meta in metas {
        for (field_id, stats) in &meta.partition_stats {
            combined
                .entry(*field_id)
                .and_modify(|existing| *existing = existing.merge(stats))
                .or_insert_with(|| stats.clone());
        }
    }
    combined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fs::local::LocalFileIO,
        row::Datum,
        schema::DataField,
        types::DataType,
    };

    fn file_meta(name: &str) -> DataFileMeta {
        DataFileMeta {
            file_name: name.to_string(),
            file_size: 100,
            row_count: 10,
            min_key: Row::new(vec![Datum::BigInt(0)]),
            max_key: Row::new(vec![Datum::BigInt(9)]),
            key_stats: StatsMap::new(),
            value_stats: StatsMap::new(),
            min_sequence_number: 0,
            max_sequence_number: 9,
            schema_id: 0,
            level: 0,
            extra_files: Vec::new(),
            creation_time: 0,
        }
    }

    fn partition(p: &str) -> Row {
        Row::new(vec![Datum::String(p.to_string())])
    }

    fn partition_type() -> RowType {
        RowType::new(vec![DataField::new(0, "p", DataType::String)])
    }

    fn manifest_file(dir: &Path) -> ManifestFile {
        ManifestFile::new(
            Arc::new(LocalFileIO::new()),
            dir,
            partition_type(),
            8 * 1024 * 1024,
            0,
        )
    }

    #[test]
    fn write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = manifest_file(dir.path());
        let entries = vec![
            ManifestEntry::add(partition("p1"), 0, 1, file_meta("data-1")),
            ManifestEntry::delete(partition("p1"), 0, 1, file_meta("data-0")),
        ];
        let metas = manifest.write(&entries).unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].num_added_files, 1);
        assert_eq!(metas[0].num_deleted_files, 1);
        assert_eq!(
            metas[0].partition_stats[&0].min,
            Datum::String("p1".into())
        );
        assert_eq!(manifest.read(&metas[0].file_name).unwrap(), entries);
    }

    #[test]
    fn target_size_splits_output() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = ManifestFile::new(
            Arc::new(LocalFileIO::new()),
            dir.path(),
            partition_type(),
            // each serialized entry is a few hundred bytes
            600,
            0,
        );
        let entries: Vec<ManifestEntry> = (0..10)
            .map(|i| ManifestEntry::add(partition("p1"), 0, 1, file_meta(&format!("data-{i}"))))
            .collect();
        let metas = manifest.write(&entries).unwrap();
        assert!(metas.len() > 1, "expected split, got {}", metas.len());
        let total: u64 = metas.iter().map(|m| m.num_added_files).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn merge_cancels_add_delete_pairs() {
        let entries = vec![
            ManifestEntry::add(partition("p1"), 0, 1, file_meta("a")),
            ManifestEntry::add(partition("p1"), 0, 1, file_meta("b")),
            ManifestEntry::delete(partition("p1"), 0, 1, file_meta("a")),
            // delete without a visible add survives
            ManifestEntry::delete(partition("p1"), 0, 1, file_meta("c")),
        ];
        let merged = merge_entries(entries);
        let names: Vec<&str> = merged.iter().map(|e| e.file.file_name.as_str()).collect();
        assert_eq!(names, vec!["b", "c"]);
        assert_eq!(merged[1].kind, FileKind::Delete);
    }

    #[test]
    fn merge_respects_min_count() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = manifest_file(dir.path());
        let metas_a = manifest
            .write(&[ManifestEntry::add(partition("p1"), 0, 1, file_meta("a"))])
            .unwrap();
        let metas_b = manifest
            .write(&[ManifestEntry::delete(partition("p1"), 0, 1, file_meta("a"))])
            .unwrap();
        let all: Vec<ManifestFileMeta> =
            metas_a.iter().chain(metas_b.iter()).cloned().collect();

        // below the threshold: unchanged
        let untouched = manifest.merge(all.clone(), 3, 8 << 20).unwrap();
        assert_eq!(untouched.len(), 2);

        // at the threshold: entries cancel, nothing left to reference
        let merged = manifest.merge(all, 2, 8 << 20).unwrap();
        assert!(merged.is_empty());
    }

    #[test]
    fn list_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = manifest_file(dir.path());
        let list = ManifestList::new(Arc::new(LocalFileIO::new()), dir.path());
        let metas = manifest
            .write(&[ManifestEntry::add(partition("p2"), 1, 2, file_meta("x"))])
            .unwrap();
        let name = list.write(&metas).unwrap();
        assert!(name.starts_with("manifest-list-"));
        assert_eq!(list.read(&name).unwrap(), metas);
        list.delete(&name);
        assert!(list.try_read(&name).is_empty());
    }
}
