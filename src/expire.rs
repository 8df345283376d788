use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::Arc,
};

use tracing::{debug, info, warn};

use crate::{
    error::Result,
    fs::FileIO,
    io::current_time_millis,
    manifest::{FileKind, ManifestEntry, ManifestFile, ManifestList},
    options::CoreOptions,
    partition::partition_path,
    schema::RowType,
    snapshot::SnapshotManager,
};

/// Retention-driven deletion of snapshots and the files only they
/// reference. At least one snapshot always remains, and the whole
/// procedure tolerates files already removed by a crashed or competing
/// expiration.
pub struct SnapshotExpire {
    file_io: Arc<dyn FileIO>,
    table_root: PathBuf,
    partition_type: RowType,
    snapshot_manager: SnapshotManager,
    manifest_file: ManifestFile,
    manifest_list: ManifestList,
    num_retained_min: usize,
    num_retained_max: usize,
    millis_retained: i64,
    default_partition_name: String,
}

impl SnapshotExpire {
    pub fn new(
        file_io: Arc<dyn FileIO>,
        table_root: &std::path::Path,
        partition_type: RowType,
        options: &CoreOptions,
    ) -> Self {
        SnapshotExpire {
            snapshot_manager: SnapshotManager::new(file_io.clone(), table_root),
            manifest_file: ManifestFile::new(
                file_io.clone(),
                table_root,
                partition_type.clone(),
                options.manifest_target_file_size,
                0,
            ),
            manifest_list: ManifestList::new(file_io.clone(), table_root),
            file_io,
            table_root: table_root.to_path_buf(),
            partition_type,
            num_retained_min: options.snapshot_num_retained_min,
            num_retained_max: options.snapshot_num_retained_max,
            millis_retained: options.snapshot_time_retained.as_millis() as i64,
            default_partition_name: options.partition_default_name.clone(),
        }
    }

    pub fn expire(&self) -> Result<()> {
        let Some(latest) = self.snapshot_manager.latest_snapshot_id()? else {
            return Ok(());
        };
        let Some(earliest) = self.snapshot_manager.earliest_snapshot_id()? else {
            return Ok(());
        };
        let now = current_time_millis();

        // find the earliest snapshot to retain; everything after it is
        // within the time threshold too
        let min_keep = (latest - self.num_retained_max as i64 + 1).max(earliest);
        for id in min_keep..=(latest - self.num_retained_min as i64) {
            if self.snapshot_manager.snapshot_exists(id)?
                && now - self.snapshot_manager.snapshot(id)?.time_millis <= self.millis_retained
            {
                return self.expire_until(earliest, id);
            }
        }

        // nothing inside the window survives by age; keep the minimum count
        self.expire_until(earliest, latest - self.num_retained_min as i64 + 1)
    }

    /// Expire snapshots in `[earliest, end_exclusive)`.
    pub fn expire_until(&self, earliest: i64, end_exclusive: i64) -> Result<()> {
        if end_exclusive <= earliest {
            // no expire; seed the hint so the next reader skips the listing
            if self.snapshot_manager.read_hint(crate::snapshot::EARLIEST).is_none() {
                let _ = self.snapshot_manager.commit_earliest_hint(earliest);
            }
            return Ok(());
        }

        // a previous crashed expiration may have removed a prefix already
        let mut begin_inclusive = earliest;
        for id in (earliest..end_exclusive).rev() {
            if !self.snapshot_manager.snapshot_exists(id)? {
                begin_inclusive = id + 1;
                break;
            }
        }
        debug!(begin_inclusive, end_exclusive, "snapshot expire range");

        // data files deleted by a snapshot are unused from that snapshot
        // on, hence the shifted range (begin, end]
        for id in (begin_inclusive + 1)..=end_exclusive {
            match self.snapshot_manager.snapshot(id) {
                Ok(snapshot) => self.expire_data_files(&snapshot.delta_manifest_list),
                Err(err) => warn!(id, %err, "skipping unreadable snapshot during expire"),
            }
        }

        // changelog files are only referenced by their own snapshot
        for id in begin_inclusive..end_exclusive {
            if let Ok(snapshot) = self.snapshot_manager.snapshot(id) {
                if let Some(changelog_list) = &snapshot.changelog_manifest_list {
                    for entry in self.read_entries_quietly(changelog_list) {
                        let path = self.bucket_dir(&entry).join(&entry.file.file_name);
                        self.file_io.delete_quietly(&path);
                    }
                }
            }
        }

        // manifests still referenced by the first retained snapshot survive
        let mut manifests_in_use: HashSet<String> = HashSet::new();
        if let Ok(retained) = self.snapshot_manager.snapshot(end_exclusive) {
            for meta in retained
                .data_manifests(&self.manifest_list)
                .unwrap_or_default()
            {
                manifests_in_use.insert(meta.file_name);
            }
        }

        let mut deleted_manifests: HashSet<String> = HashSet::new();
        for id in begin_inclusive..end_exclusive {
            let Ok(to_expire) = self.snapshot_manager.snapshot(id) else {
                continue;
            };
            let mut metas = self.manifest_list.try_read(&to_expire.base_manifest_list);
            metas.extend(self.manifest_list.try_read(&to_expire.delta_manifest_list));
            for meta in metas {
                if !manifests_in_use.contains(&meta.file_name)
                    && deleted_manifests.insert(meta.file_name.clone())
                {
                    self.manifest_file.delete(&meta.file_name);
                }
            }
            if let Some(changelog_list) = &to_expire.changelog_manifest_list {
                for meta in self.manifest_list.try_read(changelog_list) {
                    self.manifest_file.delete(&meta.file_name);
                }
                self.manifest_list.delete(changelog_list);
            }
            self.manifest_list.delete(&to_expire.base_manifest_list);
            self.manifest_list.delete(&to_expire.delta_manifest_list);

            self.file_io
                .delete_quietly(&self.snapshot_manager.snapshot_path(id));
        }

        info!(
            expired = end_exclusive - begin_inclusive,
            earliest = end_exclusive,
            "expired snapshots"
        );
        self.snapshot_manager.commit_earliest_hint(end_exclusive)?;
        Ok(())
    }

    /// Walk one delta's entries and delete the data files whose lifecycle
    /// ends inside the expiring range. A DELETE marks the file; a later ADD
    /// of the same name (a level upgrade) unmarks it.
    fn expire_data_files(&self, delta_manifest_list: &str) {
        let mut pending: HashMap<PathBuf, Vec<PathBuf>> = HashMap::new();
        for entry in self.read_entries_quietly(delta_manifest_list) {
            self.delete_data_file(&entry, &mut pending);
        }
        self.flush_pending(&mut pending);
    }

    fn delete_data_file(&self, entry: &ManifestEntry, pending: &mut HashMap<PathBuf, Vec<PathBuf>>) {
        let bucket_dir = self.bucket_dir(entry);
        let path = bucket_dir.join(&entry.file.file_name);
        match entry.kind {
            FileKind::Add => {
                pending.remove(&path);
            }
            FileKind::Delete => {
                let extra = entry
                    .file
                    .extra_files
                    .iter()
                    .map(|name| bucket_dir.join(name))
                    .collect();
                pending.insert(path, extra);
            }
        }
    }

    fn flush_pending(&self, pending: &mut HashMap<PathBuf, Vec<PathBuf>>) {
        for (path, extra_files) in pending.drain() {
            self.file_io.delete_quietly(&path);
            for extra in extra_files {
                self.file_io.delete_quietly(&extra);
            }
        }
    }

    fn bucket_dir(&self, entry: &ManifestEntry) -> PathBuf {
        let mut dir = self.table_root.clone();
        for segment in partition_path(
            &entry.partition,
            &self.partition_type,
            &self.default_partition_name,
        ) {
            dir = dir.join(segment);
        }
        dir.join(format!("bucket-{}", entry.bucket))
    }

    fn read_entries_quietly(&self, manifest_list_name: &str) -> Vec<ManifestEntry> {
        let mut entries = Vec::new();
        for meta in self.manifest_list.try_read(manifest_list_name) {
            entries.extend(self.manifest_file.try_read(&meta.file_name));
        }
        entries
    }
}

/// Removes files under `manifest/` and the bucket directories that no
/// snapshot references and that are older than a safety window. Collects
/// the debris of failed commits.
pub struct OrphanFilesClean {
    file_io: Arc<dyn FileIO>,
    table_root: PathBuf,
    snapshot_manager: SnapshotManager,
    manifest_file: ManifestFile,
    manifest_list: ManifestList,
    partition_type: RowType,
    default_partition_name: String,
    older_than_millis: i64,
}

impl OrphanFilesClean {
    pub fn new(
        file_io: Arc<dyn FileIO>,
        table_root: &std::path::Path,
        partition_type: RowType,
        options: &CoreOptions,
        older_than_millis: i64,
    ) -> Self {
        OrphanFilesClean {
            snapshot_manager: SnapshotManager::new(file_io.clone(), table_root),
            manifest_file: ManifestFile::new(
                file_io.clone(),
                table_root,
                partition_type.clone(),
                options.manifest_target_file_size,
                0,
            ),
            manifest_list: ManifestList::new(file_io.clone(), table_root),
            file_io,
            table_root: table_root.to_path_buf(),
            partition_type,
            default_partition_name: options.partition_default_name.clone(),
            older_than_millis,
        }
    }

    /// Returns the number of files removed.
    pub fn clean(&self) -> Result<usize> {
        let mut referenced: HashSet<PathBuf> = HashSet::new();
        for id in self.snapshot_manager.list_ids()? {
            let Ok(snapshot) = self.snapshot_manager.snapshot(id) else {
                continue;
            };
            let manifest_dir = self.table_root.join("manifest");
            let mut lists = vec![
                snapshot.base_manifest_list.clone(),
                snapshot.delta_manifest_list.clone(),
            ];
            lists.extend(snapshot.changelog_manifest_list.clone());
            for list_name in lists {
                referenced.insert(manifest_dir.join(&list_name));
                for meta in self.manifest_list.try_read(&list_name) {
                    referenced.insert(manifest_dir.join(&meta.file_name));
                    for entry in self.manifest_file.try_read(&meta.file_name) {
                        let mut dir = self.table_root.clone();
                        for segment in partition_path(
                            &entry.partition,
                            &self.partition_type,
                            &self.default_partition_name,
                        ) {
                            dir = dir.join(segment);
                        }
                        let bucket_dir = dir.join(format!("bucket-{}", entry.bucket));
                        referenced.insert(bucket_dir.join(&entry.file.file_name));
                        for extra in &entry.file.extra_files {
                            referenced.insert(bucket_dir.join(extra));
                        }
                    }
                }
            }
        }

        let cutoff = current_time_millis() - self.older_than_millis;
        let mut removed = 0;

        for status in self.file_io.list_status(&self.table_root.join("manifest"))? {
            if !status.is_dir
                && !referenced.contains(&status.path)
                && status.modified_millis < cutoff
            {
                self.file_io.delete_quietly(&status.path);
                removed += 1;
            }
        }

        let mut stack = vec![self.table_root.clone()];
        while let Some(dir) = stack.pop() {
            for status in self.file_io.list_status(&dir)? {
                if status.is_dir {
                    let name = status
                        .path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    if name == "manifest" || name == "snapshot" || name == "schema" {
                        continue;
                    }
                    stack.push(status.path);
                } else if is_bucket_file(&status.path)
                    && !referenced.contains(&status.path)
                    && status.modified_millis < cutoff
                {
                    self.file_io.delete_quietly(&status.path);
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            info!(removed, "removed orphan files");
        }
        Ok(removed)
    }
}

fn is_bucket_file(path: &std::path::Path) -> bool {
    path.parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with("bucket-"))
        .unwrap_or(false)
}
