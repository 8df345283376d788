use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    fs::FileIO,
    io::{current_time_millis, DataFileMeta},
    manifest::{merge_entries, FileKind, ManifestEntry, ManifestFile, ManifestList},
    options::CoreOptions,
    predicate::Predicate,
    row::Row,
    schema::SchemaManager,
    snapshot::{CommitKind, Snapshot, SnapshotManager, SNAPSHOT_VERSION},
};

/// Identifier used by maintenance commits (partition expiration) that do
/// not participate in idempotence bookkeeping.
pub const MAINTENANCE_COMMIT_IDENTIFIER: i64 = i64::MAX;

/// Serializes snapshot publication when the filesystem cannot provide an
/// atomic fail-closed rename.
pub trait Lock: Send + Sync {
    fn run_exclusively(&self, op: &mut dyn FnMut() -> Result<bool>) -> Result<bool>;
}

/// The pending files of one `(partition, bucket)` produced by a writer's
/// `prepare_commit`.
#[derive(Debug, Clone, Default)]
pub struct CommitMessage {
    pub partition: Row,
    pub bucket: usize,
    pub new_files: Vec<DataFileMeta>,
    pub changelog_files: Vec<DataFileMeta>,
    pub compact_before: Vec<DataFileMeta>,
    pub compact_after: Vec<DataFileMeta>,
    pub compact_changelog: Vec<DataFileMeta>,
}

/// A serializable artifact summarizing everything one commit installs.
#[derive(Debug, Clone, Default)]
pub struct ManifestCommittable {
    pub identifier: i64,
    pub watermark: Option<i64>,
    pub log_offsets: BTreeMap<u32, i64>,
    pub messages: Vec<CommitMessage>,
}

impl ManifestCommittable {
    pub fn new(identifier: i64) -> Self {
        ManifestCommittable {
            identifier,
            ..Default::default()
        }
    }

    pub fn add_message(&mut self, message: CommitMessage) {
        self.messages.push(message);
    }
}

/// Conflict-resolving writer of new snapshots.
pub struct FileStoreCommit {
    snapshot_manager: SnapshotManager,
    schema_manager: SchemaManager,
    manifest_file: ManifestFile,
    manifest_list: ManifestList,
    options: CoreOptions,
    commit_user: String,
    schema_id: i64,
    lock: Option<Arc<dyn Lock>>,
    object_store: bool,
}

impl FileStoreCommit {
    pub fn new(
        file_io: Arc<dyn FileIO>,
        table_root: &std::path::Path,
        partition_type: crate::schema::RowType,
        options: CoreOptions,
        commit_user: String,
        schema_id: i64,
    ) -> Self {
        let object_store = file_io.is_object_store();
        FileStoreCommit {
            snapshot_manager: SnapshotManager::new(file_io.clone(), table_root),
            schema_manager: SchemaManager::new(file_io.clone(), table_root),
            manifest_file: ManifestFile::new(
                file_io.clone(),
                table_root,
                partition_type,
                options.manifest_target_file_size,
                schema_id,
            ),
            manifest_list: ManifestList::new(file_io, table_root),
            options,
            commit_user,
            schema_id,
            lock: None,
            object_store,
        }
    }

    pub fn with_lock(mut self, lock: Arc<dyn Lock>) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn snapshot_manager(&self) -> &SnapshotManager {
        &self.snapshot_manager
    }

    /// Drop identifiers already reflected in a snapshot committed by this
    /// user. Used by callers after failover to make replays idempotent.
    pub fn filter_committed(&self, identifiers: Vec<i64>) -> Result<Vec<i64>> {
        let latest_own = self.snapshot_manager.traverse_from_latest_safely(|s| {
            s.commit_user == self.commit_user
                && s.commit_identifier != MAINTENANCE_COMMIT_IDENTIFIER
        })?;
        match latest_own.map(|s| s.commit_identifier) {
            None => Ok(identifiers),
            Some(max) => Ok(identifiers.into_iter().filter(|id| *id > max).collect()),
        }
    }

    /// Install one `APPEND` snapshot and, when the committable carries
    /// compaction increments, a second `COMPACT` snapshot.
    pub fn commit(&self, committable: &ManifestCommittable) -> Result<()> {
        let mut append_entries = Vec::new();
        let mut append_changelog = Vec::new();
        let mut compact_entries = Vec::new();
        let mut compact_changelog = Vec::new();
        for message in &committable.messages {
            let at = |file: &DataFileMeta, kind: FileKind| ManifestEntry {
                kind,
                partition: message.partition.clone(),
                bucket: message.bucket,
                total_buckets: self.options.bucket,
                file: file.clone(),
            };
            for file in &message.new_files {
                append_entries.push(at(file, FileKind::Add));
            }
            for file in &message.changelog_files {
                append_changelog.push(at(file, FileKind::Add));
            }
            for file in &message.compact_before {
                compact_entries.push(at(file, FileKind::Delete));
            }
            for file in &message.compact_after {
                compact_entries.push(at(file, FileKind::Add));
            }
            for file in &message.compact_changelog {
                compact_changelog.push(at(file, FileKind::Add));
            }
        }

        if !append_entries.is_empty() || !append_changelog.is_empty() {
            self.try_commit(
                CommitKind::Append,
                committable,
                &|_| Ok(append_entries.clone()),
                &append_changelog,
            )?;
        }
        if !compact_entries.is_empty() || !compact_changelog.is_empty() {
            self.try_commit(
                CommitKind::Compact,
                committable,
                &|_| Ok(compact_entries.clone()),
                &compact_changelog,
            )?;
        }
        Ok(())
    }

    /// Install one `OVERWRITE` snapshot that retires every live file whose
    /// partition matches `partition_filter` (all partitions when `None`)
    /// before adding the committable's new files.
    pub fn overwrite(
        &self,
        partition_filter: Option<Predicate>,
        committable: &ManifestCommittable,
    ) -> Result<()> {
        let mut add_entries = Vec::new();
        for message in &committable.messages {
            for file in &message.new_files {
                add_entries.push(ManifestEntry::add(
                    message.partition.clone(),
                    message.bucket,
                    self.options.bucket,
                    file.clone(),
                ));
            }
        }

        self.try_commit(
            CommitKind::Overwrite,
            committable,
            &|latest| {
                let mut entries = Vec::new();
                if let Some(latest) = latest {
                    for entry in self.read_live_entries(latest)? {
                        let matches = partition_filter
                            .as_ref()
                            .map(|p| p.test_row(&entry.partition))
                            .unwrap_or(true);
                        if matches {
                            entries.push(ManifestEntry {
                                kind: FileKind::Delete,
                                ..entry
                            });
                        }
                    }
                }
                entries.extend(add_entries.iter().cloned());
                Ok(entries)
            },
            &[],
        )
    }

    /// The merged live state of a snapshot.
    pub(crate) fn read_live_entries(&self, snapshot: &Snapshot) -> Result<Vec<ManifestEntry>> {
        let mut entries = Vec::new();
        for meta in snapshot.data_manifests(&self.manifest_list)? {
            entries.extend(self.manifest_file.read(&meta.file_name)?);
        }
        Ok(merge_entries(entries))
    }

    fn try_commit(
        &self,
        kind: CommitKind,
        committable: &ManifestCommittable,
        make_delta: &dyn Fn(Option<&Snapshot>) -> Result<Vec<ManifestEntry>>,
        changelog_entries: &[ManifestEntry],
    ) -> Result<()> {
        let mut checked_up_to: Option<i64> = None;
        let mut retries = 0usize;
        loop {
            let latest = self.snapshot_manager.latest_snapshot()?;
            let delta_entries = make_delta(latest.as_ref())?;

            // conflict check against snapshots that landed since the last
            // attempt; OVERWRITE recomputes its deletes, so only the
            // non-recomputing kinds need it
            if kind != CommitKind::Overwrite {
                if let (Some(latest), Some(checked)) = (&latest, checked_up_to) {
                    for id in (checked + 1)..=latest.id {
                        let intervening = self.snapshot_manager.snapshot(id)?;
                        self.check_conflict(&intervening, &delta_entries)?;
                    }
                }
                checked_up_to = latest.as_ref().map(|s| s.id);
            }

            if self.schema_manager.latest()?.map(|s| s.id) != Some(self.schema_id) {
                return Err(Error::SchemaMismatch(
                    "table schema changed during commit, restart from the new schema".to_string(),
                ));
            }

            if self.attempt(kind, committable, &latest, &delta_entries, changelog_entries)? {
                return Ok(());
            }

            retries += 1;
            if retries > self.options.commit_max_retries {
                return Err(Error::ConflictRetriable(format!(
                    "commit gave up after {retries} attempts racing other writers"
                )));
            }
            debug!(retries, "snapshot publish lost the race, retrying");
        }
    }

    /// Build manifests and publish one snapshot. Returns false when another
    /// committer took the target id.
    fn attempt(
        &self,
        kind: CommitKind,
        committable: &ManifestCommittable,
        latest: &Option<Snapshot>,
        delta_entries: &[ManifestEntry],
        changelog_entries: &[ManifestEntry],
    ) -> Result<bool> {
        let new_id = latest.as_ref().map(|s| s.id + 1).unwrap_or(1);

        let base_metas = match latest {
            Some(snapshot) => self.manifest_file.merge(
                snapshot.data_manifests(&self.manifest_list)?,
                self.options.manifest_merge_min_count,
                self.options.manifest_target_file_size,
            )?,
            None => Vec::new(),
        };
        let base_manifest_list = self.manifest_list.write(&base_metas)?;
        let delta_metas = self.manifest_file.write(delta_entries)?;
        let delta_manifest_list = self.manifest_list.write(&delta_metas)?;
        let changelog_manifest_list = if changelog_entries.is_empty() {
            None
        } else {
            let changelog_metas = self.manifest_file.write(changelog_entries)?;
            Some(self.manifest_list.write(&changelog_metas)?)
        };

        let added: u64 = delta_entries
            .iter()
            .filter(|e| e.kind == FileKind::Add)
            .map(|e| e.file.row_count)
            .sum();
        let deleted: u64 = delta_entries
            .iter()
            .filter(|e| e.kind == FileKind::Delete)
            .map(|e| e.file.row_count)
            .sum();
        let previous_total = latest.as_ref().map(|s| s.total_record_count).unwrap_or(0);
        let changelog_count: u64 = changelog_entries.iter().map(|e| e.file.row_count).sum();

        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            id: new_id,
            schema_id: self.schema_id,
            commit_user: self.commit_user.clone(),
            commit_identifier: committable.identifier,
            commit_kind: kind,
            base_manifest_list,
            delta_manifest_list,
            changelog_manifest_list,
            time_millis: current_time_millis(),
            log_offsets: committable.log_offsets.clone(),
            total_record_count: (previous_total + added).saturating_sub(deleted),
            delta_record_count: added.saturating_sub(deleted.min(added)),
            changelog_record_count: changelog_count,
            watermark: committable.watermark,
        };

        let published = self.publish(&snapshot)?;
        if published {
            info!(
                snapshot = new_id,
                kind = ?kind,
                files_added = delta_entries.iter().filter(|e| e.kind == FileKind::Add).count(),
                files_deleted = delta_entries.iter().filter(|e| e.kind == FileKind::Delete).count(),
                "committed snapshot"
            );
            // best effort; a stale hint only costs the next reader a listing
            if let Err(err) = self.snapshot_manager.commit_latest_hint(new_id) {
                warn!(%err, "failed to write LATEST hint");
            }
        } else {
            // the losing attempt's manifests are unreferenced; clean them up
            self.manifest_list.delete(&snapshot.base_manifest_list);
            for meta in &delta_metas {
                self.manifest_file.delete(&meta.file_name);
            }
            self.manifest_list.delete(&snapshot.delta_manifest_list);
            if let Some(changelog) = &snapshot.changelog_manifest_list {
                self.manifest_list.delete(changelog);
            }
        }
        Ok(published)
    }

    fn publish(&self, snapshot: &Snapshot) -> Result<bool> {
        match &self.lock {
            Some(lock) => {
                let mut op = || self.snapshot_manager.try_publish(snapshot);
                lock.run_exclusively(&mut op)
            }
            None => {
                if self.object_store {
                    warn!(
                        "publishing on an object store without an external lock; \
                         rename atomicity is not guaranteed"
                    );
                }
                self.snapshot_manager.try_publish(snapshot)
            }
        }
    }

    fn check_conflict(&self, intervening: &Snapshot, pending: &[ManifestEntry]) -> Result<()> {
        let their_entries = {
            let mut entries = Vec::new();
            for meta in self.manifest_list.read(&intervening.delta_manifest_list)? {
                entries.extend(self.manifest_file.read(&meta.file_name)?);
            }
            entries
        };

        let my_deletes: HashSet<_> = pending
            .iter()
            .filter(|e| e.kind == FileKind::Delete)
            .map(ManifestEntry::identifier)
            .collect();
        for theirs in &their_entries {
            if theirs.kind == FileKind::Delete && my_deletes.contains(&theirs.identifier()) {
                return Err(Error::ConflictFatal(format!(
                    "snapshot {} already deleted file {}",
                    intervening.id, theirs.file.file_name
                )));
            }
        }

        if intervening.commit_kind == CommitKind::Overwrite {
            let their_slots: HashSet<(Vec<u8>, usize)> = their_entries
                .iter()
                .map(|e| (e.partition.canonical_bytes(), e.bucket))
                .collect();
            let collision = pending
                .iter()
                .any(|e| their_slots.contains(&(e.partition.canonical_bytes(), e.bucket)));
            if collision {
                return Err(Error::ConflictFatal(format!(
                    "snapshot {} overwrote a partition this commit also writes",
                    intervening.id
                )));
            }
        }
        Ok(())
    }
}
