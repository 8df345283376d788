use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    error::{Error, Result},
    fs::{retry_read, FileIO},
    manifest::{ManifestFileMeta, ManifestList},
    schema::parse_numbered_file,
};

/// Format version of the snapshot JSON document.
pub const SNAPSHOT_VERSION: u32 = 1;

const SNAPSHOT_PREFIX: &str = "snapshot-";
pub const EARLIEST: &str = "EARLIEST";
pub const LATEST: &str = "LATEST";

/// What kind of commit produced a snapshot; determines conflict semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommitKind {
    Append,
    Compact,
    Overwrite,
    Analyze,
}

/// The atomic unit of table state, persisted as `snapshot/snapshot-<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub version: u32,
    pub id: i64,
    pub schema_id: i64,
    pub commit_user: String,
    pub commit_identifier: i64,
    pub commit_kind: CommitKind,
    pub base_manifest_list: String,
    pub delta_manifest_list: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changelog_manifest_list: Option<String>,
    pub time_millis: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub log_offsets: BTreeMap<u32, i64>,
    pub total_record_count: u64,
    pub delta_record_count: u64,
    pub changelog_record_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermark: Option<i64>,
}

impl Snapshot {
    /// The full set of data manifests: base followed by delta.
    pub fn data_manifests(&self, manifest_list: &ManifestList) -> Result<Vec<ManifestFileMeta>> {
        let mut metas = manifest_list.read(&self.base_manifest_list)?;
        metas.extend(manifest_list.read(&self.delta_manifest_list)?);
        Ok(metas)
    }
}

/// Resolves, lists and publishes snapshot files plus the advisory
/// EARLIEST/LATEST hints.
pub struct SnapshotManager {
    file_io: Arc<dyn FileIO>,
    table_root: PathBuf,
}

impl SnapshotManager {
    pub fn new(file_io: Arc<dyn FileIO>, table_root: impl Into<PathBuf>) -> Self {
        SnapshotManager {
            file_io,
            table_root: table_root.into(),
        }
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.table_root.join("snapshot")
    }

    pub fn snapshot_path(&self, id: i64) -> PathBuf {
        self.snapshot_dir().join(format!("{SNAPSHOT_PREFIX}{id}"))
    }

    pub fn snapshot_exists(&self, id: i64) -> Result<bool> {
        self.file_io.exists(&self.snapshot_path(id))
    }

    pub fn snapshot(&self, id: i64) -> Result<Snapshot> {
        let path = self.snapshot_path(id);
        let text = retry_read(|| self.file_io.read_to_string(&path))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Atomically publish a snapshot file. Returns `false` when a snapshot
    /// with this id already exists (a concurrent committer won the race).
    pub fn try_publish(&self, snapshot: &Snapshot) -> Result<bool> {
        let content = serde_json::to_vec_pretty(snapshot)?;
        self.file_io
            .try_atomic_write(&self.snapshot_path(snapshot.id), &content)
    }

    pub fn latest_snapshot_id(&self) -> Result<Option<i64>> {
        if let Some(hint) = self.read_hint(LATEST) {
            // the hint is advisory: trust it only when nothing newer exists
            if hint > 0 && self.snapshot_exists(hint)? && !self.snapshot_exists(hint + 1)? {
                return Ok(Some(hint));
            }
        }
        Ok(self.list_ids()?.last().copied())
    }

    pub fn earliest_snapshot_id(&self) -> Result<Option<i64>> {
        if let Some(hint) = self.read_hint(EARLIEST) {
            if hint > 0 && self.snapshot_exists(hint)? && !self.snapshot_exists(hint - 1)? {
                return Ok(Some(hint));
            }
        }
        Ok(self.list_ids()?.first().copied())
    }

    pub fn latest_snapshot(&self) -> Result<Option<Snapshot>> {
        match self.latest_snapshot_id()? {
            Some(id) => Ok(Some(self.snapshot(id)?)),
            None => Ok(None),
        }
    }

    pub fn list_ids(&self) -> Result<Vec<i64>> {
        let mut ids: Vec<i64> = self
            .file_io
            .list_status(&self.snapshot_dir())?
            .into_iter()
            .filter_map(|status| parse_numbered_file(&status.path, SNAPSHOT_PREFIX))
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn hint_path(&self, name: &str) -> PathBuf {
        self.snapshot_dir().join(name)
    }

    pub fn read_hint(&self, name: &str) -> Option<i64> {
        let path = self.hint_path(name);
        match self.file_io.exists(&path) {
            Ok(true) => {}
            _ => return None,
        }
        match self.file_io.read_to_string(&path) {
            Ok(text) => text.trim().parse().ok(),
            Err(err) => {
                warn!(hint = name, %err, "failed to read snapshot hint");
                None
            }
        }
    }

    /// Best-effort hint writes; a torn or stale hint only costs a listing.
    pub fn commit_latest_hint(&self, id: i64) -> Result<()> {
        self.file_io
            .write_overwrite(&self.hint_path(LATEST), id.to_string().as_bytes())
    }

    pub fn commit_earliest_hint(&self, id: i64) -> Result<()> {
        self.file_io
            .write_overwrite(&self.hint_path(EARLIEST), id.to_string().as_bytes())
    }

    /// Walk snapshots from latest to earliest, returning the first one the
    /// predicate accepts. Missing files (concurrent expiration) are
    /// skipped rather than failed.
    pub fn traverse_from_latest_safely(
        &self,
        mut predicate: impl FnMut(&Snapshot) -> bool,
    ) -> Result<Option<Snapshot>> {
        let Some(latest) = self.latest_snapshot_id()? else {
            return Ok(None);
        };
        let earliest = self.earliest_snapshot_id()?.unwrap_or(latest);
        for id in (earliest..=latest).rev() {
            match self.snapshot(id) {
                Ok(snapshot) => {
                    if predicate(&snapshot) {
                        return Ok(Some(snapshot));
                    }
                }
                Err(Error::IoFatal(_)) => {
                    // expired underneath the traversal
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }
}
