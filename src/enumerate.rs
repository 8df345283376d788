use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use tracing::{debug, info};

use crate::{
    error::{Error, Result},
    options::{ChangelogProducer, ScanMode},
    scan::{split::DataSplit, split::SplitGenerator, FileStoreScan, ScanKind},
    snapshot::{CommitKind, SnapshotManager},
    table::{FileStoreTable, StoreContext, TableKind},
};

/// One tick's outcome for the streaming source.
#[derive(Debug)]
pub enum EnumeratorResult {
    /// Nothing new; retry after `continuous.discovery-interval`.
    Empty,
    /// The consumer fell behind an expired snapshot; restart from latest.
    Finished,
    /// Splits covering the files one snapshot added, grouped by bucket.
    Plan(Vec<DataSplit>),
}

/// Incrementally discovers new snapshots and turns each into splits, in
/// snapshot-id order.
pub struct SnapshotEnumerator {
    ctx: Arc<StoreContext>,
    kind: TableKind,
    snapshot_manager: SnapshotManager,
    mode: ScanMode,
    next_snapshot_id: Option<i64>,
}

impl SnapshotEnumerator {
    pub fn new(table: &FileStoreTable) -> Self {
        let ctx = table.context().clone();
        SnapshotEnumerator {
            snapshot_manager: SnapshotManager::new(ctx.file_io.clone(), &ctx.table_root),
            mode: ctx.options.scan_mode,
            kind: table.kind(),
            ctx,
            next_snapshot_id: None,
        }
    }

    pub fn next_snapshot_id(&self) -> Option<i64> {
        self.next_snapshot_id
    }

    pub fn enumerate(&mut self) -> Result<EnumeratorResult> {
        let Some(latest) = self.snapshot_manager.latest_snapshot_id()? else {
            return Ok(EnumeratorResult::Empty);
        };

        let Some(next) = self.next_snapshot_id else {
            return self.start(latest);
        };

        if next > latest {
            return Ok(EnumeratorResult::Empty);
        }
        if !self.snapshot_manager.snapshot_exists(next)? {
            // expired while we were behind
            info!(next, "snapshot expired before consumption, restarting");
            return Ok(EnumeratorResult::Finished);
        }
        let snapshot = self.snapshot_manager.snapshot(next)?;
        self.next_snapshot_id = Some(next + 1);
        if snapshot.commit_kind != CommitKind::Append
            && snapshot.commit_kind != CommitKind::Overwrite
        {
            // compactions rearrange files without changing content
            return Ok(EnumeratorResult::Plan(Vec::new()));
        }
        let splits = self.plan_at(next, self.incremental_kind())?;
        debug!(snapshot = next, splits = splits.len(), "incremental plan");
        Ok(EnumeratorResult::Plan(splits))
    }

    /// Resolve the starting point from `scan.mode` on the first tick.
    fn start(&mut self, latest: i64) -> Result<EnumeratorResult> {
        match self.mode {
            ScanMode::Default | ScanMode::LatestFull => {
                self.next_snapshot_id = Some(latest + 1);
                let splits = self.plan_at(latest, ScanKind::All)?;
                Ok(EnumeratorResult::Plan(splits))
            }
            ScanMode::Latest => {
                self.next_snapshot_id = Some(latest + 1);
                Ok(EnumeratorResult::Empty)
            }
            ScanMode::CompactedFull => {
                let compacted = self
                    .snapshot_manager
                    .traverse_from_latest_safely(|s| s.commit_kind == CommitKind::Compact)?;
                match compacted {
                    None => {
                        self.next_snapshot_id = Some(latest + 1);
                        let splits = self.plan_at(latest, ScanKind::All)?;
                        Ok(EnumeratorResult::Plan(splits))
                    }
                    Some(snapshot) => {
                        self.next_snapshot_id = Some(snapshot.id + 1);
                        let splits = self.plan_at(snapshot.id, ScanKind::All)?;
                        Ok(EnumeratorResult::Plan(splits))
                    }
                }
            }
            ScanMode::FromTimestamp => {
                let timestamp = self.ctx.options.scan_timestamp_millis.ok_or_else(|| {
                    Error::ConfigInvalid(
                        "scan.mode 'from-timestamp' requires 'scan.timestamp-millis'".to_string(),
                    )
                })?;
                let starting = self
                    .snapshot_manager
                    .traverse_from_latest_safely(|s| s.time_millis <= timestamp)?;
                self.next_snapshot_id = Some(match starting {
                    Some(snapshot) => snapshot.id + 1,
                    None => self.snapshot_manager.earliest_snapshot_id()?.unwrap_or(1),
                });
                Ok(EnumeratorResult::Empty)
            }
            ScanMode::FromSnapshot => {
                let id = self.ctx.options.scan_snapshot_id.ok_or_else(|| {
                    Error::ConfigInvalid(
                        "scan.mode 'from-snapshot' requires 'scan.snapshot-id'".to_string(),
                    )
                })?;
                self.next_snapshot_id = Some(id);
                Ok(EnumeratorResult::Empty)
            }
        }
    }

    /// PK tables with a changelog producer stream the changelog files;
    /// everything else streams the delta data files.
    fn incremental_kind(&self) -> ScanKind {
        if self.kind == TableKind::ChangelogWithKey
            && self.ctx.options.changelog_producer != ChangelogProducer::None
        {
            ScanKind::Changelog
        } else {
            ScanKind::Delta
        }
    }

    fn plan_at(&self, snapshot_id: i64, kind: ScanKind) -> Result<Vec<DataSplit>> {
        let scan = FileStoreScan::new(
            self.ctx.file_io.clone(),
            &self.ctx.table_root,
            self.ctx.schema.clone(),
            &self.ctx.options,
        )
        .with_snapshot(snapshot_id)
        .with_kind(kind);
        let plan = scan.plan()?;
        let generator = SplitGenerator::new(
            self.ctx.options.split_target_size,
            self.ctx.options.split_open_file_cost,
        );
        Ok(match (self.kind, kind) {
            (TableKind::AppendOnly, _) => generator.append_splits(&plan),
            // incremental and changelog files are consumed file-by-file in
            // order, not merged, so pack like an append stream
            (_, ScanKind::Delta | ScanKind::Changelog) => generator.append_splits(&plan),
            (_, ScanKind::All) => generator.merge_tree_splits(&plan),
        })
    }
}

type BucketSlot = (Vec<u8>, usize);

/// Distributes pending splits to parallel readers with within-bucket FIFO
/// ordering, bucket-to-reader affinity, and round-robin fairness across
/// buckets.
pub struct ContinuousFileSplitEnumerator {
    pending: HashMap<BucketSlot, VecDeque<DataSplit>>,
    bucket_order: Vec<BucketSlot>,
    assignment: HashMap<BucketSlot, usize>,
    readers: Vec<usize>,
}

impl ContinuousFileSplitEnumerator {
    pub fn new() -> Self {
        ContinuousFileSplitEnumerator {
            pending: HashMap::new(),
            bucket_order: Vec::new(),
            assignment: HashMap::new(),
            readers: Vec::new(),
        }
    }

    pub fn register_reader(&mut self, reader: usize) {
        if !self.readers.contains(&reader) {
            self.readers.push(reader);
            self.readers.sort_unstable();
        }
    }

    /// A reader went away; its buckets become assignable again and its
    /// pending splits stay queued in order.
    pub fn unregister_reader(&mut self, reader: usize) {
        self.readers.retain(|r| *r != reader);
        self.assignment.retain(|_, r| *r != reader);
    }

    /// Enqueue splits in discovery order; splits of the same bucket keep
    /// snapshot-id order.
    pub fn add_splits(&mut self, splits: Vec<DataSplit>) {
        for split in splits {
            let slot = (split.partition.canonical_bytes(), split.bucket);
            if !self.pending.contains_key(&slot) {
                self.bucket_order.push(slot.clone());
            }
            self.pending.entry(slot).or_default().push_back(split);
        }
    }

    /// Splits a failed reader hands back; they re-enter at the front of
    /// their bucket queue so FIFO order is preserved.
    pub fn add_splits_back(&mut self, splits: Vec<DataSplit>) {
        for split in splits.into_iter().rev() {
            let slot = (split.partition.canonical_bytes(), split.bucket);
            if !self.pending.contains_key(&slot) {
                self.bucket_order.push(slot.clone());
            }
            self.pending.entry(slot).or_default().push_front(split);
        }
    }

    /// Hand the next split to `reader`: first from its own buckets, else
    /// by claiming an unassigned bucket.
    pub fn next_split(&mut self, reader: usize) -> Option<DataSplit> {
        if !self.readers.contains(&reader) {
            return None;
        }
        // a bucket already owned by this reader, in discovery order
        for slot in &self.bucket_order {
            if self.assignment.get(slot) == Some(&reader) {
                if let Some(split) = self.pending.get_mut(slot).and_then(VecDeque::pop_front) {
                    return Some(split);
                }
            }
        }
        // claim the first unassigned bucket with pending work
        for slot in self.bucket_order.clone() {
            if self.assignment.contains_key(&slot) {
                continue;
            }
            if let Some(split) = self.pending.get_mut(&slot).and_then(VecDeque::pop_front) {
                self.assignment.insert(slot, reader);
                return Some(split);
            }
        }
        None
    }

    pub fn pending_count(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }
}

impl Default for ContinuousFileSplitEnumerator {
    fn default() -> Self {
        Self::new()
    }
}
