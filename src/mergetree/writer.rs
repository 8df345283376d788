use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::debug;

use crate::{
    error::{Error, Result},
    io::{KeyValue, KeyValueFileWriterFactory},
    mergefn::MergeFunctionFactory,
    mergetree::{
        buffer::WriteBuffer,
        compact::CompactManager,
        CompactIncrement, NewFilesIncrement,
    },
    options::ChangelogProducer,
    read::{KeyValueFileReaderFactory, LookupLevels},
    row::{Row, RowKind},
};

/// Everything a [`MergeTreeWriter`] is wired with at construction.
pub struct MergeTreeWriterContext {
    pub buffer: WriteBuffer,
    pub compact_manager: Box<dyn CompactManager>,
    pub writer_factory: Arc<KeyValueFileWriterFactory>,
    pub reader_factory: Arc<KeyValueFileReaderFactory>,
    pub merge_factory: MergeFunctionFactory,
    pub changelog_producer: ChangelogProducer,
    pub commit_force_compact: bool,
    pub full_compaction_interval: Duration,
    /// Spilled-run ceiling; past it a flush replaces further spills.
    pub sort_spill_threshold: Option<usize>,
    pub restored_max_sequence: i64,
    /// Position of the user-chosen `sequence.field` in the value row.
    pub sequence_field_index: Option<usize>,
}

/// Single-threaded ingest for one `(partition, bucket)`: buffers records,
/// flushes sorted runs to level 0, and drives asynchronous compaction.
pub struct MergeTreeWriter {
    buffer: WriteBuffer,
    compact_manager: Box<dyn CompactManager>,
    writer_factory: Arc<KeyValueFileWriterFactory>,
    reader_factory: Arc<KeyValueFileReaderFactory>,
    merge_factory: MergeFunctionFactory,
    changelog_producer: ChangelogProducer,
    commit_force_compact: bool,
    full_compaction_interval: Duration,
    last_full_compaction: Instant,
    sort_spill_threshold: Option<usize>,
    sequence: i64,
    sequence_field_index: Option<usize>,
    input_changelog: Vec<KeyValue>,
    new_files: Vec<crate::io::DataFileMeta>,
    new_changelog: Vec<crate::io::DataFileMeta>,
    pending_compact: CompactIncrement,
}

impl MergeTreeWriter {
    pub fn new(ctx: MergeTreeWriterContext) -> Self {
        MergeTreeWriter {
            buffer: ctx.buffer,
            compact_manager: ctx.compact_manager,
            writer_factory: ctx.writer_factory,
            reader_factory: ctx.reader_factory,
            merge_factory: ctx.merge_factory,
            changelog_producer: ctx.changelog_producer,
            commit_force_compact: ctx.commit_force_compact,
            full_compaction_interval: ctx.full_compaction_interval,
            last_full_compaction: Instant::now(),
            sort_spill_threshold: ctx.sort_spill_threshold,
            sequence: ctx.restored_max_sequence,
            sequence_field_index: ctx.sequence_field_index,
            input_changelog: Vec::new(),
            new_files: Vec::new(),
            new_changelog: Vec::new(),
            pending_compact: CompactIncrement::default(),
        }
    }

    /// Pull finished compactions into the pending increment.
    fn absorb_compactions(&mut self, mut blocking: bool) -> Result<()> {
        while let Some(result) = self.compact_manager.get_compaction_result(blocking)? {
            self.pending_compact.compact_before.extend(result.before);
            self.pending_compact.compact_after.extend(result.after);
            self.pending_compact.compact_changelog.extend(result.changelog);
            blocking = false;
        }
        Ok(())
    }

    /// Explicitly trigger a compaction and wait for its outcome; the
    /// increments surface at the next `prepare_commit`.
    pub fn compact(&mut self, full: bool) -> Result<()> {
        self.flush()?;
        self.compact_manager.trigger_compaction(full)?;
        self.absorb_compactions(true)
    }

    pub fn max_sequence_number(&self) -> i64 {
        self.sequence
    }

    /// Non-blocking unless the sorted-run count reached the stop trigger,
    /// in which case the flush inside blocks until compaction catches up.
    pub fn write(&mut self, kind: RowKind, key: Row, value: Row) -> Result<()> {
        let sequence = match self.sequence_field_index {
            None => {
                self.sequence += 1;
                self.sequence
            }
            Some(index) => {
                let sequence = value.get(index).as_i64().ok_or_else(|| {
                    Error::SchemaMismatch(
                        "the configured sequence.field holds no integer value".to_string(),
                    )
                })?;
                // keep the auto floor monotonic for restores
                self.sequence = self.sequence.max(sequence);
                sequence
            }
        };

        if self.changelog_producer == ChangelogProducer::Input {
            self.input_changelog
                .push(KeyValue::new(key.clone(), sequence, kind, value.clone()));
        }

        let exceeded = self.buffer.put(sequence, kind, key, value);
        if exceeded {
            let may_spill = self.buffer.spillable()
                && self
                    .sort_spill_threshold
                    .map_or(true, |limit| self.buffer.spilled_run_count() < limit);
            if may_spill {
                self.buffer.spill()?;
            } else {
                self.flush()?;
            }
        }
        Ok(())
    }

    /// Drain the buffer into a fresh level-0 run, emit changelog as the
    /// producer dictates, then let the compaction strategy have a look.
    pub fn flush(&mut self) -> Result<()> {
        self.wait_for_stop_trigger()?;

        if self.buffer.is_empty() && self.input_changelog.is_empty() {
            return Ok(());
        }
        debug!(
            records = self.buffer.record_count(),
            memory = self.buffer.memory_bytes(),
            "flushing write buffer"
        );

        if !self.input_changelog.is_empty() {
            // verbatim, in write order
            let mut writer = self.writer_factory.create_changelog(0)?;
            for kv in &self.input_changelog {
                writer.write(kv)?;
            }
            self.new_changelog.push(writer.close()?);
            self.input_changelog.clear();
        }

        let lookup_base = if self.changelog_producer == ChangelogProducer::Lookup {
            Some(self.compact_manager.levels().all_files())
        } else {
            None
        };

        let writer_factory = self.writer_factory.clone();
        let mut data_writer = writer_factory.create_rolling_data(0);
        let mut changelog_writer = lookup_base
            .is_some()
            .then(|| writer_factory.create_rolling_changelog(0));
        let mut lookup = lookup_base
            .map(|files| LookupLevels::new(self.reader_factory.clone(), files));

        let mut function = self.merge_factory.create();
        let mut current_key: Option<Row> = None;
        let mut flush_merged = |function: &mut Box<dyn crate::mergefn::MergeFunction>|
         -> Result<()> {
            let Some(kv) = function.result()? else {
                return Ok(());
            };
            if let (Some(changelog), Some(lookup)) = (&mut changelog_writer, &mut lookup) {
                emit_lookup_changelog(changelog, lookup, &kv)?;
            }
            data_writer.write(&kv)
        };

        let mut drained = self.buffer.drain()?;
        let result = (|| -> Result<()> {
            for kv in drained.by_ref() {
                let kv = kv?;
                if current_key.as_ref() != Some(&kv.key) {
                    flush_merged(&mut function)?;
                    function.reset();
                    current_key = Some(kv.key.clone());
                }
                function.add(kv)?;
            }
            if current_key.is_some() {
                flush_merged(&mut function)?;
            }
            Ok(())
        })();
        drop(drained);

        match result {
            Ok(()) => {}
            Err(err) => {
                data_writer.abort();
                if let Some(changelog) = changelog_writer {
                    changelog.abort();
                }
                return Err(err);
            }
        }

        for meta in data_writer.close()? {
            self.new_files.push(meta.clone());
            self.compact_manager.add_new_file(meta);
        }
        if let Some(changelog) = changelog_writer {
            self.new_changelog.extend(changelog.close()?);
        }

        self.compact_manager.trigger_compaction(false)?;
        Ok(())
    }

    fn wait_for_stop_trigger(&mut self) -> Result<()> {
        while self.compact_manager.should_wait_compaction() {
            self.compact_manager.trigger_compaction(false)?;
            if self.compact_manager.get_compaction_result(true)?.is_some() {
                continue;
            }
            // nothing was in flight and the strategy passed; force the
            // issue rather than stalling forever
            self.compact_manager.trigger_compaction(true)?;
            if self.compact_manager.get_compaction_result(true)?.is_none() {
                break;
            }
        }
        Ok(())
    }

    /// Drain everything pending and hand back the increments of this
    /// commit cycle. Blocks on in-flight compaction when `wait_compaction`
    /// (or `commit-force-compact`, or a due full-compaction changelog
    /// interval) requires its output.
    pub fn prepare_commit(
        &mut self,
        wait_compaction: bool,
    ) -> Result<(NewFilesIncrement, CompactIncrement)> {
        self.flush()?;

        let mut blocking = wait_compaction || self.commit_force_compact;
        if self.changelog_producer == ChangelogProducer::FullCompaction
            && self.last_full_compaction.elapsed() >= self.full_compaction_interval
        {
            self.compact_manager.trigger_compaction(true)?;
            self.last_full_compaction = Instant::now();
            blocking = true;
        } else if self.commit_force_compact {
            self.compact_manager.trigger_compaction(false)?;
        }
        self.absorb_compactions(blocking)?;

        let new_files = NewFilesIncrement {
            new_files: std::mem::take(&mut self.new_files),
            changelog_files: std::mem::take(&mut self.new_changelog),
        };
        Ok((new_files, std::mem::take(&mut self.pending_compact)))
    }

    /// Await the in-flight compaction, if any, without committing.
    pub fn sync(&mut self) -> Result<()> {
        self.absorb_compactions(true)
    }

    /// Abandon in-flight work; outputs of a cancelled compaction are
    /// unlinked and the levels stay as they were.
    pub fn close(&mut self) -> Result<()> {
        self.compact_manager.close()
    }

    pub fn restored_files(&self) -> Vec<crate::io::DataFileMeta> {
        self.compact_manager.levels().all_files()
    }
}

fn emit_lookup_changelog(
    changelog: &mut crate::io::RollingKeyValueFileWriter<'_>,
    lookup: &mut LookupLevels,
    merged: &KeyValue,
) -> Result<()> {
    let prior = lookup.lookup(&merged.key)?;
    match (&prior, merged.kind.is_add()) {
        (Some(prior), true) => {
            changelog.write(&KeyValue {
                kind: RowKind::UpdateBefore,
                ..prior.clone()
            })?;
            changelog.write(&KeyValue {
                kind: RowKind::UpdateAfter,
                ..merged.clone()
            })?;
        }
        (None, true) => {
            changelog.write(&KeyValue {
                kind: RowKind::Insert,
                ..merged.clone()
            })?;
        }
        (Some(prior), false) => {
            changelog.write(&KeyValue {
                kind: RowKind::Delete,
                ..prior.clone()
            })?;
        }
        (None, false) => {}
    }
    Ok(())
}
