use std::sync::Arc;

use tracing::debug;

use crate::{
    error::Result,
    io::{DataFileMeta, KeyValue, KeyValueFileWriterFactory},
    mergefn::MergeFunctionFactory,
    read::{KeyValueFileReaderFactory, SortMergeIterator, SortedSource},
    row::RowKind,
};

/// Outcome of one compaction: inputs retired, outputs registered, plus any
/// changelog files the rewrite produced.
#[derive(Debug, Clone, Default)]
pub struct CompactResult {
    pub before: Vec<DataFileMeta>,
    pub after: Vec<DataFileMeta>,
    pub changelog: Vec<DataFileMeta>,
}

/// Rewrites the files of a compact unit into a sorted run at the output
/// level.
pub trait CompactRewriter: Send + Sync {
    fn rewrite(
        &self,
        output_level: usize,
        drop_delete: bool,
        files: &[DataFileMeta],
    ) -> Result<CompactResult>;
}

/// Plain rewrite: k-way merge, apply the merge function per key, emit the
/// surviving records.
pub struct MergeTreeCompactRewriter {
    pub reader_factory: Arc<KeyValueFileReaderFactory>,
    pub writer_factory: Arc<KeyValueFileWriterFactory>,
    pub merge_factory: MergeFunctionFactory,
}

impl MergeTreeCompactRewriter {
    fn sources(&self, files: &[DataFileMeta]) -> Result<Vec<SortedSource>> {
        files
            .iter()
            .map(|file| {
                Ok(SortedSource {
                    level: file.level,
                    iter: self.reader_factory.create_reader(file)?,
                })
            })
            .collect()
    }

    fn rewrite_merged(
        &self,
        output_level: usize,
        drop_delete: bool,
        files: &[DataFileMeta],
        mut on_group: impl FnMut(&[(KeyValue, usize)], Option<&KeyValue>) -> Result<()>,
    ) -> Result<CompactResult> {
        let mut merge = SortMergeIterator::new(self.sources(files)?)?;
        let mut function = self.merge_factory.create();
        let mut writer = self.writer_factory.create_rolling_data(output_level);

        let outcome = (|| -> Result<()> {
            while let Some(group) = merge.next_group()? {
                function.reset();
                for (kv, _) in &group {
                    function.add(kv.clone())?;
                }
                let merged = function.result()?;
                on_group(&group, merged.as_ref())?;
                match merged {
                    None => {}
                    Some(kv) if drop_delete && kv.kind.is_retract() => {}
                    Some(kv) => writer.write(&kv)?,
                }
            }
            Ok(())
        })();

        match outcome {
            Ok(()) => {
                let after = writer.close()?;
                debug!(
                    inputs = files.len(),
                    outputs = after.len(),
                    output_level,
                    "compaction rewrite finished"
                );
                Ok(CompactResult {
                    before: files.to_vec(),
                    after,
                    changelog: Vec::new(),
                })
            }
            Err(err) => {
                // a cancelled or failed rewrite unlinks its outputs and
                // leaves the levels untouched
                writer.abort();
                Err(err)
            }
        }
    }
}

impl CompactRewriter for MergeTreeCompactRewriter {
    fn rewrite(
        &self,
        output_level: usize,
        drop_delete: bool,
        files: &[DataFileMeta],
    ) -> Result<CompactResult> {
        self.rewrite_merged(output_level, drop_delete, files, |_, _| Ok(()))
    }
}

/// Rewrite used by the `full-compaction` changelog producer: a rewrite to
/// the terminal level diffs each key's terminal-level record against the
/// merged outcome and emits the difference as changelog.
pub struct FullChangelogMergeTreeCompactRewriter {
    pub inner: MergeTreeCompactRewriter,
    pub max_level: usize,
}

impl CompactRewriter for FullChangelogMergeTreeCompactRewriter {
    fn rewrite(
        &self,
        output_level: usize,
        drop_delete: bool,
        files: &[DataFileMeta],
    ) -> Result<CompactResult> {
        if output_level != self.max_level {
            return self.inner.rewrite(output_level, drop_delete, files);
        }

        let mut changelog_writer = self.inner.writer_factory.create_rolling_changelog(0);
        let max_level = self.max_level;
        let result = self.inner.rewrite_merged(
            output_level,
            drop_delete,
            files,
            |group, merged| {
                let before = group
                    .iter()
                    .find(|(kv, level)| *level == max_level && kv.kind.is_add())
                    .map(|(kv, _)| kv);
                let after = merged.filter(|kv| kv.kind.is_add());
                match (before, after) {
                    (Some(before), Some(after)) => {
                        if before.value != after.value {
                            changelog_writer.write(&KeyValue {
                                kind: RowKind::UpdateBefore,
                                ..before.clone()
                            })?;
                            changelog_writer.write(&KeyValue {
                                kind: RowKind::UpdateAfter,
                                ..after.clone()
                            })?;
                        }
                    }
                    (Some(before), None) => {
                        changelog_writer.write(&KeyValue {
                            kind: RowKind::Delete,
                            ..before.clone()
                        })?;
                    }
                    (None, Some(after)) => {
                        changelog_writer.write(&KeyValue {
                            kind: RowKind::Insert,
                            ..after.clone()
                        })?;
                    }
                    (None, None) => {}
                }
                Ok(())
            },
        );

        match result {
            Ok(mut result) => {
                result.changelog = changelog_writer.close()?;
                Ok(result)
            }
            Err(err) => {
                changelog_writer.abort();
                Err(err)
            }
        }
    }
}
