pub mod rewriter;
pub mod universal;

pub use rewriter::{
    CompactResult, CompactRewriter, FullChangelogMergeTreeCompactRewriter, MergeTreeCompactRewriter,
};
pub use universal::{CompactUnit, UniversalCompaction};

use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    executor::{CompactExecutor, TaskHandle},
    fs::FileIO,
    io::{DataFileMeta, DataFilePathFactory},
    mergetree::levels::Levels,
};

/// Schedules and observes the compactions of one bucket. The writer calls
/// in at flush and prepare-commit boundaries; the work itself runs on the
/// shared executor.
pub trait CompactManager: Send {
    fn levels(&self) -> &Levels;

    fn add_new_file(&mut self, file: DataFileMeta);

    /// True when the number of sorted runs reached the stop trigger and
    /// writes must block until compaction catches up.
    fn should_wait_compaction(&self) -> bool;

    fn trigger_compaction(&mut self, full: bool) -> Result<()>;

    /// Poll (or await) the in-flight compaction. A finished result has
    /// already been applied to the levels when this returns it.
    fn get_compaction_result(&mut self, blocking: bool) -> Result<Option<CompactResult>>;

    /// Cancel whatever is in flight and unlink its outputs.
    fn close(&mut self) -> Result<()>;
}

/// Manager for `write-only` writers: accepts files, never compacts.
pub struct NoopCompactManager {
    levels: Levels,
}

impl NoopCompactManager {
    pub fn new(levels: Levels) -> Self {
        NoopCompactManager { levels }
    }
}

impl CompactManager for NoopCompactManager {
    fn levels(&self) -> &Levels {
        &self.levels
    }

    fn add_new_file(&mut self, file: DataFileMeta) {
        self.levels.add_level0(file);
    }

    fn should_wait_compaction(&self) -> bool {
        false
    }

    fn trigger_compaction(&mut self, _full: bool) -> Result<()> {
        Ok(())
    }

    fn get_compaction_result(&mut self, _blocking: bool) -> Result<Option<CompactResult>> {
        Ok(None)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// The real manager: picks units with the universal strategy, runs at most
/// one rewrite per bucket on the shared executor, applies results back to
/// the levels.
pub struct MergeTreeCompactManager {
    executor: Arc<CompactExecutor>,
    levels: Levels,
    strategy: UniversalCompaction,
    stop_trigger: usize,
    rewriter: Arc<dyn CompactRewriter>,
    file_io: Arc<dyn FileIO>,
    path_factory: Arc<DataFilePathFactory>,
    task: Option<TaskHandle<Result<CompactResult>>>,
}

impl MergeTreeCompactManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        executor: Arc<CompactExecutor>,
        levels: Levels,
        strategy: UniversalCompaction,
        stop_trigger: usize,
        rewriter: Arc<dyn CompactRewriter>,
        file_io: Arc<dyn FileIO>,
        path_factory: Arc<DataFilePathFactory>,
    ) -> Self {
        MergeTreeCompactManager {
            executor,
            levels,
            strategy,
            stop_trigger,
            rewriter,
            file_io,
            path_factory,
            task: None,
        }
    }

    fn apply(&mut self, result: &CompactResult) {
        self.levels.update(&result.before, &result.after);
    }
}

impl CompactManager for MergeTreeCompactManager {
    fn levels(&self) -> &Levels {
        &self.levels
    }

    fn add_new_file(&mut self, file: DataFileMeta) {
        self.levels.add_level0(file);
    }

    fn should_wait_compaction(&self) -> bool {
        self.levels.num_sorted_runs() >= self.stop_trigger
    }

    fn trigger_compaction(&mut self, full: bool) -> Result<()> {
        if self.task.is_some() {
            return Ok(());
        }
        let runs = self.levels.level_sorted_runs();
        let unit = if full {
            if runs.is_empty() {
                None
            } else {
                Some(CompactUnit::from_runs(self.levels.max_level(), &runs))
            }
        } else {
            self.strategy.pick(self.levels.max_level(), &runs)
        };
        let Some(unit) = unit else {
            return Ok(());
        };
        if unit.files.is_empty() {
            return Ok(());
        }
        let drop_delete = unit.output_level == self.levels.max_level();
        debug!(
            inputs = unit.files.len(),
            output_level = unit.output_level,
            full,
            "submitting compaction"
        );
        let rewriter = self.rewriter.clone();
        self.task = Some(self.executor.submit(move || {
            rewriter.rewrite(unit.output_level, drop_delete, &unit.files)
        }));
        Ok(())
    }

    fn get_compaction_result(&mut self, blocking: bool) -> Result<Option<CompactResult>> {
        let Some(task) = self.task.take() else {
            return Ok(None);
        };
        let outcome = if blocking {
            task.join()
        } else {
            match task.try_poll() {
                Some(outcome) => Some(outcome),
                None => {
                    self.task = Some(task);
                    return Ok(None);
                }
            }
        };
        match outcome {
            None => Err(Error::IoFatal(
                "compaction worker terminated abnormally".to_string(),
            )),
            Some(Err(err)) => Err(err),
            Some(Ok(result)) => {
                self.apply(&result);
                Ok(Some(result))
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        // the task itself cannot be interrupted; wait it out and discard
        // the outcome so the levels stay untouched
        match task.join() {
            Some(Ok(result)) => {
                for file in result.after.iter().chain(result.changelog.iter()) {
                    self.file_io
                        .delete_quietly(&self.path_factory.to_path(&file.file_name));
                }
                debug!("discarded compaction outputs on close");
            }
            Some(Err(err)) => warn!(%err, "in-flight compaction failed during close"),
            None => warn!("compaction worker terminated abnormally during close"),
        }
        Ok(())
    }
}
