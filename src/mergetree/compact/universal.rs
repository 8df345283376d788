use tracing::debug;

use crate::{io::DataFileMeta, mergetree::levels::LevelSortedRun};

/// A picked compaction: a contiguous prefix of the youngest sorted runs
/// rewritten into one run at `output_level`.
#[derive(Debug, Clone)]
pub struct CompactUnit {
    pub output_level: usize,
    pub files: Vec<DataFileMeta>,
}

impl CompactUnit {
    pub fn from_runs(output_level: usize, runs: &[LevelSortedRun]) -> Self {
        CompactUnit {
            output_level,
            files: runs
                .iter()
                .flat_map(|r| r.run.files.iter().cloned())
                .collect(),
        }
    }
}

/// The default strategy over level-0 sorted runs, after RocksDB's
/// universal compaction: triggered by space amplification, by the size
/// ratio of adjacent runs, or by the sheer number of runs.
#[derive(Debug, Clone)]
pub struct UniversalCompaction {
    max_size_amplification_percent: u64,
    size_ratio: u64,
    num_run_compaction_trigger: usize,
}

impl UniversalCompaction {
    pub fn new(
        max_size_amplification_percent: u64,
        size_ratio: u64,
        num_run_compaction_trigger: usize,
    ) -> Self {
        UniversalCompaction {
            max_size_amplification_percent,
            size_ratio,
            num_run_compaction_trigger,
        }
    }

    /// `runs` are ordered youngest to oldest.
    pub fn pick(&self, max_level: usize, runs: &[LevelSortedRun]) -> Option<CompactUnit> {
        if runs.len() < 2 {
            return None;
        }

        if let Some(unit) = self.pick_for_size_amplification(max_level, runs) {
            debug!("universal compaction triggered by size amplification");
            return Some(unit);
        }

        if runs.len() >= self.num_run_compaction_trigger {
            if let Some(unit) = self.pick_for_size_ratio(max_level, runs) {
                debug!("universal compaction triggered by size ratio");
                return Some(unit);
            }

            // reduce the run count below the trigger
            let picked = runs.len() - self.num_run_compaction_trigger + 2;
            if picked >= 2 {
                debug!(picked, "universal compaction triggered by run count");
                return Some(self.unit_for_prefix(max_level, runs, picked - 1));
            }
        }
        None
    }

    fn pick_for_size_amplification(
        &self,
        max_level: usize,
        runs: &[LevelSortedRun],
    ) -> Option<CompactUnit> {
        let oldest = runs.last()?.run.total_size();
        if oldest == 0 {
            return None;
        }
        let younger: u64 = runs[..runs.len() - 1]
            .iter()
            .map(|r| r.run.total_size())
            .sum();
        if oldest * self.max_size_amplification_percent / 100 <= younger {
            Some(CompactUnit::from_runs(max_level, runs))
        } else {
            None
        }
    }

    fn pick_for_size_ratio(&self, max_level: usize, runs: &[LevelSortedRun]) -> Option<CompactUnit> {
        let mut candidate_size = runs[0].run.total_size();
        let mut last = 0;
        for (i, run) in runs.iter().enumerate().skip(1) {
            let next_size = run.run.total_size();
            if candidate_size * (100 + self.size_ratio) / 100 < next_size {
                break;
            }
            candidate_size += next_size;
            last = i;
        }
        if last == 0 {
            return None;
        }
        Some(self.unit_for_prefix(max_level, runs, last))
    }

    /// Merge `runs[..=last]`. The output lands one level above the oldest
    /// unpicked run so the rewritten data stays younger than everything it
    /// did not absorb; absorbing every run sinks to the terminal level.
    fn unit_for_prefix(&self, max_level: usize, runs: &[LevelSortedRun], last: usize) -> CompactUnit {
        let output_level = if last == runs.len() - 1 {
            max_level
        } else {
            runs[last + 1].level.saturating_sub(1)
        };
        CompactUnit::from_runs(output_level, &runs[..=last])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mergetree::levels::SortedRun,
        row::{Datum, Row},
        stats::StatsMap,
    };

    fn run(level: usize, size: u64) -> LevelSortedRun {
        LevelSortedRun {
            level,
            run: SortedRun {
                files: vec![DataFileMeta {
                    file_name: format!("f-{level}-{size}"),
                    file_size: size,
                    row_count: 1,
                    min_key: Row::new(vec![Datum::BigInt(0)]),
                    max_key: Row::new(vec![Datum::BigInt(1)]),
                    key_stats: StatsMap::new(),
                    value_stats: StatsMap::new(),
                    min_sequence_number: 0,
                    max_sequence_number: 0,
                    schema_id: 0,
                    level,
                    extra_files: Vec::new(),
                    creation_time: 0,
                }],
            },
        }
    }

    #[test]
    fn size_amplification_forces_full_compaction() {
        let strategy = UniversalCompaction::new(200, 1, 5);
        // younger runs dwarf the oldest: full compaction to the max level
        let runs = vec![run(0, 500), run(0, 500), run(5, 100)];
        let unit = strategy.pick(5, &runs).unwrap();
        assert_eq!(unit.output_level, 5);
        assert_eq!(unit.files.len(), 3);
    }

    #[test]
    fn below_trigger_and_balanced_does_nothing() {
        let strategy = UniversalCompaction::new(200, 1, 5);
        let runs = vec![run(0, 10), run(5, 1000)];
        assert!(strategy.pick(5, &runs).is_none());
    }

    #[test]
    fn size_ratio_merges_similar_prefix() {
        let strategy = UniversalCompaction::new(10_000, 1, 3);
        // three similar young runs, one huge old run
        let runs = vec![run(0, 100), run(0, 100), run(0, 100), run(5, 100_000)];
        let unit = strategy.pick(5, &runs).unwrap();
        // prefix stops before the huge run and lands just above it
        assert_eq!(unit.files.len(), 3);
        assert_eq!(unit.output_level, 4);
    }

    #[test]
    fn run_count_trigger_reduces_runs() {
        let strategy = UniversalCompaction::new(10_000, 0, 4);
        // sizes grow steeply so neither amplification nor ratio fires
        let runs = vec![run(0, 1), run(0, 1000), run(0, 100_000), run(5, 10_000_000)];
        let unit = strategy.pick(5, &runs).unwrap();
        assert!(unit.files.len() >= 2);
    }
}
