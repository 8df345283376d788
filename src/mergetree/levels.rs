use std::collections::HashSet;

use crate::io::DataFileMeta;

/// A key-range-disjoint sequence of data files, sorted by `min_key`.
#[derive(Debug, Clone, Default)]
pub struct SortedRun {
    pub files: Vec<DataFileMeta>,
}

impl SortedRun {
    pub fn from_sorted(files: Vec<DataFileMeta>) -> Self {
        debug_assert!(files.windows(2).all(|w| w[0].max_key < w[1].min_key));
        SortedRun { files }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.file_size).sum()
    }
}

/// A sorted run tagged with the level it lives at; level 0 runs hold a
/// single file each.
#[derive(Debug, Clone)]
pub struct LevelSortedRun {
    pub level: usize,
    pub run: SortedRun,
}

/// The file tree of one bucket: level 0 holds freshly flushed,
/// possibly-overlapping runs; each level >= 1 is one non-overlapping run.
#[derive(Debug)]
pub struct Levels {
    level0: Vec<DataFileMeta>,
    higher: Vec<Vec<DataFileMeta>>,
}

impl Levels {
    pub fn new(files: Vec<DataFileMeta>, num_levels: usize) -> Self {
        debug_assert!(num_levels >= 2);
        let mut levels = Levels {
            level0: Vec::new(),
            higher: vec![Vec::new(); num_levels - 1],
        };
        for file in files {
            levels.insert(file);
        }
        levels
    }

    pub fn max_level(&self) -> usize {
        self.higher.len()
    }

    fn insert(&mut self, file: DataFileMeta) {
        if file.level == 0 {
            self.level0.push(file);
            // newest runs first
            self.level0
                .sort_by(|a, b| b.max_sequence_number.cmp(&a.max_sequence_number));
        } else {
            let slot = &mut self.higher[file.level - 1];
            slot.push(file);
            slot.sort_by(|a, b| a.min_key.cmp(&b.min_key));
        }
    }

    pub fn add_level0(&mut self, file: DataFileMeta) {
        debug_assert_eq!(file.level, 0);
        self.insert(file);
    }

    pub fn num_sorted_runs(&self) -> usize {
        self.level0.len() + self.higher.iter().filter(|l| !l.is_empty()).count()
    }

    /// Runs ordered youngest to oldest: level 0 by recency, then each
    /// non-empty higher level.
    pub fn level_sorted_runs(&self) -> Vec<LevelSortedRun> {
        let mut runs = Vec::with_capacity(self.num_sorted_runs());
        for file in &self.level0 {
            runs.push(LevelSortedRun {
                level: 0,
                run: SortedRun {
                    files: vec![file.clone()],
                },
            });
        }
        for (i, files) in self.higher.iter().enumerate() {
            if !files.is_empty() {
                runs.push(LevelSortedRun {
                    level: i + 1,
                    run: SortedRun {
                        files: files.clone(),
                    },
                });
            }
        }
        runs
    }

    pub fn all_files(&self) -> Vec<DataFileMeta> {
        let mut files = self.level0.clone();
        for level in &self.higher {
            files.extend(level.iter().cloned());
        }
        files
    }

    /// Apply a compaction outcome: drop `before`, register `after` at the
    /// levels their metadata names.
    pub fn update(&mut self, before: &[DataFileMeta], after: &[DataFileMeta]) {
        let removed: HashSet<&str> = before.iter().map(|f| f.file_name.as_str()).collect();
        self.level0.retain(|f| !removed.contains(f.file_name.as_str()));
        for level in &mut self.higher {
            level.retain(|f| !removed.contains(f.file_name.as_str()));
        }
        for file in after {
            self.insert(file.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        row::{Datum, Row},
        stats::StatsMap,
    };

    fn file(name: &str, level: usize, min: i64, max: i64, max_seq: i64) -> DataFileMeta {
        DataFileMeta {
            file_name: name.to_string(),
            file_size: 100,
            row_count: 1,
            min_key: Row::new(vec![Datum::BigInt(min)]),
            max_key: Row::new(vec![Datum::BigInt(max)]),
            key_stats: StatsMap::new(),
            value_stats: StatsMap::new(),
            min_sequence_number: 0,
            max_sequence_number: max_seq,
            schema_id: 0,
            level,
            extra_files: Vec::new(),
            creation_time: 0,
        }
    }

    #[test]
    fn restores_levels_from_metadata() {
        let levels = Levels::new(
            vec![
                file("l1-a", 1, 0, 10, 5),
                file("l0-old", 0, 0, 100, 7),
                file("l0-new", 0, 0, 100, 9),
                file("l1-b", 1, 20, 30, 5),
            ],
            4,
        );
        assert_eq!(levels.num_sorted_runs(), 3);
        let runs = levels.level_sorted_runs();
        // newest level-0 run first, oldest data last
        assert_eq!(runs[0].run.files[0].file_name, "l0-new");
        assert_eq!(runs[1].run.files[0].file_name, "l0-old");
        assert_eq!(runs[2].level, 1);
        assert_eq!(runs[2].run.files.len(), 2);
        assert_eq!(runs[2].run.files[0].file_name, "l1-a");
    }

    #[test]
    fn update_moves_files_between_levels() {
        let mut levels = Levels::new(
            vec![file("a", 0, 0, 10, 1), file("b", 0, 5, 15, 2)],
            4,
        );
        let output = file("merged", 3, 0, 15, 2);
        levels.update(&levels.all_files(), &[output]);
        assert_eq!(levels.num_sorted_runs(), 1);
        assert_eq!(levels.level_sorted_runs()[0].level, 3);
    }
}
