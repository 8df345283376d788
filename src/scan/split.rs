use std::collections::HashMap;

use crate::{
    io::DataFileMeta,
    manifest::ManifestEntry,
    row::Row,
    scan::Plan,
};

/// A unit of parallel reading: files of one `(partition, bucket)`.
#[derive(Debug, Clone)]
pub struct DataSplit {
    pub snapshot_id: i64,
    pub partition: Row,
    pub bucket: usize,
    pub files: Vec<DataFileMeta>,
}

/// Packs the surviving files of a plan into splits.
pub struct SplitGenerator {
    target_split_size: u64,
    open_file_cost: u64,
}

impl SplitGenerator {
    pub fn new(target_split_size: u64, open_file_cost: u64) -> Self {
        SplitGenerator {
            target_split_size,
            open_file_cost,
        }
    }

    /// Append-only tables: greedy packing by accumulated weight, where a
    /// file weighs its size plus a fixed open cost.
    pub fn append_splits(&self, plan: &Plan) -> Vec<DataSplit> {
        let snapshot_id = plan.snapshot_id.unwrap_or(0);
        let mut splits = Vec::new();
        for ((partition, bucket), files) in group_by_bucket(&plan.files) {
            for pack in self.pack_by_size(files, |f| f.file_size) {
                splits.push(DataSplit {
                    snapshot_id,
                    partition: partition.clone(),
                    bucket,
                    files: pack,
                });
            }
        }
        splits
    }

    /// Merge-tree tables: all files of a bucket belong to one split unless
    /// their key ranges fall into provably disjoint sections; a section is
    /// complete for any merge function, so sections may be split apart and
    /// repacked by size.
    pub fn merge_tree_splits(&self, plan: &Plan) -> Vec<DataSplit> {
        let snapshot_id = plan.snapshot_id.unwrap_or(0);
        let mut splits = Vec::new();
        for ((partition, bucket), files) in group_by_bucket(&plan.files) {
            let sections = partition_into_sections(files);
            for pack in self.pack_sections(sections) {
                splits.push(DataSplit {
                    snapshot_id,
                    partition: partition.clone(),
                    bucket,
                    files: pack,
                });
            }
        }
        splits
    }

    fn pack_by_size(
        &self,
        files: Vec<DataFileMeta>,
        size_of: impl Fn(&DataFileMeta) -> u64,
    ) -> Vec<Vec<DataFileMeta>> {
        let mut packs = Vec::new();
        let mut current = Vec::new();
        let mut weight = 0u64;
        for file in files {
            let file_weight = size_of(&file).max(self.open_file_cost);
            if !current.is_empty() && weight + file_weight > self.target_split_size {
                packs.push(std::mem::take(&mut current));
                weight = 0;
            }
            weight += file_weight;
            current.push(file);
        }
        if !current.is_empty() {
            packs.push(current);
        }
        packs
    }

    fn pack_sections(&self, sections: Vec<Vec<DataFileMeta>>) -> Vec<Vec<DataFileMeta>> {
        let mut packs = Vec::new();
        let mut current: Vec<DataFileMeta> = Vec::new();
        let mut weight = 0u64;
        for section in sections {
            let section_weight: u64 = section
                .iter()
                .map(|f| f.file_size.max(self.open_file_cost))
                .sum();
            if !current.is_empty() && weight + section_weight > self.target_split_size {
                packs.push(std::mem::take(&mut current));
                weight = 0;
            }
            weight += section_weight;
            current.extend(section);
        }
        if !current.is_empty() {
            packs.push(current);
        }
        packs
    }
}

fn group_by_bucket(entries: &[ManifestEntry]) -> Vec<((Row, usize), Vec<DataFileMeta>)> {
    let mut order = Vec::new();
    let mut groups: HashMap<(Vec<u8>, usize), ((Row, usize), Vec<DataFileMeta>)> = HashMap::new();
    for entry in entries {
        let key = (entry.partition.canonical_bytes(), entry.bucket);
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups
            .entry(key)
            .or_insert_with(|| ((entry.partition.clone(), entry.bucket), Vec::new()))
            .1
            .push(entry.file.clone());
    }
    order
        .into_iter()
        .filter_map(|key| groups.remove(&key))
        .collect()
}

/// Group files into sections whose key ranges transitively overlap. Files
/// of different sections never share a key, so a merge is complete within
/// each section.
fn partition_into_sections(mut files: Vec<DataFileMeta>) -> Vec<Vec<DataFileMeta>> {
    files.sort_by(|a, b| {
        a.min_key
            .cmp(&b.min_key)
            .then_with(|| a.max_key.cmp(&b.max_key))
    });
    let mut sections: Vec<Vec<DataFileMeta>> = Vec::new();
    let mut current_max: Option<Row> = None;
    for file in files {
        let overlaps = match &current_max {
            Some(max) => file.min_key <= *max,
            None => false,
        };
        if overlaps {
            if let Some(max) = &mut current_max {
                if file.max_key > *max {
                    *max = file.max_key.clone();
                }
            }
            sections
                .last_mut()
                .expect("overlap implies an open section")
                .push(file);
        } else {
            current_max = Some(file.max_key.clone());
            sections.push(vec![file]);
        }
    }
    sections
}
