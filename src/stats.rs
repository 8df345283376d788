use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::row::{Datum, Row};

/// Per-column `(min, max, null_count)` triple.
///
/// `min`/`max` are `Null` when every observed value was null.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldStats {
    pub min: Datum,
    pub max: Datum,
    pub null_count: u64,
}

impl FieldStats {
    pub fn all_null(row_count: u64) -> Self {
        FieldStats {
            min: Datum::Null,
            max: Datum::Null,
            null_count: row_count,
        }
    }

    /// Merge with stats of another file over the same column.
    pub fn merge(&self, other: &FieldStats) -> FieldStats {
        FieldStats {
            min: min_non_null(&self.min, &other.min),
            max: self.max.clone().max(other.max.clone()),
            null_count: self.null_count + other.null_count,
        }
    }
}

fn min_non_null(a: &Datum, b: &Datum) -> Datum {
    match (a.is_null(), b.is_null()) {
        (true, _) => b.clone(),
        (_, true) => a.clone(),
        _ => a.clone().min(b.clone()),
    }
}

/// Stats keyed by stable field id, so files written under older schemas
/// stay interpretable after evolution.
pub type StatsMap = BTreeMap<i32, FieldStats>;

/// Accumulates [`FieldStats`] row by row while a file is written. Used when
/// the file format does not provide its own stats extractor.
#[derive(Debug)]
pub struct StatsCollector {
    field_ids: Vec<i32>,
    mins: Vec<Datum>,
    maxs: Vec<Datum>,
    null_counts: Vec<u64>,
}

impl StatsCollector {
    pub fn new(field_ids: Vec<i32>) -> Self {
        let n = field_ids.len();
        StatsCollector {
            field_ids,
            mins: vec![Datum::Null; n],
            maxs: vec![Datum::Null; n],
            null_counts: vec![0; n],
        }
    }

    pub fn collect(&mut self, row: &Row) {
        debug_assert_eq!(row.len(), self.field_ids.len());
        for (i, datum) in row.fields().iter().enumerate() {
            if datum.is_null() {
                self.null_counts[i] += 1;
                continue;
            }
            if self.mins[i].is_null() || *datum < self.mins[i] {
                self.mins[i] = datum.clone();
            }
            if self.maxs[i].is_null() || *datum > self.maxs[i] {
                self.maxs[i] = datum.clone();
            }
        }
    }

    pub fn finish(self) -> StatsMap {
        self.field_ids
            .into_iter()
            .zip(
                self.mins
                    .into_iter()
                    .zip(self.maxs.into_iter().zip(self.null_counts)),
            )
            .map(|(id, (min, (max, null_count)))| {
                (
                    id,
                    FieldStats {
                        min,
                        max,
                        null_count,
                    },
                )
            })
            .collect()
    }
}
