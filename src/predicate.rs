use serde::{Deserialize, Serialize};

use crate::{
    row::{Datum, Row},
    stats::FieldStats,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    IsNull,
    IsNotNull,
}

/// A predicate over one row type, referencing fields by position.
///
/// `test_stats` is conservative: it answers "might any row match", so a
/// `true` keeps a file and only a provable `false` prunes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    Leaf {
        field_index: usize,
        field_name: String,
        op: CompareOp,
        literal: Option<Datum>,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

impl Predicate {
    pub fn leaf(field_index: usize, field_name: impl Into<String>, op: CompareOp, literal: Option<Datum>) -> Predicate {
        Predicate::Leaf {
            field_index,
            field_name: field_name.into(),
            op,
            literal,
        }
    }

    pub fn equal(field_index: usize, field_name: impl Into<String>, literal: Datum) -> Predicate {
        Predicate::leaf(field_index, field_name, CompareOp::Eq, Some(literal))
    }

    pub fn and(predicates: Vec<Predicate>) -> Predicate {
        if predicates.len() == 1 {
            predicates.into_iter().next().expect("len checked")
        } else {
            Predicate::And(predicates)
        }
    }

    pub fn or(predicates: Vec<Predicate>) -> Predicate {
        if predicates.len() == 1 {
            predicates.into_iter().next().expect("len checked")
        } else {
            Predicate::Or(predicates)
        }
    }

    pub fn test_row(&self, row: &Row) -> bool {
        match self {
            Predicate::And(children) => children.iter().all(|p| p.test_row(row)),
            Predicate::Or(children) => children.iter().any(|p| p.test_row(row)),
            Predicate::Leaf {
                field_index,
                op,
                literal,
                ..
            } => {
                let value = row.get(*field_index);
                match op {
                    CompareOp::IsNull => value.is_null(),
                    CompareOp::IsNotNull => !value.is_null(),
                    _ => {
                        let Some(literal) = literal else {
                            return false;
                        };
                        if value.is_null() || literal.is_null() {
                            return false;
                        }
                        match op {
                            CompareOp::Eq => value == literal,
                            CompareOp::NotEq => value != literal,
                            CompareOp::Lt => value < literal,
                            CompareOp::LtEq => value <= literal,
                            CompareOp::Gt => value > literal,
                            CompareOp::GtEq => value >= literal,
                            CompareOp::IsNull | CompareOp::IsNotNull => unreachable!(),
                        }
                    }
                }
            }
        }
    }

    /// Whether a file with the given per-field stats might contain a
    /// matching row. `stats_for` resolves a leaf's field index to the file's
    /// stats; `None` means the field did not exist when the file was written
    /// and reads as all-null.
    pub fn test_stats(
        &self,
        row_count: u64,
        stats_for: &dyn Fn(usize) -> Option<FieldStats>,
    ) -> bool {
        if row_count == 0 {
            return false;
        }
        match self {
            Predicate::And(children) => children.iter().all(|p| p.test_stats(row_count, stats_for)),
            Predicate::Or(children) => children.iter().any(|p| p.test_stats(row_count, stats_for)),
            Predicate::Leaf {
                field_index,
                op,
                literal,
                ..
            } => {
                let stats = stats_for(*field_index).unwrap_or_else(|| FieldStats::all_null(row_count));
                let all_null = stats.null_count >= row_count;
                match op {
                    CompareOp::IsNull => stats.null_count > 0,
                    CompareOp::IsNotNull => !all_null,
                    _ => {
                        let Some(literal) = literal else {
                            return false;
                        };
                        if literal.is_null() || all_null {
                            return false;
                        }
                        let (min, max) = (&stats.min, &stats.max);
                        if min.is_null() || max.is_null() {
                            // stats unavailable, keep the file
                            return true;
                        }
                        match op {
                            CompareOp::Eq => min <= literal && literal <= max,
                            CompareOp::NotEq => !(min == literal && max == literal),
                            CompareOp::Lt => min < literal,
                            CompareOp::LtEq => min <= literal,
                            CompareOp::Gt => max > literal,
                            CompareOp::GtEq => max >= literal,
                            CompareOp::IsNull | CompareOp::IsNotNull => unreachable!(),
                        }
                    }
                }
            }
        }
    }

    /// Split a top-level conjunction into its conjuncts.
    pub fn split_and(self) -> Vec<Predicate> {
        match self {
            Predicate::And(children) => children.into_iter().flat_map(Predicate::split_and).collect(),
            other => vec![other],
        }
    }

    /// Project conjuncts that only reference fields in `subset` onto the
    /// subset's positions. Returns `None` when no conjunct qualifies.
    pub fn pick_for_fields(&self, subset: &[usize]) -> Option<Predicate> {
        let picked: Vec<Predicate> = self
            .clone()
            .split_and()
            .into_iter()
            .filter_map(|conjunct| conjunct.remap(subset))
            .collect();
        if picked.is_empty() {
            None
        } else {
            Some(Predicate::and(picked))
        }
    }

    fn remap(self, subset: &[usize]) -> Option<Predicate> {
        match self {
            Predicate::Leaf {
                field_index,
                field_name,
                op,
                literal,
            } => {
                let new_index = subset.iter().position(|i| *i == field_index)?;
                Some(Predicate::Leaf {
                    field_index: new_index,
                    field_name,
                    op,
                    literal,
                })
            }
            Predicate::And(children) => {
                let mapped: Option<Vec<_>> = children.into_iter().map(|c| c.remap(subset)).collect();
                mapped.map(Predicate::And)
            }
            Predicate::Or(children) => {
                let mapped: Option<Vec<_>> = children.into_iter().map(|c| c.remap(subset)).collect();
                mapped.map(Predicate::Or)
            }
        }
    }
}
