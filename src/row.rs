use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::types::DataType;

/// A single dynamically typed value.
///
/// `Null` is less than any non-null value. Values of different types order
/// by a fixed type rank so that rows under one schema always have a total
/// order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Datum {
    Null,
    Boolean(bool),
    Int(i32),
    BigInt(i64),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    Timestamp(i64),
    Date(i32),
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Datum::Null => None,
            Datum::Boolean(_) => Some(DataType::Boolean),
            Datum::Int(_) => Some(DataType::Int),
            Datum::BigInt(_) => Some(DataType::BigInt),
            Datum::Double(_) => Some(DataType::Double),
            Datum::String(_) => Some(DataType::String),
            Datum::Bytes(_) => Some(DataType::Bytes),
            Datum::Timestamp(_) => Some(DataType::Timestamp),
            Datum::Date(_) => Some(DataType::Date),
        }
    }

    /// Widen to `target`, per [`DataType::can_widen_to`].
    pub fn cast(&self, target: DataType) -> Option<Datum> {
        match (self, target) {
            (Datum::Null, _) => Some(Datum::Null),
            (Datum::Int(v), DataType::BigInt) => Some(Datum::BigInt(*v as i64)),
            (Datum::Int(v), DataType::Double) => Some(Datum::Double(*v as f64)),
            (Datum::BigInt(v), DataType::Double) => Some(Datum::Double(*v as f64)),
            (datum, target) if datum.data_type() == Some(target) => Some(datum.clone()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Datum::Int(v) => Some(*v as i64),
            Datum::BigInt(v) | Datum::Timestamp(v) => Some(*v),
            Datum::Date(v) => Some(*v as i64),
            _ => None,
        }
    }

    /// Approximate heap + inline size, used for write buffer accounting.
    pub fn estimated_size(&self) -> usize {
        16 + match self {
            Datum::String(s) => s.len(),
            Datum::Bytes(b) => b.len(),
            _ => 0,
        }
    }

    /// Canonical byte encoding, used for bucket hashing. Stable across
    /// processes and releases.
    pub fn write_canonical_bytes(&self, out: &mut Vec<u8>) {
        match self {
            Datum::Null => out.push(0),
            Datum::Boolean(v) => {
                out.push(1);
                out.push(*v as u8);
            }
            Datum::Int(v) => {
                out.push(2);
                out.extend_from_slice(&(*v as i64).to_le_bytes());
            }
            Datum::BigInt(v) => {
                out.push(2);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Datum::Double(v) => {
                out.push(3);
                out.extend_from_slice(&v.to_bits().to_le_bytes());
            }
            Datum::String(v) => {
                out.push(4);
                out.extend_from_slice(&(v.len() as u32).to_le_bytes());
                out.extend_from_slice(v.as_bytes());
            }
            Datum::Bytes(v) => {
                out.push(5);
                out.extend_from_slice(&(v.len() as u32).to_le_bytes());
                out.extend_from_slice(v);
            }
            Datum::Timestamp(v) => {
                out.push(6);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Datum::Date(v) => {
                out.push(7);
                out.extend_from_slice(&(*v as i64).to_le_bytes());
            }
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Datum::Null => 0,
            Datum::Boolean(_) => 1,
            Datum::Int(_) => 2,
            Datum::BigInt(_) => 3,
            Datum::Double(_) => 4,
            Datum::String(_) => 5,
            Datum::Bytes(_) => 6,
            Datum::Timestamp(_) => 7,
            Datum::Date(_) => 8,
        }
    }
}

impl PartialEq for Datum {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Datum {}

impl PartialOrd for Datum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Datum {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Datum::Null, Datum::Null) => Ordering::Equal,
            (Datum::Boolean(a), Datum::Boolean(b)) => a.cmp(b),
            (Datum::Int(a), Datum::Int(b)) => a.cmp(b),
            (Datum::BigInt(a), Datum::BigInt(b)) => a.cmp(b),
            (Datum::Double(a), Datum::Double(b)) => a.total_cmp(b),
            (Datum::String(a), Datum::String(b)) => a.cmp(b),
            (Datum::Bytes(a), Datum::Bytes(b)) => a.cmp(b),
            (Datum::Timestamp(a), Datum::Timestamp(b)) => a.cmp(b),
            (Datum::Date(a), Datum::Date(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl std::fmt::Display for Datum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Datum::Null => f.write_str("null"),
            Datum::Boolean(v) => write!(f, "{v}"),
            Datum::Int(v) => write!(f, "{v}"),
            Datum::BigInt(v) => write!(f, "{v}"),
            Datum::Double(v) => write!(f, "{v}"),
            Datum::String(v) => f.write_str(v),
            Datum::Bytes(v) => write!(f, "x{}", v.len()),
            Datum::Timestamp(v) => write!(f, "{v}"),
            Datum::Date(v) => write!(f, "{v}"),
        }
    }
}

/// An ordered tuple of values under one schema.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Row(pub Vec<Datum>);

impl Row {
    pub fn new(fields: Vec<Datum>) -> Self {
        Row(fields)
    }

    pub fn empty() -> Self {
        Row(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> &Datum {
        &self.0[index]
    }

    pub fn fields(&self) -> &[Datum] {
        &self.0
    }

    pub fn project(&self, indexes: &[usize]) -> Row {
        Row(indexes.iter().map(|i| self.0[*i].clone()).collect())
    }

    pub fn estimated_size(&self) -> usize {
        self.0.iter().map(Datum::estimated_size).sum()
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.0.len() * 12);
        for datum in &self.0 {
            datum.write_canonical_bytes(&mut out);
        }
        out
    }
}

impl From<Vec<Datum>> for Row {
    fn from(fields: Vec<Datum>) -> Self {
        Row(fields)
    }
}

/// Change kind of a row in a changelog stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowKind {
    #[serde(rename = "+I")]
    Insert,
    #[serde(rename = "-U")]
    UpdateBefore,
    #[serde(rename = "+U")]
    UpdateAfter,
    #[serde(rename = "-D")]
    Delete,
}

impl RowKind {
    /// True for kinds that retract a previously emitted row.
    pub fn is_retract(self) -> bool {
        matches!(self, RowKind::UpdateBefore | RowKind::Delete)
    }

    /// True for kinds that add to the visible state.
    pub fn is_add(self) -> bool {
        !self.is_retract()
    }

    pub fn short_string(self) -> &'static str {
        match self {
            RowKind::Insert => "+I",
            RowKind::UpdateBefore => "-U",
            RowKind::UpdateAfter => "+U",
            RowKind::Delete => "-D",
        }
    }
}

impl std::fmt::Display for RowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.short_string())
    }
}
