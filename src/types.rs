use serde::{Deserialize, Serialize};

/// Logical column types understood by the engine.
///
/// Nullability lives on the field, not the type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    Boolean,
    Int,
    BigInt,
    Double,
    String,
    Bytes,
    /// Milliseconds since the unix epoch.
    Timestamp,
    /// Days since the unix epoch.
    Date,
}

impl DataType {
    /// Whether a value of `self` can be losslessly widened to `to` when a
    /// data file written under an older schema is read under a newer one.
    pub fn can_widen_to(self, to: DataType) -> bool {
        if self == to {
            return true;
        }
        matches!(
            (self, to),
            (DataType::Int, DataType::BigInt)
                | (DataType::Int, DataType::Double)
                | (DataType::BigInt, DataType::Double)
        )
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DataType::Boolean => "BOOLEAN",
            DataType::Int => "INT",
            DataType::BigInt => "BIGINT",
            DataType::Double => "DOUBLE",
            DataType::String => "STRING",
            DataType::Bytes => "BYTES",
            DataType::Timestamp => "TIMESTAMP",
            DataType::Date => "DATE",
        };
        f.write_str(name)
    }
}
