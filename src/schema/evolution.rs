use crate::{
    error::{Error, Result},
    row::{Datum, Row},
    schema::DataField,
    types::DataType,
};

/// Projection and cast plan from a data file's row shape onto the current
/// table's row shape. Fields match by stable id; a table field absent from
/// the data schema reads as null.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexCastMapping {
    /// For each table field, the position in the data row, or `None` when
    /// the field did not exist when the file was written.
    pub index_mapping: Vec<Option<usize>>,
    /// For each table field, the widening applied to the data value, or
    /// `None` when the types already match (or the field is absent).
    pub cast_mapping: Vec<Option<DataType>>,
}

impl IndexCastMapping {
    /// Build the mapping between `data_fields` (how the rows were written)
    /// and `table_fields` (how they are read now).
    pub fn between(table_fields: &[DataField], data_fields: &[DataField]) -> Result<Self> {
        let mut index_mapping = Vec::with_capacity(table_fields.len());
        let mut cast_mapping = Vec::with_capacity(table_fields.len());
        for table_field in table_fields {
            let data_pos = data_fields.iter().position(|f| f.id == table_field.id);
            match data_pos {
                None => {
                    index_mapping.push(None);
                    cast_mapping.push(None);
                }
                Some(pos) => {
                    let data_type = data_fields[pos].data_type;
                    if data_type == table_field.data_type {
                        cast_mapping.push(None);
                    } else if data_type.can_widen_to(table_field.data_type) {
                        cast_mapping.push(Some(table_field.data_type));
                    } else {
                        return Err(Error::SchemaMismatch(format!(
                            "field '{}' (id {}) cannot be read as {} from data written as {}",
                            table_field.name, table_field.id, table_field.data_type, data_type
                        )));
                    }
                    index_mapping.push(Some(pos));
                }
            }
        }
        Ok(IndexCastMapping {
            index_mapping,
            cast_mapping,
        })
    }

    /// True when every field maps to the same position with no cast.
    pub fn is_identity(&self, data_field_count: usize) -> bool {
        self.index_mapping.len() == data_field_count
            && self
                .index_mapping
                .iter()
                .enumerate()
                .all(|(i, m)| *m == Some(i))
            && self.cast_mapping.iter().all(Option::is_none)
    }

    /// Project one data row onto the table shape.
    pub fn apply(&self, data_row: &Row) -> Row {
        let mut fields = Vec::with_capacity(self.index_mapping.len());
        for (index, cast) in self.index_mapping.iter().zip(&self.cast_mapping) {
            let datum = match index {
                None => Datum::Null,
                Some(pos) => {
                    let raw = data_row.get(*pos);
                    match cast {
                        None => raw.clone(),
                        Some(target) => raw.cast(*target).unwrap_or(Datum::Null),
                    }
                }
            };
            fields.push(datum);
        }
        Row::new(fields)
    }

    /// Map table-level field positions into data-file positions, for
    /// projection pushdown. Absent fields are dropped.
    pub fn project_indexes(&self, table_indexes: &[usize]) -> Vec<usize> {
        table_indexes
            .iter()
            .filter_map(|i| self.index_mapping[*i])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::DataField;

    fn field(id: i32, name: &str, data_type: DataType) -> DataField {
        DataField::new(id, name, data_type)
    }

    #[test]
    fn identity_mapping() {
        let fields = vec![field(0, "a", DataType::BigInt), field(1, "b", DataType::String)];
        let mapping = IndexCastMapping::between(&fields, &fields).unwrap();
        assert!(mapping.is_identity(2));
        let row = Row::new(vec![Datum::BigInt(1), Datum::String("x".into())]);
        assert_eq!(mapping.apply(&row), row);
    }

    #[test]
    fn reorder_cast_and_fill() {
        // data file written as (a INT, b STRING); table is now
        // (b STRING renamed to bb, a BIGINT, c DOUBLE added later)
        let data = vec![field(0, "a", DataType::Int), field(1, "b", DataType::String)];
        let table = vec![
            field(1, "bb", DataType::String),
            field(0, "a", DataType::BigInt),
            field(2, "c", DataType::Double),
        ];
        let mapping = IndexCastMapping::between(&table, &data).unwrap();
        let projected = mapping.apply(&Row::new(vec![Datum::Int(7), Datum::String("x".into())]));
        assert_eq!(
            projected,
            Row::new(vec![Datum::String("x".into()), Datum::BigInt(7), Datum::Null])
        );
    }

    #[test]
    fn narrowing_is_rejected() {
        let data = vec![field(0, "a", DataType::BigInt)];
        let table = vec![field(0, "a", DataType::Int)];
        assert!(matches!(
            IndexCastMapping::between(&table, &data),
            Err(Error::SchemaMismatch(_))
        ));
    }
}
