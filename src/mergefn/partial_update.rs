use crate::{
    error::{Error, Result},
    io::KeyValue,
    mergefn::MergeFunction,
    row::{Datum, Row, RowKind},
};

/// Folds records in sequence order, each non-null field overwriting the
/// accumulated row. Records with equal sequence fold in arrival order, so
/// the later arrival wins; reordering across a DELETE is refused, which is
/// why this function rejects retractions unless told to ignore them.
#[derive(Debug)]
pub struct PartialUpdate {
    ignore_delete: bool,
    current: Option<KeyValue>,
}

impl PartialUpdate {
    pub fn new(ignore_delete: bool) -> Self {
        PartialUpdate {
            ignore_delete,
            current: None,
        }
    }
}

impl MergeFunction for PartialUpdate {
    fn reset(&mut self) {
        self.current = None;
    }

    fn add(&mut self, kv: KeyValue) -> Result<()> {
        match kv.kind {
            RowKind::Insert | RowKind::UpdateAfter => match &mut self.current {
                None => self.current = Some(kv),
                Some(current) => {
                    let mut fields = current.value.fields().to_vec();
                    for (i, datum) in kv.value.fields().iter().enumerate() {
                        if !datum.is_null() {
                            fields[i] = datum.clone();
                        }
                    }
                    current.value = Row::new(fields);
                    current.sequence = kv.sequence;
                }
            },
            RowKind::UpdateBefore => {
                // the matching +U carries the full picture
            }
            RowKind::Delete => {
                if !self.ignore_delete {
                    return Err(Error::MergeUnsupported(
                        "partial-update cannot process DELETE records; \
                         set 'partial-update.ignore-delete' to drop them"
                            .to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn result(&mut self) -> Result<Option<KeyValue>> {
        Ok(self.current.take().map(|mut kv| {
            kv.kind = RowKind::Insert;
            kv
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(seq: i64, kind: RowKind, fields: Vec<Datum>) -> KeyValue {
        KeyValue::new(Row::new(vec![Datum::Int(1)]), seq, kind, Row::new(fields))
    }

    #[test]
    fn non_null_fields_overwrite() {
        let mut merge = PartialUpdate::new(false);
        merge
            .add(kv(
                1,
                RowKind::Insert,
                vec![Datum::Int(23), Datum::Int(10), Datum::Null],
            ))
            .unwrap();
        merge
            .add(kv(
                2,
                RowKind::Insert,
                vec![Datum::Null, Datum::Null, Datum::String("book".into())],
            ))
            .unwrap();
        merge
            .add(kv(
                3,
                RowKind::Insert,
                vec![Datum::Int(25), Datum::Null, Datum::Null],
            ))
            .unwrap();
        let out = merge.result().unwrap().unwrap();
        assert_eq!(
            out.value,
            Row::new(vec![
                Datum::Int(25),
                Datum::Int(10),
                Datum::String("book".into())
            ])
        );
    }

    #[test]
    fn delete_is_refused_without_opt_in() {
        let mut merge = PartialUpdate::new(false);
        let err = merge
            .add(kv(1, RowKind::Delete, vec![Datum::Null]))
            .unwrap_err();
        assert!(matches!(err, Error::MergeUnsupported(_)));
    }

    #[test]
    fn delete_is_dropped_with_opt_in() {
        let mut merge = PartialUpdate::new(true);
        merge
            .add(kv(1, RowKind::Insert, vec![Datum::Int(5)]))
            .unwrap();
        merge.add(kv(2, RowKind::Delete, vec![Datum::Null])).unwrap();
        let out = merge.result().unwrap().unwrap();
        assert_eq!(out.value, Row::new(vec![Datum::Int(5)]));
    }
}
