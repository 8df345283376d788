use crate::{
    error::{Error, Result},
    io::KeyValue,
    mergefn::MergeFunction,
    row::{Datum, Row, RowKind},
};

/// Merge for tables keyed by the whole row: the value is a BIGINT count.
/// Counts add up; a key whose total drops to zero or below disappears.
#[derive(Debug, Default)]
pub struct ValueCount {
    total: i64,
    template: Option<KeyValue>,
}

impl ValueCount {
    pub fn new() -> Self {
        ValueCount::default()
    }
}

impl MergeFunction for ValueCount {
    fn reset(&mut self) {
        self.total = 0;
        self.template = None;
    }

    fn add(&mut self, kv: KeyValue) -> Result<()> {
        let count = match kv.value.get(0) {
            Datum::BigInt(count) => *count,
            other => {
                return Err(Error::IoFatal(format!(
                    "value-count table holds {other:?} instead of a BIGINT count"
                )))
            }
        };
        self.total += count;
        self.template = Some(kv);
        Ok(())
    }

    fn result(&mut self) -> Result<Option<KeyValue>> {
        let total = self.total;
        self.total = 0;
        // an exactly cancelled key carries no information; a negative
        // count must survive as a retraction until the terminal level
        Ok(self.template.take().filter(|_| total != 0).map(|mut kv| {
            kv.kind = if total > 0 {
                RowKind::Insert
            } else {
                RowKind::Delete
            };
            kv.value = Row::new(vec![Datum::BigInt(total)]);
            kv
        }))
    }
}
