use crate::{error::Result, io::KeyValue, mergefn::MergeFunction, row::RowKind};

/// Keeps the record with the greatest sequence. The result retains its row
/// kind: a surviving DELETE still shadows older records at deeper levels,
/// so the caller drops retractions only where nothing older can exist.
#[derive(Debug, Default)]
pub struct Deduplicate {
    latest: Option<KeyValue>,
}

impl Deduplicate {
    pub fn new() -> Self {
        Deduplicate::default()
    }
}

impl MergeFunction for Deduplicate {
    fn reset(&mut self) {
        self.latest = None;
    }

    fn add(&mut self, kv: KeyValue) -> Result<()> {
        // records arrive in sequence order; the last one wins
        self.latest = Some(kv);
        Ok(())
    }

    fn result(&mut self) -> Result<Option<KeyValue>> {
        Ok(self.latest.take().map(|mut kv| {
            if kv.kind.is_add() {
                kv.kind = RowKind::Insert;
            }
            kv
        }))
    }
}
