mod aggregate;
mod deduplicate;
mod partial_update;
mod value_count;

pub use aggregate::{AggregateFields, Aggregator};
pub use deduplicate::Deduplicate;
pub use partial_update::PartialUpdate;
pub use value_count::ValueCount;

use crate::{
    error::{Error, Result},
    io::KeyValue,
    options::{CoreOptions, MergeEngine},
    schema::TableSchema,
};

/// Consumes the records of a single key in `(sequence, arrival)` order and
/// emits at most one output value.
pub trait MergeFunction: Send {
    fn reset(&mut self);

    fn add(&mut self, kv: KeyValue) -> Result<()>;

    fn result(&mut self) -> Result<Option<KeyValue>>;
}

/// Creates fresh merge function instances for writers, compactions and
/// reads of one table.
#[derive(Clone)]
pub enum MergeFunctionFactory {
    Deduplicate,
    PartialUpdate { ignore_delete: bool },
    Aggregate { fields: AggregateFields },
    ValueCount,
}

impl MergeFunctionFactory {
    /// Resolve the factory for a primary-key table from its options.
    pub fn from_options(schema: &TableSchema, options: &CoreOptions) -> Result<Self> {
        match options.merge_engine {
            MergeEngine::Deduplicate => Ok(MergeFunctionFactory::Deduplicate),
            MergeEngine::PartialUpdate => Ok(MergeFunctionFactory::PartialUpdate {
                ignore_delete: options.partial_update_ignore_delete,
            }),
            MergeEngine::Aggregation => Ok(MergeFunctionFactory::Aggregate {
                fields: AggregateFields::from_options(schema, options)?,
            }),
        }
    }

    pub fn create(&self) -> Box<dyn MergeFunction> {
        match self {
            MergeFunctionFactory::Deduplicate => Box::new(Deduplicate::new()),
            MergeFunctionFactory::PartialUpdate { ignore_delete } => {
                Box::new(PartialUpdate::new(*ignore_delete))
            }
            MergeFunctionFactory::Aggregate { fields } => Box::new(fields.create()),
            MergeFunctionFactory::ValueCount => Box::new(ValueCount::new()),
        }
    }
}

pub(crate) fn retract_unsupported(what: &str) -> Error {
    Error::MergeUnsupported(format!("{what} cannot consume retraction records"))
}
