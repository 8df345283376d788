pub mod parquet;

use std::{io::Write, path::Path, sync::Arc};

use crate::{
    error::{Error, Result},
    fs::FileIO,
    options::CoreOptions,
    predicate::Predicate,
    row::Row,
    schema::RowType,
    stats::StatsMap,
};

/// Iterator of rows decoded from one file.
pub trait RecordIterator: Iterator<Item = Result<Row>> + Send {}

impl<T> RecordIterator for T where T: Iterator<Item = Result<Row>> + Send {}

/// Opens files of one format for reading, with projection and row-level
/// filters fixed at factory construction. Filters reference positions of
/// the rows the factory produces (i.e. post-projection).
pub trait FormatReaderFactory: Send + Sync {
    fn create_reader(&self, file_io: &dyn FileIO, path: &Path) -> Result<Box<dyn RecordIterator>>;
}

/// Sink for rows of one file.
pub trait FormatWriter: Send {
    fn write(&mut self, row: &Row) -> Result<()>;

    /// Flush and close the underlying output.
    fn finish(self: Box<Self>) -> Result<()>;
}

pub trait FormatWriterFactory: Send + Sync {
    fn create_writer(&self, out: Box<dyn Write + Send>) -> Result<Box<dyn FormatWriter>>;
}

/// Reads per-column stats of a finished file without decoding rows.
pub trait StatsExtractor: Send + Sync {
    fn extract(&self, file_io: &dyn FileIO, path: &Path) -> Result<StatsMap>;
}

/// Per-format capability: reader/writer factories plus an optional stats
/// extractor. When the extractor is absent the data-file writer collects
/// stats row by row while writing.
pub trait FileFormat: Send + Sync + std::fmt::Debug {
    fn identifier(&self) -> &str;

    /// File name extension, e.g. `parquet`.
    fn extension(&self) -> &str {
        self.identifier()
    }

    fn create_reader_factory(
        &self,
        row_type: &RowType,
        projection: Option<Vec<usize>>,
        filter: Option<Predicate>,
    ) -> Result<Arc<dyn FormatReaderFactory>>;

    fn create_writer_factory(&self, row_type: &RowType) -> Result<Arc<dyn FormatWriterFactory>>;

    fn create_stats_extractor(&self, row_type: &RowType)
        -> Result<Option<Arc<dyn StatsExtractor>>>;
}

/// Resolve the table's configured data file format.
pub fn discover(options: &CoreOptions) -> Result<Arc<dyn FileFormat>> {
    from_identifier(&options.file_format)
}

pub fn from_identifier(identifier: &str) -> Result<Arc<dyn FileFormat>> {
    match identifier {
        "parquet" => Ok(Arc::new(parquet::ParquetFileFormat::new())),
        other => Err(Error::ConfigInvalid(format!(
            "unsupported value '{other}' for 'file.format'"
        ))),
    }
}
