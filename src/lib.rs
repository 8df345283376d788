//! Snapshot-isolated, columnar, partitioned table storage over an
//! object-store-like filesystem.
//!
//! Three logical table shapes share one snapshot/manifest metadata plane
//! and a pluggable columnar file format:
//! - append-only tables,
//! - changelog tables with a primary key (an LSM merge tree per bucket),
//! - changelog tables keyed by the whole row with a value count.
//!
//! Writes flow through [`table::TableWrite`] into per-bucket merge trees,
//! are flushed as sorted runs, compacted universally, and installed
//! atomically by [`commit::FileStoreCommit`] as numbered snapshots. Reads
//! plan a snapshot through [`scan::FileStoreScan`] into splits and merge
//! them back with the table's merge function; a streaming consumer follows
//! new snapshots with [`enumerate::SnapshotEnumerator`].

pub mod commit;
pub mod enumerate;
pub mod error;
pub mod executor;
pub mod expire;
pub mod format;
pub mod fs;
pub mod id;
pub mod io;
pub mod manifest;
pub mod mergefn;
pub mod mergetree;
pub mod options;
pub mod partition;
pub mod predicate;
pub mod read;
pub mod row;
pub mod scan;
pub mod schema;
pub mod snapshot;
pub mod stats;
pub mod table;
pub mod types;

#[cfg(test)]
mod tests_internal;

pub use error::{Error, Result};
pub use options::CoreOptions;
pub use predicate::{CompareOp, Predicate};
pub use row::{Datum, Row, RowKind};
pub use schema::{column, ColumnDef, SchemaChange, TableDefinition, TableSchema};
pub use table::{FileStoreTable, TableKind, TableRead, TableWrite};
pub use types::DataType;
