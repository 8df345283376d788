use std::{io::Write, path::Path, sync::Arc};

use arrow::{
    array::{
        Array, ArrayRef, BinaryArray, BinaryBuilder, BooleanArray, BooleanBuilder, Date32Array,
        Date32Builder, Float64Array, Float64Builder, Int32Array, Int32Builder, Int64Array,
        Int64Builder, StringArray, StringBuilder, TimestampMillisecondArray,
        TimestampMillisecondBuilder,
    },
    datatypes::{DataType as ArrowType, Field, Schema as ArrowSchema, SchemaRef, TimeUnit},
    record_batch::RecordBatch,
};
use bytes::Bytes;
use parquet::{
    arrow::{arrow_reader::ParquetRecordBatchReaderBuilder, ArrowWriter, ProjectionMask},
    basic::Compression,
    file::properties::WriterProperties,
};

use crate::{
    error::{Error, Result},
    format::{FileFormat, FormatReaderFactory, FormatWriter, FormatWriterFactory, RecordIterator, StatsExtractor},
    fs::FileIO,
    predicate::Predicate,
    row::{Datum, Row},
    schema::RowType,
    types::DataType,
};

const WRITE_BATCH_SIZE: usize = 1024;

/// Columnar [`FileFormat`] backed by arrow + parquet.
#[derive(Debug, Default)]
pub struct ParquetFileFormat;

impl ParquetFileFormat {
    pub fn new() -> Self {
        ParquetFileFormat
    }
}

impl FileFormat for ParquetFileFormat {
    fn identifier(&self) -> &str {
        "parquet"
    }

    fn create_reader_factory(
        &self,
        row_type: &RowType,
        projection: Option<Vec<usize>>,
        filter: Option<Predicate>,
    ) -> Result<Arc<dyn FormatReaderFactory>> {
        let projected_type = match &projection {
            Some(indexes) => row_type.project(indexes),
            None => row_type.clone(),
        };
        Ok(Arc::new(ParquetReaderFactory {
            projected_type,
            projection,
            filter,
        }))
    }

    fn create_writer_factory(&self, row_type: &RowType) -> Result<Arc<dyn FormatWriterFactory>> {
        Ok(Arc::new(ParquetWriterFactory {
            schema: to_arrow_schema(row_type),
            row_type: row_type.clone(),
        }))
    }

    fn create_stats_extractor(
        &self,
        _row_type: &RowType,
    ) -> Result<Option<Arc<dyn StatsExtractor>>> {
        // stats are collected row-wise while writing
        Ok(None)
    }
}

fn to_arrow_schema(row_type: &RowType) -> SchemaRef {
    let fields: Vec<Field> = row_type
        .fields()
        .iter()
        .map(|f| Field::new(&f.name, to_arrow_type(f.data_type), true))
        .collect();
    Arc::new(ArrowSchema::new(fields))
}

fn to_arrow_type(data_type: DataType) -> ArrowType {
    match data_type {
        DataType::Boolean => ArrowType::Boolean,
        DataType::Int => ArrowType::Int32,
        DataType::BigInt => ArrowType::Int64,
        DataType::Double => ArrowType::Float64,
        DataType::String => ArrowType::Utf8,
        DataType::Bytes => ArrowType::Binary,
        DataType::Timestamp => ArrowType::Timestamp(TimeUnit::Millisecond, None),
        DataType::Date => ArrowType::Date32,
    }
}

struct ParquetWriterFactory {
    schema: SchemaRef,
    row_type: RowType,
}

impl FormatWriterFactory for ParquetWriterFactory {
    fn create_writer(&self, out: Box<dyn Write + Send>) -> Result<Box<dyn FormatWriter>> {
        let properties = WriterProperties::builder()
            .set_compression(Compression::LZ4)
            .build();
        let writer = ArrowWriter::try_new(out, self.schema.clone(), Some(properties))?;
        Ok(Box::new(ParquetFormatWriter {
            writer,
            schema: self.schema.clone(),
            row_type: self.row_type.clone(),
            buffered: Vec::with_capacity(WRITE_BATCH_SIZE),
        }))
    }
}

struct ParquetFormatWriter {
    writer: ArrowWriter<Box<dyn Write + Send>>,
    schema: SchemaRef,
    row_type: RowType,
    buffered: Vec<Row>,
}

impl ParquetFormatWriter {
    fn flush_batch(&mut self) -> Result<()> {
        if self.buffered.is_empty() {
            return Ok(());
        }
        let batch = rows_to_batch(&self.schema, &self.row_type, &self.buffered)?;
        self.writer.write(&batch)?;
        self.buffered.clear();
        Ok(())
    }
}

impl FormatWriter for ParquetFormatWriter {
    fn write(&mut self, row: &Row) -> Result<()> {
        if row.len() != self.row_type.len() {
            return Err(Error::SchemaMismatch(format!(
                "row has {} fields, writer expects {}",
                row.len(),
                self.row_type.len()
            )));
        }
        self.buffered.push(row.clone());
        if self.buffered.len() >= WRITE_BATCH_SIZE {
            self.flush_batch()?;
        }
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        self.flush_batch()?;
        let mut inner = self.writer.into_inner()?;
        inner.flush()?;
        Ok(())
    }
}

fn rows_to_batch(schema: &SchemaRef, row_type: &RowType, rows: &[Row]) -> Result<RecordBatch> {
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(row_type.len());
    for (column, field) in row_type.fields().iter().enumerate() {
        let array: ArrayRef = match field.data_type {
            DataType::Boolean => {
                let mut builder = BooleanBuilder::with_capacity(rows.len());
                for row in rows {
                    match row.get(column) {
                        Datum::Null => builder.append_null(),
                        Datum::Boolean(v) => builder.append_value(*v),
                        other => return Err(type_error(field.data_type, other)),
                    }
                }
                Arc::new(builder.finish())
            }
            DataType::Int => {
                let mut builder = Int32Builder::with_capacity(rows.len());
                for row in rows {
                    match row.get(column) {
                        Datum::Null => builder.append_null(),
                        Datum::Int(v) => builder.append_value(*v),
                        other => return Err(type_error(field.data_type, other)),
                    }
                }
                Arc::new(builder.finish())
            }
            DataType::BigInt => {
                let mut builder = Int64Builder::with_capacity(rows.len());
                for row in rows {
                    match row.get(column) {
                        Datum::Null => builder.append_null(),
                        Datum::BigInt(v) => builder.append_value(*v),
                        other => return Err(type_error(field.data_type, other)),
                    }
                }
                Arc::new(builder.finish())
            }
            DataType::Double => {
                let mut builder = Float64Builder::with_capacity(rows.len());
                for row in rows {
                    match row.get(column) {
                        Datum::Null => builder.append_null(),
                        Datum::Double(v) => builder.append_value(*v),
                        other => return Err(type_error(field.data_type, other)),
                    }
                }
                Arc::new(builder.finish())
            }
            DataType::String => {
                let mut builder = StringBuilder::new();
                for row in rows {
                    match row.get(column) {
                        Datum::Null => builder.append_null(),
                        Datum::String(v) => builder.append_value(v),
                        other => return Err(type_error(field.data_type, other)),
                    }
                }
                Arc::new(builder.finish())
            }
            DataType::Bytes => {
                let mut builder = BinaryBuilder::new();
                for row in rows {
                    match row.get(column) {
                        Datum::Null => builder.append_null(),
                        Datum::Bytes(v) => builder.append_value(v),
                        other => return Err(type_error(field.data_type, other)),
                    }
                }
                Arc::new(builder.finish())
            }
            DataType::Timestamp => {
                let mut builder = TimestampMillisecondBuilder::with_capacity(rows.len());
                for row in rows {
                    match row.get(column) {
                        Datum::Null => builder.append_null(),
                        Datum::Timestamp(v) => builder.append_value(*v),
                        other => return Err(type_error(field.data_type, other)),
                    }
                }
                Arc::new(builder.finish())
            }
            DataType::Date => {
                let mut builder = Date32Builder::with_capacity(rows.len());
                for row in rows {
                    match row.get(column) {
                        Datum::Null => builder.append_null(),
                        Datum::Date(v) => builder.append_value(*v),
                        other => return Err(type_error(field.data_type, other)),
                    }
                }
                Arc::new(builder.finish())
            }
        };
        arrays.push(array);
    }
    Ok(RecordBatch::try_new(schema.clone(), arrays)?)
}

fn type_error(expected: DataType, actual: &Datum) -> Error {
    Error::SchemaMismatch(format!("expected {expected} value, found {actual:?}"))
}

struct ParquetReaderFactory {
    projected_type: RowType,
    projection: Option<Vec<usize>>,
    filter: Option<Predicate>,
}

impl FormatReaderFactory for ParquetReaderFactory {
    fn create_reader(&self, file_io: &dyn FileIO, path: &Path) -> Result<Box<dyn RecordIterator>> {
        let bytes = Bytes::from(file_io.read_to_bytes(path)?);
        let mut builder = ParquetRecordBatchReaderBuilder::try_new(bytes)?;
        if let Some(indexes) = &self.projection {
            let mask = ProjectionMask::roots(builder.parquet_schema(), indexes.iter().copied());
            builder = builder.with_projection(mask);
        }
        let reader = builder.build()?;

        let projected_type = self.projected_type.clone();
        let filter = self.filter.clone();
        let mut pending: Vec<Row> = Vec::new();
        let mut batches = reader;
        let iter = std::iter::from_fn(move || loop {
            if let Some(row) = pending.pop() {
                return Some(Ok(row));
            }
            match batches.next() {
                None => return None,
                Some(Err(err)) => return Some(Err(Error::Arrow(err))),
                Some(Ok(batch)) => {
                    let mut rows = match batch_to_rows(&projected_type, &batch) {
                        Ok(rows) => rows,
                        Err(err) => return Some(Err(err)),
                    };
                    if let Some(filter) = &filter {
                        rows.retain(|row| filter.test_row(row));
                    }
                    rows.reverse();
                    pending = rows;
                }
            }
        });
        Ok(Box::new(iter))
    }
}

fn batch_to_rows(row_type: &RowType, batch: &RecordBatch) -> Result<Vec<Row>> {
    if batch.num_columns() != row_type.len() {
        return Err(Error::SchemaMismatch(format!(
            "file has {} columns, reader expects {}",
            batch.num_columns(),
            row_type.len()
        )));
    }
    let mut rows = vec![Vec::with_capacity(row_type.len()); batch.num_rows()];
    for (column, field) in row_type.fields().iter().enumerate() {
        let array = batch.column(column);
        for (i, row) in rows.iter_mut().enumerate() {
            row.push(read_datum(field.data_type, array.as_ref(), i)?);
        }
    }
    Ok(rows.into_iter().map(Row::new).collect())
}

fn read_datum(data_type: DataType, array: &dyn Array, index: usize) -> Result<Datum> {
    if array.is_null(index) {
        return Ok(Datum::Null);
    }
    let datum = match data_type {
        DataType::Boolean => Datum::Boolean(downcast::<BooleanArray>(array)?.value(index)),
        DataType::Int => Datum::Int(downcast::<Int32Array>(array)?.value(index)),
        DataType::BigInt => Datum::BigInt(downcast::<Int64Array>(array)?.value(index)),
        DataType::Double => Datum::Double(downcast::<Float64Array>(array)?.value(index)),
        DataType::String => Datum::String(downcast::<StringArray>(array)?.value(index).to_string()),
        DataType::Bytes => Datum::Bytes(downcast::<BinaryArray>(array)?.value(index).to_vec()),
        DataType::Timestamp => {
            Datum::Timestamp(downcast::<TimestampMillisecondArray>(array)?.value(index))
        }
        DataType::Date => Datum::Date(downcast::<Date32Array>(array)?.value(index)),
    };
    Ok(datum)
}

fn downcast<T: 'static>(array: &dyn Array) -> Result<&T> {
    array.as_any().downcast_ref::<T>().ok_or_else(|| {
        Error::SchemaMismatch(format!(
            "unexpected arrow array type {:?}",
            array.data_type()
        ))
    })
}
