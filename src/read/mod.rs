use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashMap, VecDeque},
    sync::Arc,
};

use parking_lot::Mutex;

use crate::{
    error::Result,
    format::{FileFormat, FormatReaderFactory, RecordIterator},
    fs::FileIO,
    io::{key_value_row_type, DataFileMeta, DataFilePathFactory, KeyValue, KeyValueSerializer},
    mergefn::{MergeFunction, MergeFunctionFactory},
    predicate::Predicate,
    row::{Datum, Row, RowKind},
    scan::split::DataSplit,
    schema::{evolution::IndexCastMapping, RowType, SchemaManager, TableSchema},
};

/// A key-value record iterator over one data file.
pub type KeyValueIterator = Box<dyn Iterator<Item = Result<KeyValue>> + Send>;

/// Opens key-value data files of one bucket, transparently projecting and
/// casting rows written under older schemas onto the current one.
pub struct KeyValueFileReaderFactory {
    file_io: Arc<dyn FileIO>,
    format: Arc<dyn FileFormat>,
    path_factory: Arc<DataFilePathFactory>,
    schema_manager: Arc<SchemaManager>,
    table_schema: TableSchema,
    key_type: RowType,
    value_type: RowType,
    /// value-count files key by the whole (evolving) row and hold a
    /// synthetic count value
    value_count_mode: bool,
    /// reader factories and mappings per data schema id
    per_schema: Mutex<HashMap<i64, Arc<SchemaReaders>>>,
}

struct SchemaReaders {
    reader_factory: Arc<dyn FormatReaderFactory>,
    serializer: KeyValueSerializer,
    key_mapping: Option<IndexCastMapping>,
    value_mapping: Option<IndexCastMapping>,
}

impl KeyValueFileReaderFactory {
    pub fn new(
        file_io: Arc<dyn FileIO>,
        format: Arc<dyn FileFormat>,
        path_factory: Arc<DataFilePathFactory>,
        schema_manager: Arc<SchemaManager>,
        table_schema: TableSchema,
    ) -> Self {
        let key_type = table_schema.key_type();
        let value_type = table_schema.row_type();
        KeyValueFileReaderFactory {
            file_io,
            format,
            path_factory,
            schema_manager,
            table_schema,
            key_type,
            value_type,
            value_count_mode: false,
            per_schema: Mutex::new(HashMap::new()),
        }
    }

    /// Factory for value-count tables: the key is the full row and the
    /// value is the `_VALUE_COUNT` column.
    pub fn for_value_count(
        file_io: Arc<dyn FileIO>,
        format: Arc<dyn FileFormat>,
        path_factory: Arc<DataFilePathFactory>,
        schema_manager: Arc<SchemaManager>,
        table_schema: TableSchema,
    ) -> Self {
        let key_type = table_schema.row_type();
        KeyValueFileReaderFactory {
            file_io,
            format,
            path_factory,
            schema_manager,
            table_schema,
            key_type,
            value_type: crate::io::count_value_type(),
            value_count_mode: true,
            per_schema: Mutex::new(HashMap::new()),
        }
    }

    pub fn key_type(&self) -> &RowType {
        &self.key_type
    }

    fn readers_for(&self, schema_id: i64) -> Result<Arc<SchemaReaders>> {
        if let Some(found) = self.per_schema.lock().get(&schema_id) {
            return Ok(found.clone());
        }
        let data_schema = if schema_id == self.table_schema.id {
            self.table_schema.clone()
        } else {
            self.schema_manager.schema(schema_id)?
        };
        let (data_key_type, data_value_type) = if self.value_count_mode {
            (data_schema.row_type(), crate::io::count_value_type())
        } else {
            // primary key columns cannot be dropped or retyped, so the
            // key shape is stable; only values evolve
            (self.key_type.clone(), data_schema.row_type())
        };
        let physical = key_value_row_type(&data_key_type, &data_value_type);
        let reader_factory = self.format.create_reader_factory(&physical, None, None)?;
        let key_mapping = IndexCastMapping::between(self.key_type.fields(), data_key_type.fields())?;
        let value_mapping =
            IndexCastMapping::between(self.value_type.fields(), data_value_type.fields())?;
        let readers = Arc::new(SchemaReaders {
            reader_factory,
            serializer: KeyValueSerializer::new(&data_key_type, &data_value_type),
            key_mapping: (!key_mapping.is_identity(data_key_type.len())).then_some(key_mapping),
            value_mapping: (!value_mapping.is_identity(data_value_type.len()))
                .then_some(value_mapping),
        });
        self.per_schema.lock().insert(schema_id, readers.clone());
        Ok(readers)
    }

    pub fn create_reader(&self, file: &DataFileMeta) -> Result<KeyValueIterator> {
        let readers = self.readers_for(file.schema_id)?;
        let path = self.path_factory.to_path(&file.file_name);
        let rows = readers.reader_factory.create_reader(self.file_io.as_ref(), &path)?;
        Ok(Box::new(KeyValueFileIterator { rows, readers }))
    }
}

struct KeyValueFileIterator {
    rows: Box<dyn RecordIterator>,
    readers: Arc<SchemaReaders>,
}

impl Iterator for KeyValueFileIterator {
    type Item = Result<KeyValue>;

    fn next(&mut self) -> Option<Self::Item> {
        let row = match self.rows.next()? {
            Ok(row) => row,
            Err(err) => return Some(Err(err)),
        };
        let mut kv = match self.readers.serializer.from_row(&row) {
            Ok(kv) => kv,
            Err(err) => return Some(Err(err)),
        };
        if let Some(mapping) = &self.readers.key_mapping {
            kv.key = mapping.apply(&kv.key);
        }
        if let Some(mapping) = &self.readers.value_mapping {
            kv.value = mapping.apply(&kv.value);
        }
        Some(Ok(kv))
    }
}

/// One sorted input of a k-way merge, tagged with its LSM level.
pub struct SortedSource {
    pub level: usize,
    pub iter: KeyValueIterator,
}

struct HeapEntry {
    kv: KeyValue,
    level: usize,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse for ascending (key, seq, source)
        self.kv
            .key
            .cmp(&other.kv.key)
            .then(self.kv.sequence.cmp(&other.kv.sequence))
            .then(self.source.cmp(&other.source))
            .reverse()
    }
}

/// K-way merge over sorted runs, yielding the records of one key at a time
/// in `(sequence, source)` order.
pub struct SortMergeIterator {
    heap: BinaryHeap<HeapEntry>,
    sources: Vec<SortedSource>,
}

impl SortMergeIterator {
    pub fn new(sources: Vec<SortedSource>) -> Result<Self> {
        let mut merge = SortMergeIterator {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
        };
        for index in 0..merge.sources.len() {
            merge.advance(index)?;
        }
        Ok(merge)
    }

    fn advance(&mut self, source: usize) -> Result<()> {
        let level = self.sources[source].level;
        if let Some(next) = self.sources[source].iter.next() {
            self.heap.push(HeapEntry {
                kv: next?,
                level,
                source,
            });
        }
        Ok(())
    }

    /// All records of the smallest remaining key. `None` when exhausted.
    pub fn next_group(&mut self) -> Result<Option<Vec<(KeyValue, usize)>>> {
        let Some(first) = self.heap.pop() else {
            return Ok(None);
        };
        let key = first.kv.key.clone();
        let mut group = Vec::new();
        self.advance(first.source)?;
        group.push((first.kv, first.level));
        while let Some(peeked) = self.heap.peek() {
            if peeked.kv.key != key {
                break;
            }
            let entry = self.heap.pop().expect("peeked entry present");
            self.advance(entry.source)?;
            group.push((entry.kv, entry.level));
        }
        Ok(Some(group))
    }
}

/// Applies a merge function to each key group and optionally drops
/// retraction results (sound only when nothing older can exist below).
pub struct MergeFunctionIterator {
    merge: SortMergeIterator,
    function: Box<dyn MergeFunction>,
    drop_delete: bool,
}

impl MergeFunctionIterator {
    pub fn new(
        sources: Vec<SortedSource>,
        factory: &MergeFunctionFactory,
        drop_delete: bool,
    ) -> Result<Self> {
        Ok(MergeFunctionIterator {
            merge: SortMergeIterator::new(sources)?,
            function: factory.create(),
            drop_delete,
        })
    }

    pub fn next_merged(&mut self) -> Result<Option<KeyValue>> {
        loop {
            let Some(group) = self.merge.next_group()? else {
                return Ok(None);
            };
            self.function.reset();
            for (kv, _level) in group {
                self.function.add(kv)?;
            }
            match self.function.result()? {
                None => continue,
                Some(kv) if self.drop_delete && kv.kind.is_retract() => continue,
                Some(kv) => return Ok(Some(kv)),
            }
        }
    }
}

/// Sequentially concatenates the files of an append-only split.
pub struct ConcatRecordReader {
    file_io: Arc<dyn FileIO>,
    reader_factory: Arc<dyn FormatReaderFactory>,
    path_factory: Arc<DataFilePathFactory>,
    files: VecDeque<DataFileMeta>,
    current: Option<Box<dyn RecordIterator>>,
}

impl ConcatRecordReader {
    pub fn new(
        file_io: Arc<dyn FileIO>,
        reader_factory: Arc<dyn FormatReaderFactory>,
        path_factory: Arc<DataFilePathFactory>,
        files: Vec<DataFileMeta>,
    ) -> Self {
        ConcatRecordReader {
            file_io,
            reader_factory,
            path_factory,
            files: files.into(),
            current: None,
        }
    }
}

impl Iterator for ConcatRecordReader {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(reader) = &mut self.current {
                match reader.next() {
                    Some(item) => return Some(item),
                    None => self.current = None,
                }
            }
            let file = self.files.pop_front()?;
            let path = self.path_factory.to_path(&file.file_name);
            match self
                .reader_factory
                .create_reader(self.file_io.as_ref(), &path)
            {
                Ok(reader) => self.current = Some(reader),
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

/// Output shape of a key-value read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadShape {
    /// The merged value as a row; `with_row_kind` prepends a virtual
    /// rowkind column (the audit shape).
    ValueContent { with_row_kind: bool },
    /// For tables keyed by the whole row: repeat the key `|count|` times,
    /// inserts for positive counts and deletes for negative ones.
    ValueCount { with_row_kind: bool },
}

/// Merging reader over the splits of a primary-key or value-count table.
pub struct KeyValueTableRead {
    reader_factory: Arc<KeyValueFileReaderFactory>,
    merge_factory: MergeFunctionFactory,
    shape: ReadShape,
    filter: Option<Predicate>,
}

impl KeyValueTableRead {
    pub fn new(
        reader_factory: Arc<KeyValueFileReaderFactory>,
        merge_factory: MergeFunctionFactory,
        shape: ReadShape,
    ) -> Self {
        KeyValueTableRead {
            reader_factory,
            merge_factory,
            shape,
            filter: None,
        }
    }

    /// Row-level filter applied after merging, over the produced rows.
    pub fn with_filter(mut self, filter: Predicate) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn create_reader(
        &self,
        split: &DataSplit,
    ) -> Result<Box<dyn Iterator<Item = Result<Row>> + Send>> {
        let mut sources = Vec::with_capacity(split.files.len());
        for file in &split.files {
            sources.push(SortedSource {
                level: file.level,
                iter: self.reader_factory.create_reader(file)?,
            });
        }
        // deletes may drop: a split covers every live record of its keys
        let merged = MergeFunctionIterator::new(sources, &self.merge_factory, false)?;
        let mut rows = ShapedRows {
            merged,
            shape: self.shape,
            pending: VecDeque::new(),
        };
        if let Some(filter) = self.filter.clone() {
            let filtered = std::iter::from_fn(move || loop {
                match rows.next() {
                    Some(Ok(row)) if !filter.test_row(&row) => continue,
                    other => return other,
                }
            });
            Ok(Box::new(filtered))
        } else {
            Ok(Box::new(std::iter::from_fn(move || rows.next())))
        }
    }
}

struct ShapedRows {
    merged: MergeFunctionIterator,
    shape: ReadShape,
    pending: VecDeque<Row>,
}

impl ShapedRows {
    fn shape_into_pending(&mut self, kv: KeyValue) {
        match self.shape {
            ReadShape::ValueContent { with_row_kind } => {
                if kv.kind.is_retract() {
                    return;
                }
                self.pending.push_back(shape_row(&kv, kv.value.clone(), with_row_kind));
            }
            ReadShape::ValueCount { with_row_kind } => {
                let count = match kv.value.get(0) {
                    Datum::BigInt(count) => *count,
                    _ => 0,
                };
                if count <= 0 && !with_row_kind {
                    // a net retraction has nothing to show in a plain read
                    return;
                }
                let repeat = count.unsigned_abs().min(u32::MAX as u64);
                for _ in 0..repeat {
                    self.pending.push_back(shape_row(&kv, kv.key.clone(), with_row_kind));
                }
            }
        }
    }
}

fn shape_row(kv: &KeyValue, mut content: Row, with_row_kind: bool) -> Row {
    if with_row_kind {
        let mut fields = Vec::with_capacity(content.len() + 1);
        fields.push(Datum::String(kv.kind.short_string().to_string()));
        fields.append(&mut content.0);
        Row::new(fields)
    } else {
        content
    }
}

impl Iterator for ShapedRows {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.pending.pop_front() {
                return Some(Ok(row));
            }
            match self.merged.next_merged() {
                Ok(Some(kv)) => self.shape_into_pending(kv),
                Ok(None) => return None,
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

/// Probes the pre-existing files of a bucket for the current value of a
/// key, newest first: level 0 by recency, then each deeper level. Backs
/// the `lookup` changelog producer.
pub struct LookupLevels {
    reader_factory: Arc<KeyValueFileReaderFactory>,
    /// files ordered newest to oldest
    files: Vec<DataFileMeta>,
    cache: HashMap<String, HashMap<Vec<u8>, KeyValue>>,
}

impl LookupLevels {
    pub fn new(reader_factory: Arc<KeyValueFileReaderFactory>, mut files: Vec<DataFileMeta>) -> Self {
        files.sort_by(|a, b| {
            a.level
                .cmp(&b.level)
                .then(b.max_sequence_number.cmp(&a.max_sequence_number))
        });
        LookupLevels {
            reader_factory,
            files,
            cache: HashMap::new(),
        }
    }

    pub fn lookup(&mut self, key: &Row) -> Result<Option<KeyValue>> {
        let key_bytes = key.canonical_bytes();
        for i in 0..self.files.len() {
            let file = self.files[i].clone();
            if file.row_count == 0 || key < &file.min_key || key > &file.max_key {
                continue;
            }
            if !self.cache.contains_key(&file.file_name) {
                let mut index: HashMap<Vec<u8>, KeyValue> = HashMap::new();
                let mut reader = self.reader_factory.create_reader(&file)?;
                // within one file keys are unique at level >= 1; at level 0
                // the greatest sequence wins
                for kv in reader.by_ref() {
                    let kv = kv?;
                    index.insert(kv.key.canonical_bytes(), kv);
                }
                self.cache.insert(file.file_name.clone(), index);
            }
            if let Some(found) = self
                .cache
                .get(&file.file_name)
                .and_then(|index| index.get(&key_bytes))
            {
                if found.kind.is_retract() {
                    return Ok(None);
                }
                return Ok(Some(found.clone()));
            }
        }
        Ok(None)
    }
}
