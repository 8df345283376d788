use std::{
    cmp::Ordering,
    collections::{BTreeMap, BinaryHeap},
    fs,
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::{
    error::{Error, Result},
    id::FileNames,
    io::KeyValue,
    row::{Row, RowKind},
};

/// Per-writer local scratch directory for spilled sorted runs. Owned
/// exclusively by the writing process and removed on drop.
pub struct ScratchSpace {
    dir: PathBuf,
    names: FileNames,
}

impl ScratchSpace {
    pub fn new(root: &Path) -> Result<Self> {
        let dir = root.join(format!("spill-{}", ulid::Ulid::new()));
        fs::create_dir_all(&dir)?;
        Ok(ScratchSpace {
            dir,
            names: FileNames::new(),
        })
    }

    fn new_run_path(&self) -> PathBuf {
        self.dir.join(self.names.spill_run())
    }
}

impl Drop for ScratchSpace {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BufferKey {
    key: Row,
    sequence: i64,
    /// Monotonic per-writer counter; breaks sequence ties so that the
    /// later arrival wins deterministically.
    arrival: u64,
}

impl PartialOrd for BufferKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BufferKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then(self.sequence.cmp(&other.sequence))
            .then(self.arrival.cmp(&other.arrival))
    }
}

/// In-memory sorted run of pending records, optionally spilling to local
/// disk when the memory budget is exceeded.
pub struct WriteBuffer {
    map: BTreeMap<BufferKey, (RowKind, Row)>,
    memory_bytes: usize,
    buffer_size: usize,
    page_size: usize,
    spillable: bool,
    scratch: ScratchSpace,
    spilled_runs: Vec<PathBuf>,
    spilled_records: u64,
    arrival: u64,
}

impl WriteBuffer {
    pub fn new(
        buffer_size: usize,
        page_size: usize,
        spillable: bool,
        scratch: ScratchSpace,
    ) -> Self {
        WriteBuffer {
            map: BTreeMap::new(),
            memory_bytes: 0,
            buffer_size,
            page_size: page_size.max(1024),
            spillable,
            scratch,
            spilled_runs: Vec::new(),
            spilled_records: 0,
            arrival: 0,
        }
    }

    /// Returns `true` when the memory budget is now exceeded; the caller
    /// spills or flushes.
    pub fn put(&mut self, sequence: i64, kind: RowKind, key: Row, value: Row) -> bool {
        self.arrival += 1;
        self.memory_bytes += key.estimated_size() + value.estimated_size() + 48;
        self.map.insert(
            BufferKey {
                key,
                sequence,
                arrival: self.arrival,
            },
            (kind, value),
        );
        self.memory_bytes > self.buffer_size
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty() && self.spilled_runs.is_empty()
    }

    pub fn record_count(&self) -> u64 {
        self.map.len() as u64 + self.spilled_records
    }

    pub fn memory_bytes(&self) -> usize {
        self.memory_bytes
    }

    pub fn spillable(&self) -> bool {
        self.spillable
    }

    pub fn spilled_run_count(&self) -> usize {
        self.spilled_runs.len()
    }

    /// Drain the in-memory run to a local sorted run file.
    pub fn spill(&mut self) -> Result<()> {
        if self.map.is_empty() {
            return Ok(());
        }
        let path = self.scratch.new_run_path();
        let mut out = BufWriter::with_capacity(self.page_size, fs::File::create(&path)?);
        let map = std::mem::take(&mut self.map);
        let mut records = 0u64;
        for (bk, (kind, value)) in map {
            let kv = KeyValue::new(bk.key, bk.sequence, kind, value);
            serde_json::to_writer(&mut out, &kv)?;
            out.write_all(b"\n")?;
            records += 1;
        }
        out.flush()?;
        debug!(records, path = %path.display(), "spilled write buffer run");
        self.spilled_records += records;
        self.spilled_runs.push(path);
        self.memory_bytes = 0;
        Ok(())
    }

    /// Consume everything buffered, in `(key, sequence, arrival)` order,
    /// merging the in-memory run with any spilled runs. The buffer is
    /// empty afterwards and spill files are removed.
    pub fn drain(&mut self) -> Result<DrainIter> {
        let mut sources: Vec<RunSource> = Vec::with_capacity(self.spilled_runs.len() + 1);
        for path in self.spilled_runs.drain(..) {
            sources.push(RunSource::Spilled(SpilledRun::open(path)?));
        }
        let map = std::mem::take(&mut self.map);
        sources.push(RunSource::Memory(map.into_iter()));
        self.memory_bytes = 0;
        self.spilled_records = 0;
        DrainIter::new(sources)
    }
}

struct SpilledRun {
    path: PathBuf,
    lines: std::io::Lines<BufReader<fs::File>>,
}

impl SpilledRun {
    fn open(path: PathBuf) -> Result<Self> {
        let file = fs::File::open(&path)?;
        Ok(SpilledRun {
            lines: BufReader::new(file).lines(),
            path,
        })
    }

    fn next(&mut self) -> Option<Result<KeyValue>> {
        loop {
            match self.lines.next()? {
                Err(err) => return Some(Err(Error::Io(err))),
                Ok(line) if line.is_empty() => continue,
                Ok(line) => {
                    return Some(serde_json::from_str(&line).map_err(Error::Json));
                }
            }
        }
    }
}

impl Drop for SpilledRun {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

enum RunSource {
    Spilled(SpilledRun),
    Memory(std::collections::btree_map::IntoIter<BufferKey, (RowKind, Row)>),
}

impl RunSource {
    fn next(&mut self) -> Option<Result<KeyValue>> {
        match self {
            RunSource::Spilled(run) => run.next(),
            RunSource::Memory(iter) => iter
                .next()
                .map(|(bk, (kind, value))| Ok(KeyValue::new(bk.key, bk.sequence, kind, value))),
        }
    }
}

struct DrainEntry {
    kv: KeyValue,
    source: usize,
    position: u64,
}

impl PartialEq for DrainEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DrainEntry {}

impl PartialOrd for DrainEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DrainEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // spilled runs precede the in-memory run at equal (key, sequence),
        // preserving arrival order across the spill boundary
        self.kv
            .key
            .cmp(&other.kv.key)
            .then(self.kv.sequence.cmp(&other.kv.sequence))
            .then(self.source.cmp(&other.source))
            .then(self.position.cmp(&other.position))
            .reverse()
    }
}

/// K-way merge over the buffer's runs.
pub struct DrainIter {
    sources: Vec<RunSource>,
    positions: Vec<u64>,
    heap: BinaryHeap<DrainEntry>,
}

impl DrainIter {
    fn new(sources: Vec<RunSource>) -> Result<Self> {
        let positions = vec![0; sources.len()];
        let mut iter = DrainIter {
            heap: BinaryHeap::with_capacity(sources.len()),
            positions,
            sources,
        };
        for i in 0..iter.sources.len() {
            iter.advance(i)?;
        }
        Ok(iter)
    }

    fn advance(&mut self, source: usize) -> Result<()> {
        if let Some(next) = self.sources[source].next() {
            self.positions[source] += 1;
            self.heap.push(DrainEntry {
                kv: next?,
                source,
                position: self.positions[source],
            });
        }
        Ok(())
    }
}

impl Iterator for DrainIter {
    type Item = Result<KeyValue>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.heap.pop()?;
        if let Err(err) = self.advance(entry.source) {
            return Some(Err(err));
        }
        Some(Ok(entry.kv))
    }
}
