pub mod local;

use std::{
    io::{Read, Seek, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use tracing::warn;

use crate::error::{Error, Result};

/// A readable, seekable input stream.
pub trait SeekableInput: Read + Seek + Send {}

impl<T> SeekableInput for T where T: Read + Seek + Send {}

/// Metadata of one directory entry.
#[derive(Debug, Clone)]
pub struct FileStatus {
    pub path: PathBuf,
    pub len: u64,
    pub is_dir: bool,
    /// Last modification time in unix millis, 0 when unknown.
    pub modified_millis: i64,
}

/// Abstract filesystem with the capabilities the engine relies on.
///
/// `rename` must be atomic when both paths live on the same store and must
/// fail closed: it never silently overwrites an existing destination.
/// Snapshot publication depends on exactly this property; stores without it
/// are wrapped in an external [`crate::commit::Lock`].
pub trait FileIO: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn SeekableInput>>;

    fn create(&self, path: &Path, overwrite: bool) -> Result<Box<dyn Write + Send>>;

    /// Atomically move `src` to `dst`. Returns `false` (without touching
    /// either path) when `dst` already exists.
    fn rename(&self, src: &Path, dst: &Path) -> Result<bool>;

    /// Returns `false` when the path did not exist.
    fn delete(&self, path: &Path) -> Result<bool>;

    fn exists(&self, path: &Path) -> Result<bool>;

    fn list_status(&self, dir: &Path) -> Result<Vec<FileStatus>>;

    fn mkdirs(&self, path: &Path) -> Result<()>;

    /// True for stores whose rename is not atomic (S3 and friends); commit
    /// then requires an external lock.
    fn is_object_store(&self) -> bool;

    fn read_to_bytes(&self, path: &Path) -> Result<Vec<u8>> {
        let mut input = self.open(path)?;
        let mut buf = Vec::new();
        input.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn read_to_string(&self, path: &Path) -> Result<String> {
        let bytes = self.read_to_bytes(path)?;
        String::from_utf8(bytes)
            .map_err(|_| Error::IoFatal(format!("{} is not valid utf-8", path.display())))
    }

    /// Write `content` to a temporary sibling, then atomically rename it
    /// into place. Returns `false` when the destination already exists.
    fn try_atomic_write(&self, path: &Path, content: &[u8]) -> Result<bool> {
        let tmp = temp_sibling(path);
        {
            let mut out = self.create(&tmp, true)?;
            out.write_all(content)?;
            out.flush()?;
        }
        let committed = self.rename(&tmp, path)?;
        if !committed {
            self.delete_quietly(&tmp);
        }
        Ok(committed)
    }

    /// Overwrite `path` with `content`, non-atomically. Used for advisory
    /// hint files only.
    fn write_overwrite(&self, path: &Path, content: &[u8]) -> Result<()> {
        let mut out = self.create(path, true)?;
        out.write_all(content)?;
        out.flush()?;
        Ok(())
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        let mut input = self.open(path)?;
        Ok(input.seek(std::io::SeekFrom::End(0))?)
    }

    fn delete_quietly(&self, path: &Path) {
        if let Err(err) = self.delete(path) {
            warn!(path = %path.display(), %err, "failed to delete file");
        }
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    path.with_file_name(format!(".{name}.tmp-{}", ulid::Ulid::new()))
}

const READ_RETRIES: usize = 3;

/// Retry an idempotent read a bounded number of times on transient errors.
/// Write paths never go through here.
pub fn retry_read<T>(mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if attempt + 1 < READ_RETRIES && is_transient(&err) => {
                attempt += 1;
                warn!(%err, attempt, "transient read error, retrying");
                std::thread::sleep(Duration::from_millis(10 << attempt));
            }
            Err(err) => return Err(err),
        }
    }
}

fn is_transient(err: &Error) -> bool {
    match err {
        Error::IoTransient(_) => true,
        Error::Io(io) => matches!(
            io.kind(),
            std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::ConnectionReset
        ),
        _ => false,
    }
}
