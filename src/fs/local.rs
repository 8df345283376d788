use std::{
    fs,
    io::{BufWriter, ErrorKind, Write},
    path::Path,
    time::UNIX_EPOCH,
};

use crate::{
    error::{Error, Result},
    fs::{FileIO, FileStatus, SeekableInput},
};

/// [`FileIO`] over the local filesystem.
///
/// Atomic fail-closed rename is implemented with `hard_link` + unlink:
/// linking fails with `AlreadyExists` when the destination is present, and
/// the link itself is atomic on POSIX filesystems.
#[derive(Debug, Default, Clone)]
pub struct LocalFileIO;

impl LocalFileIO {
    pub fn new() -> Self {
        LocalFileIO
    }
}

impl FileIO for LocalFileIO {
    fn open(&self, path: &Path) -> Result<Box<dyn SeekableInput>> {
        let file = fs::File::open(path).map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                Error::IoFatal(format!("file not found: {}", path.display()))
            } else {
                Error::Io(err)
            }
        })?;
        Ok(Box::new(file))
    }

    fn create(&self, path: &Path, overwrite: bool) -> Result<Box<dyn Write + Send>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = if overwrite {
            fs::File::create(path)?
        } else {
            fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)?
        };
        Ok(Box::new(BufWriter::new(file)))
    }

    fn rename(&self, src: &Path, dst: &Path) -> Result<bool> {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::hard_link(src, dst) {
            Ok(()) => {
                fs::remove_file(src)?;
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(Error::Io(err)),
        }
    }

    fn delete(&self, path: &Path) -> Result<bool> {
        let result = if path.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };
        match result {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(Error::Io(err)),
        }
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(path.exists())
    }

    fn list_status(&self, dir: &Path) -> Result<Vec<FileStatus>> {
        let mut statuses = Vec::new();
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(statuses),
            Err(err) => return Err(Error::Io(err)),
        };
        for entry in entries {
            let entry = entry?;
            let meta = entry.metadata()?;
            let modified_millis = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);
            statuses.push(FileStatus {
                path: entry.path(),
                len: meta.len(),
                is_dir: meta.is_dir(),
                modified_millis,
            });
        }
        Ok(statuses)
    }

    fn mkdirs(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)?;
        Ok(())
    }

    fn is_object_store(&self) -> bool {
        false
    }
}
