use parking_lot::Mutex;
use ulid::{Generator, Ulid};

/// Identifier embedded in the name of every persisted artifact.
pub type FileId = Ulid;

pub const DATA_FILE_PREFIX: &str = "data-";
pub const CHANGELOG_FILE_PREFIX: &str = "changelog-";
pub const MANIFEST_PREFIX: &str = "manifest-";
pub const MANIFEST_LIST_PREFIX: &str = "manifest-list-";
pub const SPILL_RUN_PREFIX: &str = "run-";

/// Names the persisted artifacts of one store component.
///
/// Ids are time-ordered and monotonic within a component, so a directory
/// listing sorts in creation order and a rolling writer can never collide
/// with a file it just closed. The naming scheme itself is part of the
/// on-disk contract: expiration and orphan cleanup recognize artifacts by
/// these prefixes.
pub struct FileNames {
    ids: Mutex<Generator>,
}

impl FileNames {
    pub fn new() -> Self {
        FileNames {
            ids: Mutex::new(Generator::new()),
        }
    }

    fn next_id(&self) -> FileId {
        let mut ids = self.ids.lock();
        // monotonic within the same millisecond; on per-millisecond
        // overflow fall back to a fresh random id rather than stalling
        ids.generate().unwrap_or_else(|_| Ulid::new())
    }

    /// `data-<id>.<extension>`, a sorted run of records in one bucket.
    pub fn data_file(&self, extension: &str) -> String {
        format!("{DATA_FILE_PREFIX}{}.{extension}", self.next_id())
    }

    /// `changelog-<id>.<extension>`, change records emitted alongside a
    /// bucket's data files.
    pub fn changelog_file(&self, extension: &str) -> String {
        format!("{CHANGELOG_FILE_PREFIX}{}.{extension}", self.next_id())
    }

    /// `manifest-<id>`, a list of data-file ADD/DELETE entries.
    pub fn manifest(&self) -> String {
        format!("{MANIFEST_PREFIX}{}", self.next_id())
    }

    /// `manifest-list-<id>`, the manifests composing one snapshot diff.
    pub fn manifest_list(&self) -> String {
        format!("{MANIFEST_LIST_PREFIX}{}", self.next_id())
    }

    /// `run-<id>`, a writer-local spilled sorted run in scratch space.
    pub fn spill_run(&self) -> String {
        format!("{SPILL_RUN_PREFIX}{}", self.next_id())
    }
}

impl Default for FileNames {
    fn default() -> Self {
        Self::new()
    }
}
