//! Content-addressed patch storage.

use crate::error::{ServerError, ServerResult};
use parking_lot::RwLock;
use patchlog_protocol::Id;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// A content-addressed blob store keyed by patch id.
///
/// Storage is write-once in practice: a given id is stored at most once per
/// log. Overwriting the same id must not corrupt other entries. A stored
/// zero-length value is a warning condition (distinguishable from "never
/// stored") but never an error.
pub trait PatchStorage: Send + Sync {
    /// Stores `bytes` under `id`.
    fn store(&self, id: &Id, bytes: &[u8]) -> ServerResult<()>;

    /// Fetches the bytes stored under `id`, or `None` if absent.
    fn fetch(&self, id: &Id) -> ServerResult<Option<Vec<u8>>>;

    /// Deletes the entry for `id`. Deleting an absent id is a no-op.
    fn delete(&self, id: &Id) -> ServerResult<()>;

    /// All stored ids, in no particular order.
    fn find(&self) -> ServerResult<Vec<Id>>;

    /// Deletes everything. Used on log teardown.
    fn release(&self) -> ServerResult<()>;
}

/// In-memory patch storage, for ephemeral logs and tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    patches: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl PatchStorage for MemoryStorage {
    fn store(&self, id: &Id, bytes: &[u8]) -> ServerResult<()> {
        self.patches
            .write()
            .insert(id.to_string(), bytes.to_vec());
        Ok(())
    }

    fn fetch(&self, id: &Id) -> ServerResult<Option<Vec<u8>>> {
        let patches = self.patches.read();
        let found = patches.get(&id.to_string()).cloned();
        if let Some(bytes) = &found {
            if bytes.is_empty() {
                warn!(%id, "fetched zero-length patch");
            }
        }
        Ok(found)
    }

    fn delete(&self, id: &Id) -> ServerResult<()> {
        self.patches.write().remove(&id.to_string());
        Ok(())
    }

    fn find(&self) -> ServerResult<Vec<Id>> {
        Ok(self.patches.read().keys().map(|k| Id::parse(k)).collect())
    }

    fn release(&self) -> ServerResult<()> {
        self.patches.write().clear();
        Ok(())
    }
}

/// Filesystem patch storage: one file per patch, named by id.
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Opens (creating if needed) storage rooted at `dir`.
    pub fn open(dir: &Path) -> ServerResult<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path_of(&self, id: &Id) -> PathBuf {
        self.dir.join(id.to_string())
    }
}

impl PatchStorage for FileStorage {
    fn store(&self, id: &Id, bytes: &[u8]) -> ServerResult<()> {
        // Write to a temp name then rename so a crash mid-write never
        // leaves a torn entry under the real id.
        let tmp = self.dir.join(format!(".{id}.tmp"));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, self.path_of(id))?;
        Ok(())
    }

    fn fetch(&self, id: &Id) -> ServerResult<Option<Vec<u8>>> {
        match fs::read(self.path_of(id)) {
            Ok(bytes) => {
                if bytes.is_empty() {
                    warn!(%id, "fetched zero-length patch file");
                }
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ServerError::Io(e)),
        }
    }

    fn delete(&self, id: &Id) -> ServerResult<()> {
        match fs::remove_file(self.path_of(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ServerError::Io(e)),
        }
    }

    fn find(&self) -> ServerResult<Vec<Id>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            ids.push(Id::parse(&name));
        }
        Ok(ids)
    }

    fn release(&self) -> ServerResult<()> {
        for id in self.find()? {
            self.delete(&id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn exercise(storage: &dyn PatchStorage) {
        let id = Id::fresh();
        assert_eq!(storage.fetch(&id).unwrap(), None);

        storage.store(&id, b"patch bytes").unwrap();
        assert_eq!(storage.fetch(&id).unwrap().unwrap(), b"patch bytes");

        let other = Id::fresh();
        storage.store(&other, b"second").unwrap();
        let mut ids = storage.find().unwrap();
        ids.sort();
        let mut expected = vec![id.clone(), other.clone()];
        expected.sort();
        assert_eq!(ids, expected);

        storage.delete(&id).unwrap();
        assert_eq!(storage.fetch(&id).unwrap(), None);
        // Deleting again is a no-op.
        storage.delete(&id).unwrap();

        storage.release().unwrap();
        assert!(storage.find().unwrap().is_empty());
    }

    #[test]
    fn memory_storage() {
        exercise(&MemoryStorage::new());
    }

    #[test]
    fn file_storage() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).unwrap();
        exercise(&storage);
    }

    #[test]
    fn file_storage_persists() {
        let dir = tempdir().unwrap();
        let id = Id::fresh();
        {
            let storage = FileStorage::open(dir.path()).unwrap();
            storage.store(&id, b"durable").unwrap();
        }
        let storage = FileStorage::open(dir.path()).unwrap();
        assert_eq!(storage.fetch(&id).unwrap().unwrap(), b"durable");
    }

    #[test]
    fn zero_length_value_is_not_an_error() {
        let storage = MemoryStorage::new();
        let id = Id::fresh();
        storage.store(&id, b"").unwrap();
        assert_eq!(storage.fetch(&id).unwrap().unwrap(), Vec::<u8>::new());
    }
}
