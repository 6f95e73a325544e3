//! One append-only patch log: sequencing index plus patch storage.

use crate::error::{ServerError, ServerResult};
use crate::index::PatchLogIndex;
use crate::storage::PatchStorage;
use patchlog_protocol::{DataSourceDescription, Id, Patch, PatchLogInfo, Version};
use std::sync::Arc;
use tracing::{debug, info};

/// An append-only, strictly versioned log of patches for one data source.
///
/// All sequencing decisions happen under the index's log lock. The patch
/// body is stored before the index commits the new version, so a reader
/// that sees a version can always fetch its patch.
pub struct PatchLog {
    source: DataSourceDescription,
    index: Arc<dyn PatchLogIndex>,
    storage: Arc<dyn PatchStorage>,
}

impl PatchLog {
    /// Assembles a log from its parts.
    pub fn new(
        source: DataSourceDescription,
        index: Arc<dyn PatchLogIndex>,
        storage: Arc<dyn PatchStorage>,
    ) -> Self {
        Self {
            source,
            index,
            storage,
        }
    }

    /// The description of the data source this log belongs to.
    pub fn source(&self) -> &DataSourceDescription {
        &self.source
    }

    /// Latest committed version; INIT for an empty log.
    pub fn current_version(&self) -> Version {
        self.index.current_version()
    }

    /// Appends `patch`, assigning and returning its version.
    ///
    /// A patch without an id gets a fresh one. Appending a patch whose id is
    /// already the head is idempotent and returns the head version. The
    /// `previous` header is not enforced against the current head; a
    /// mismatch is logged and the append proceeds.
    pub fn append(&self, patch: &Patch) -> ServerResult<Version> {
        let _guard = self.index.log_lock().acquire()?;

        let mut patch = patch.clone();
        let id = match patch.id() {
            Some(id) => id,
            None => {
                let id = Id::fresh();
                patch.set_id(&id);
                id
            }
        };

        // Re-sending the head patch is a retry, not a new append.
        if self.index.current_id().as_ref() == Some(&id) {
            debug!(log = %self.source.name, %id, "append of current head is a no-op");
            return Ok(self.index.current_version());
        }

        if patch.previous() != self.index.current_id() {
            debug!(
                log = %self.source.name,
                declared = ?patch.previous(),
                head = ?self.index.current_id(),
                "previous header does not name the current head"
            );
        }

        let version = self.index.next_version();
        let previous = self.index.current_id();

        // Store first so the index never points at a missing patch.
        self.storage.store(&id, &patch.encode())?;
        self.index.save(version, &id, previous.as_ref())?;

        info!(log = %self.source.name, %version, %id, "appended patch");
        Ok(version)
    }

    /// Fetches the patch committed at `version`, or `None` if the version
    /// is invalid, beyond the head, or its index entry is missing.
    pub fn fetch_version(&self, version: Version) -> ServerResult<Option<Patch>> {
        if !version.is_valid() || version > self.index.current_version() {
            return Ok(None);
        }
        match self.index.version_to_id(version)? {
            None => Ok(None),
            Some(id) => self.fetch_id(&id),
        }
    }

    /// Fetches the patch with the given id, or `None` if absent.
    pub fn fetch_id(&self, id: &Id) -> ServerResult<Option<Patch>> {
        match self.storage.fetch(id)? {
            None => Ok(None),
            Some(bytes) => {
                let patch = Patch::decode(&bytes).map_err(|e| {
                    ServerError::Inconsistency(format!("stored patch {id} is unreadable: {e}"))
                })?;
                Ok(Some(patch))
            }
        }
    }

    /// A snapshot of the log's version range and head.
    pub fn info(&self) -> PatchLogInfo {
        PatchLogInfo {
            source: self.source.clone(),
            min_version: self.index.earliest_version(),
            max_version: self.index.current_version(),
            latest_patch: self.index.current_id(),
        }
    }

    /// Re-reads index state from its backing store.
    pub fn refresh(&self) -> ServerResult<()> {
        self.index.refresh()
    }

    /// Deletes all stored patches. Called on log removal.
    pub fn release(&self) -> ServerResult<()> {
        self.storage.release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::MemoryIndex;
    use crate::storage::MemoryStorage;
    use patchlog_protocol::Id;

    fn log() -> PatchLog {
        let source = DataSourceDescription {
            id: Id::fresh(),
            name: "test".to_string(),
            uri: "http://example.org/test".to_string(),
        };
        PatchLog::new(
            source,
            Arc::new(MemoryIndex::new()),
            Arc::new(MemoryStorage::new()),
        )
    }

    #[test]
    fn appends_number_from_one() {
        let log = log();
        assert_eq!(log.current_version(), Version::INIT);

        let v1 = log.append(&Patch::new(Id::fresh(), b"a".to_vec())).unwrap();
        let v2 = log.append(&Patch::new(Id::fresh(), b"b".to_vec())).unwrap();
        assert_eq!(v1, Version::FIRST);
        assert_eq!(v2, Version::new(2));
        assert_eq!(log.current_version(), Version::new(2));
    }

    #[test]
    fn anonymous_patch_gets_an_id() {
        let log = log();
        let version = log.append(&Patch::anonymous(b"body".to_vec())).unwrap();
        let stored = log.fetch_version(version).unwrap().unwrap();
        assert!(stored.id().is_some());
    }

    #[test]
    fn repeat_append_of_head_is_idempotent() {
        let log = log();
        let patch = Patch::new(Id::fresh(), b"once".to_vec());
        let v1 = log.append(&patch).unwrap();
        let v2 = log.append(&patch).unwrap();
        assert_eq!(v1, v2);
        assert_eq!(log.current_version(), Version::FIRST);
    }

    #[test]
    fn fetch_by_version_and_id() {
        let log = log();
        let id = Id::fresh();
        let version = log.append(&Patch::new(id.clone(), b"body".to_vec())).unwrap();

        let by_version = log.fetch_version(version).unwrap().unwrap();
        assert_eq!(by_version.body(), b"body");
        let by_id = log.fetch_id(&id).unwrap().unwrap();
        assert_eq!(by_id, by_version);
    }

    #[test]
    fn fetch_out_of_range_is_none() {
        let log = log();
        log.append(&Patch::anonymous(b"x".to_vec())).unwrap();

        assert_eq!(log.fetch_version(Version::UNSET).unwrap(), None);
        assert_eq!(log.fetch_version(Version::INIT).unwrap(), None);
        assert_eq!(log.fetch_version(Version::new(2)).unwrap(), None);
        assert_eq!(log.fetch_id(&Id::fresh()).unwrap(), None);
    }

    #[test]
    fn mismatched_previous_is_accepted() {
        let log = log();
        log.append(&Patch::anonymous(b"first".to_vec())).unwrap();

        let mut patch = Patch::new(Id::fresh(), b"second".to_vec());
        patch.set_previous(&Id::fresh());
        let version = log.append(&patch).unwrap();
        assert_eq!(version, Version::new(2));
    }

    #[test]
    fn info_reports_range_and_head() {
        let log = log();
        let empty = log.info();
        assert_eq!(empty.min_version, Version::INIT);
        assert_eq!(empty.max_version, Version::INIT);
        assert!(empty.latest_patch.is_none());

        let id1 = Id::fresh();
        let id2 = Id::fresh();
        log.append(&Patch::new(id1, b"a".to_vec())).unwrap();
        log.append(&Patch::new(id2.clone(), b"b".to_vec())).unwrap();

        let info = log.info();
        assert_eq!(info.min_version, Version::FIRST);
        assert_eq!(info.max_version, Version::new(2));
        assert_eq!(info.latest_patch, Some(id2));
    }
}
