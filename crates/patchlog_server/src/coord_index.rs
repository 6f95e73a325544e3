//! Coordination-backed index and storage for multi-server deployments.
//!
//! The head state lives in a shared node watched for external changes, so
//! the in-memory cache self-updates when another server instance commits.
//! `save` additionally writes an immutable version-indexed node and a
//! per-patch audit node. The log lock is the coordination service's
//! cross-process lock for this log's path.

use crate::coord::{get_json, join, put_json, Coordination};
use crate::error::{ServerError, ServerResult};
use crate::index::{classify_save, HeadState, PatchEntry, PatchLogIndex, SaveAction};
use crate::lock::LogLock;
use crate::storage::PatchStorage;
use parking_lot::RwLock;
use patchlog_protocol::{Id, Version};
use std::sync::Arc;
use tracing::warn;

const NODE_STATE: &str = "state";
const NODE_LOCK: &str = "lock";
const NODE_VERSIONS: &str = "versions";
const NODE_HEADERS: &str = "headers";
const NODE_PATCHES: &str = "patches";

/// A [`PatchLogIndex`] whose backing store is a coordination service node
/// tree rooted at one log's path.
pub struct CoordIndex {
    coord: Arc<dyn Coordination>,
    prefix: String,
    head: RwLock<HeadState>,
    earliest: RwLock<Option<(Version, Id)>>,
    lock: LogLock,
}

impl CoordIndex {
    /// Formats a new index under `prefix`, writing the INIT state.
    pub fn format(coord: Arc<dyn Coordination>, prefix: &str) -> ServerResult<Arc<Self>> {
        put_json(coord.as_ref(), &join(prefix, NODE_STATE), &HeadState::init())?;
        Self::build(coord, prefix, HeadState::init())
    }

    /// Attaches to an existing index under `prefix`.
    pub fn attach(coord: Arc<dyn Coordination>, prefix: &str) -> ServerResult<Arc<Self>> {
        let head: HeadState = get_json(coord.as_ref(), &join(prefix, NODE_STATE))?
            .ok_or_else(|| {
                ServerError::Configuration(format!("no state node under {prefix}"))
            })?;
        let index = Self::build(coord, prefix, head)?;
        index.load_earliest()?;
        Ok(index)
    }

    fn build(
        coord: Arc<dyn Coordination>,
        prefix: &str,
        head: HeadState,
    ) -> ServerResult<Arc<Self>> {
        let lock = LogLock::with_distributed(coord.lock(&join(prefix, NODE_LOCK)));
        let index = Arc::new(Self {
            coord: Arc::clone(&coord),
            prefix: prefix.to_string(),
            head: RwLock::new(head),
            earliest: RwLock::new(None),
            lock,
        });

        // The watcher re-derives in-memory state whenever the shared node
        // changes; refresh ignores stale snapshots, so a watch firing for
        // our own in-flight save under the lock is harmless.
        let weak = Arc::downgrade(&index);
        let state_path = join(prefix, NODE_STATE);
        coord.watch(
            &state_path,
            Arc::new(move || {
                if let Some(index) = weak.upgrade() {
                    if let Err(e) = index.refresh() {
                        warn!("state watch refresh failed: {e}");
                    }
                }
            }),
        )?;
        Ok(index)
    }

    fn state_path(&self) -> String {
        join(&self.prefix, NODE_STATE)
    }

    fn version_path(&self, version: Version) -> String {
        join(
            &join(&self.prefix, NODE_VERSIONS),
            &format!("{:08}", version.value()),
        )
    }

    fn header_path(&self, id: &Id) -> String {
        join(&join(&self.prefix, NODE_HEADERS), &id.to_string())
    }

    fn load_earliest(&self) -> ServerResult<()> {
        let versions_path = join(&self.prefix, NODE_VERSIONS);
        let min = self
            .coord
            .children(&versions_path)?
            .into_iter()
            .filter_map(|name| name.parse::<i64>().ok())
            .min();
        if let Some(v) = min {
            let version = Version::new(v);
            if let Some(id) = self.version_to_id(version)? {
                *self.earliest.write() = Some((version, id));
            }
        }
        Ok(())
    }
}

impl PatchLogIndex for CoordIndex {
    fn log_lock(&self) -> &LogLock {
        &self.lock
    }

    fn current_version(&self) -> Version {
        self.head.read().version
    }

    fn current_id(&self) -> Option<Id> {
        self.head.read().id.clone()
    }

    fn previous_id(&self) -> Option<Id> {
        self.head.read().previous.clone()
    }

    fn earliest_version(&self) -> Version {
        self.earliest
            .read()
            .as_ref()
            .map(|(v, _)| *v)
            .unwrap_or(Version::INIT)
    }

    fn earliest_id(&self) -> Option<Id> {
        self.earliest.read().as_ref().map(|(_, id)| id.clone())
    }

    fn next_version(&self) -> Version {
        // Another server may have committed since we last looked; the lock
        // is held here, so the backing store is the truth.
        if let Err(e) = self.refresh() {
            warn!("refresh before next_version failed: {e}");
        }
        self.current_version().next()
    }

    fn save(&self, version: Version, id: &Id, previous: Option<&Id>) -> ServerResult<()> {
        {
            let head = self.head.read();
            if let SaveAction::Idempotent = classify_save(&head, version, id)? {
                return Ok(());
            }
        }

        let new_head = HeadState {
            version,
            id: Some(id.clone()),
            previous: previous.cloned(),
        };
        // The cache lock is not held across the write: the service may
        // deliver our own state watch synchronously, and its refresh takes
        // the same lock.
        put_json(self.coord.as_ref(), &self.state_path(), &new_head)?;
        {
            let mut head = self.head.write();
            if new_head.version > head.version {
                *head = new_head;
            }
        }

        if let Err(e) = self
            .coord
            .put(&self.version_path(version), id.to_string().into_bytes())
        {
            warn!(%version, "failed to write version node: {e}");
        }
        let entry = PatchEntry {
            id: id.clone(),
            previous: previous.cloned(),
            version,
        };
        if let Err(e) = put_json(self.coord.as_ref(), &self.header_path(id), &entry) {
            warn!(%id, "failed to write audit node: {e}");
        }

        let mut earliest = self.earliest.write();
        if earliest.is_none() {
            *earliest = Some((version, id.clone()));
        }
        Ok(())
    }

    fn version_to_id(&self, version: Version) -> ServerResult<Option<Id>> {
        if !version.is_valid() {
            return Ok(None);
        }
        match self.coord.get(&self.version_path(version))? {
            None => Ok(None),
            Some(bytes) => {
                let s = String::from_utf8(bytes).map_err(|_| {
                    ServerError::Coordination(format!("non-UTF-8 version node for {version}"))
                })?;
                Ok(Some(Id::parse(s.trim())))
            }
        }
    }

    fn patch_info(&self, id: &Id) -> ServerResult<Option<PatchEntry>> {
        get_json(self.coord.as_ref(), &self.header_path(id))
    }

    fn refresh(&self) -> ServerResult<()> {
        let fresh: Option<HeadState> = get_json(self.coord.as_ref(), &self.state_path())?;
        if let Some(fresh) = fresh {
            let mut head = self.head.write();
            if fresh.version > head.version {
                *head = fresh;
            }
        }
        Ok(())
    }
}

/// Patch storage as nodes under a log's `patches/` path.
pub struct CoordStorage {
    coord: Arc<dyn Coordination>,
    prefix: String,
}

impl CoordStorage {
    /// Creates storage under `prefix` (a log's path).
    pub fn new(coord: Arc<dyn Coordination>, prefix: &str) -> Self {
        Self {
            coord,
            prefix: join(prefix, NODE_PATCHES),
        }
    }

    fn patch_path(&self, id: &Id) -> String {
        join(&self.prefix, &id.to_string())
    }
}

impl PatchStorage for CoordStorage {
    fn store(&self, id: &Id, bytes: &[u8]) -> ServerResult<()> {
        self.coord.put(&self.patch_path(id), bytes.to_vec())
    }

    fn fetch(&self, id: &Id) -> ServerResult<Option<Vec<u8>>> {
        let found = self.coord.get(&self.patch_path(id))?;
        if let Some(bytes) = &found {
            if bytes.is_empty() {
                warn!(%id, "fetched zero-length patch node");
            }
        }
        Ok(found)
    }

    fn delete(&self, id: &Id) -> ServerResult<()> {
        self.coord.delete(&self.patch_path(id))
    }

    fn find(&self) -> ServerResult<Vec<Id>> {
        Ok(self
            .coord
            .children(&self.prefix)?
            .iter()
            .map(|name| Id::parse(name))
            .collect())
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
    use crate::coord::MemoryCoordination;

    fn service() -> Arc<dyn Coordination> {
        Arc::new(MemoryCoordination::new())
    }

    #[test]
    fn format_and_sequence() {
        let coord = service();
        let index = CoordIndex::format(Arc::clone(&coord), "/grp/logs/L").unwrap();
        assert_eq!(index.current_version(), Version::INIT);

        let a = Id::fresh();
        let b = Id::fresh();
        index.save(Version::FIRST, &a, None).unwrap();
        index.save(Version::new(2), &b, Some(&a)).unwrap();

        assert_eq!(index.current_version(), Version::new(2));
        assert_eq!(index.version_to_id(Version::FIRST).unwrap(), Some(a.clone()));
        assert_eq!(index.earliest_version(), Version::FIRST);
        let info = index.patch_info(&b).unwrap().unwrap();
        assert_eq!(info.previous, Some(a));
    }

    #[test]
    fn peer_commit_updates_watched_cache() {
        let coord = service();
        let ours = CoordIndex::format(Arc::clone(&coord), "/grp/logs/L").unwrap();
        let peer = CoordIndex::attach(Arc::clone(&coord), "/grp/logs/L").unwrap();

        let a = Id::fresh();
        peer.save(Version::FIRST, &a, None).unwrap();

        // The state watch fired and our cache adopted the newer head.
        assert_eq!(ours.current_version(), Version::FIRST);
        assert_eq!(ours.current_id(), Some(a));
    }

    #[test]
    fn next_version_sees_peer_commits_under_lock() {
        let coord = service();
        let ours = CoordIndex::format(Arc::clone(&coord), "/grp/logs/L").unwrap();
        let peer = CoordIndex::attach(Arc::clone(&coord), "/grp/logs/L").unwrap();

        peer.save(Version::FIRST, &Id::fresh(), None).unwrap();
        let _guard = ours.log_lock().acquire().unwrap();
        assert_eq!(ours.next_version(), Version::new(2));
    }

    #[test]
    fn attach_without_state_fails() {
        let coord = service();
        assert!(matches!(
            CoordIndex::attach(coord, "/grp/logs/missing"),
            Err(ServerError::Configuration(_))
        ));
    }

    #[test]
    fn coord_storage_round_trip() {
        let coord = service();
        let storage = CoordStorage::new(coord, "/grp/logs/L");
        let id = Id::fresh();
        storage.store(&id, b"bytes").unwrap();
        assert_eq!(storage.fetch(&id).unwrap().unwrap(), b"bytes");
        assert_eq!(storage.find().unwrap(), vec![id.clone()]);
        storage.release().unwrap();
        assert_eq!(storage.fetch(&id).unwrap(), None);
    }
}
