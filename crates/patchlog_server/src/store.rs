//! The patch store: the set of live logs and the provider seam behind it.
//!
//! A [`PatchStoreProvider`] knows how to persist log membership and build
//! the index/storage pair for one log. [`PatchStore`] sits on top: it caches
//! open logs, serializes membership changes under the provider's store-wide
//! lock, and reconciles its cache against the provider's active set both on
//! demand (polling) and on change notification (watching).

use crate::config::ServerConfig;
use crate::coord::{delete_tree, get_json, join, put_json, Coordination, WatchCallback};
use crate::coord_index::{CoordIndex, CoordStorage};
use crate::error::{ServerError, ServerResult};
use crate::index::{FileIndex, MemoryIndex};
use crate::lock::{DistributedLock, ProcessLock};
use crate::log::PatchLog;
use crate::storage::{FileStorage, MemoryStorage};
use parking_lot::{Mutex, RwLock};
use patchlog_protocol::{validate_name, DataSourceDescription, Id, PatchLogInfo};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{info, warn};

/// Backing implementation for a store: membership persistence plus log
/// assembly.
pub trait PatchStoreProvider: Send + Sync {
    /// The store-wide lock serializing create and delete across servers.
    fn store_lock(&self) -> Arc<dyn DistributedLock>;

    /// Descriptions of all currently active logs.
    fn active_descriptions(&self) -> ServerResult<Vec<DataSourceDescription>>;

    /// Creates the persistent structures for a brand-new log.
    fn format_log(&self, source: &DataSourceDescription) -> ServerResult<PatchLog>;

    /// Opens an existing log.
    fn open_log(&self, source: &DataSourceDescription) -> ServerResult<PatchLog>;

    /// Marks `source` active, making it visible to other servers.
    fn publish(&self, source: &DataSourceDescription) -> ServerResult<()>;

    /// Removes `name` from the active set without touching its storage.
    fn retire(&self, name: &str) -> ServerResult<()>;

    /// Destroys the persistent structures of a retired log.
    fn remove_storage(&self, name: &str) -> ServerResult<()>;

    /// Registers a callback for changes to the active set. Providers with no
    /// notification mechanism ignore this; callers fall back to polling.
    fn watch_active(&self, _callback: WatchCallback) -> ServerResult<()> {
        Ok(())
    }

    /// Bytes a new client should load before applying patches, if the
    /// deployment ships any.
    fn initial_data(&self, _name: &str) -> ServerResult<Option<Vec<u8>>> {
        Ok(None)
    }
}

struct StoreLockGuard(Arc<dyn DistributedLock>);

impl StoreLockGuard {
    fn acquire(lock: Arc<dyn DistributedLock>) -> ServerResult<Self> {
        lock.acquire()?;
        Ok(Self(lock))
    }
}

impl Drop for StoreLockGuard {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// The set of live patch logs served by this process.
pub struct PatchStore {
    provider: Arc<dyn PatchStoreProvider>,
    config: ServerConfig,
    logs: RwLock<HashMap<String, Arc<PatchLog>>>,
    epoch: AtomicI64,
}

impl PatchStore {
    /// Opens the store: loads the provider's active logs and arms the
    /// active-set watch.
    pub fn open(
        provider: Arc<dyn PatchStoreProvider>,
        config: ServerConfig,
    ) -> ServerResult<Arc<Self>> {
        let store = Arc::new(Self {
            provider: Arc::clone(&provider),
            config,
            logs: RwLock::new(HashMap::new()),
            epoch: AtomicI64::new(0),
        });
        store.sync()?;

        let weak: Weak<Self> = Arc::downgrade(&store);
        provider.watch_active(Arc::new(move || {
            if let Some(store) = weak.upgrade() {
                if let Err(e) = store.sync() {
                    warn!("active-set watch sync failed: {e}");
                }
            }
        }))?;
        Ok(store)
    }

    /// Creates (or re-opens) the log `name` with external identity `uri`.
    ///
    /// Creating a name that already exists returns the existing description
    /// unchanged. The name is validated before anything is mutated.
    pub fn create_log(&self, name: &str, uri: &str) -> ServerResult<DataSourceDescription> {
        validate_name(name)?;
        if let Some(log) = self.logs.read().get(name) {
            return Ok(log.source().clone());
        }

        let _guard = StoreLockGuard::acquire(self.provider.store_lock())?;
        // Another server may have created it while we waited for the lock.
        if let Some(existing) = self
            .provider
            .active_descriptions()?
            .into_iter()
            .find(|d| d.name == name)
        {
            let log = Arc::new(self.provider.open_log(&existing)?);
            self.logs.write().insert(name.to_string(), log);
            return Ok(existing);
        }

        let source = DataSourceDescription {
            id: Id::fresh(),
            name: name.to_string(),
            uri: uri.to_string(),
        };
        let log = Arc::new(self.provider.format_log(&source)?);
        self.provider.publish(&source)?;
        self.logs.write().insert(name.to_string(), log);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        info!(log = name, uri, "created patch log");
        Ok(source)
    }

    /// Deletes the log `name`: retires it from the active set and, unless
    /// configured to retain, destroys its storage.
    pub fn delete_log(&self, name: &str) -> ServerResult<()> {
        let log = self
            .logs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ServerError::NotFound(format!("no such log: {name}")))?;

        let _guard = StoreLockGuard::acquire(self.provider.store_lock())?;
        self.provider.retire(name)?;
        self.logs.write().remove(name);
        self.epoch.fetch_add(1, Ordering::SeqCst);

        if self.config.retain_storage_on_delete {
            info!(log = name, "deleted patch log, storage retained");
        } else {
            log.release()?;
            self.provider.remove_storage(name)?;
            info!(log = name, "deleted patch log and storage");
        }
        Ok(())
    }

    /// The open log called `name`, if any.
    pub fn get_log(&self, name: &str) -> Option<Arc<PatchLog>> {
        self.logs.read().get(name).cloned()
    }

    /// The open log with data source id `id`, if any.
    pub fn find_by_id(&self, id: &Id) -> Option<Arc<PatchLog>> {
        self.logs
            .read()
            .values()
            .find(|log| &log.source().id == id)
            .cloned()
    }

    /// The open log with external identity `uri`, if any.
    pub fn find_by_uri(&self, uri: &str) -> Option<Arc<PatchLog>> {
        self.logs
            .read()
            .values()
            .find(|log| log.source().uri == uri)
            .cloned()
    }

    /// Descriptions of all open logs, sorted by name.
    pub fn descriptions(&self) -> Vec<DataSourceDescription> {
        let mut all: Vec<_> = self
            .logs
            .read()
            .values()
            .map(|log| log.source().clone())
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Log info snapshots for all open logs, sorted by name.
    pub fn log_infos(&self) -> Vec<PatchLogInfo> {
        let mut all: Vec<_> = self.logs.read().values().map(|log| log.info()).collect();
        all.sort_by(|a, b| a.source.name.cmp(&b.source.name));
        all
    }

    /// Initial data for `name`, if the provider ships any.
    pub fn initial_data(&self, name: &str) -> ServerResult<Option<Vec<u8>>> {
        self.provider.initial_data(name)
    }

    /// A counter that advances whenever this store's log set changes.
    pub fn epoch(&self) -> i64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Reconciles the cached log set against the provider's active set.
    ///
    /// Newly active logs are opened; logs no longer active are evicted.
    /// Shared by the watch callback and by callers that poll.
    pub fn sync(&self) -> ServerResult<()> {
        let active = self.provider.active_descriptions()?;
        let mut changed = false;

        for source in &active {
            if !self.logs.read().contains_key(&source.name) {
                match self.provider.open_log(source) {
                    Ok(log) => {
                        info!(log = %source.name, "discovered patch log");
                        self.logs.write().insert(source.name.clone(), Arc::new(log));
                        changed = true;
                    }
                    Err(e) => warn!(log = %source.name, "cannot open discovered log: {e}"),
                }
            }
        }

        let active_names: Vec<&str> = active.iter().map(|d| d.name.as_str()).collect();
        let stale: Vec<String> = self
            .logs
            .read()
            .keys()
            .filter(|name| !active_names.contains(&name.as_str()))
            .cloned()
            .collect();
        for name in stale {
            info!(log = %name, "patch log no longer active, evicting");
            self.logs.write().remove(&name);
            changed = true;
        }

        if changed {
            self.epoch.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// In-memory provider, for ephemeral servers and tests.
pub struct MemoryProvider {
    active: Mutex<HashMap<String, DataSourceDescription>>,
    parts: Mutex<HashMap<String, (Arc<MemoryIndex>, Arc<MemoryStorage>)>>,
    lock: Arc<ProcessLock>,
}

impl MemoryProvider {
    /// Creates an empty provider.
    pub fn new() -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            parts: Mutex::new(HashMap::new()),
            lock: Arc::new(ProcessLock::new("/mem/lock")),
        }
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl PatchStoreProvider for MemoryProvider {
    fn store_lock(&self) -> Arc<dyn DistributedLock> {
        Arc::clone(&self.lock) as Arc<dyn DistributedLock>
    }

    fn active_descriptions(&self) -> ServerResult<Vec<DataSourceDescription>> {
        Ok(self.active.lock().values().cloned().collect())
    }

    fn format_log(&self, source: &DataSourceDescription) -> ServerResult<PatchLog> {
        let index = Arc::new(MemoryIndex::new());
        let storage = Arc::new(MemoryStorage::new());
        self.parts.lock().insert(
            source.name.clone(),
            (Arc::clone(&index), Arc::clone(&storage)),
        );
        Ok(PatchLog::new(source.clone(), index, storage))
    }

    fn open_log(&self, source: &DataSourceDescription) -> ServerResult<PatchLog> {
        let parts = self.parts.lock();
        let (index, storage) = parts.get(&source.name).ok_or_else(|| {
            ServerError::Configuration(format!("no storage for log: {}", source.name))
        })?;
        Ok(PatchLog::new(
            source.clone(),
            Arc::clone(index) as _,
            Arc::clone(storage) as _,
        ))
    }

    fn publish(&self, source: &DataSourceDescription) -> ServerResult<()> {
        self.active
            .lock()
            .insert(source.name.clone(), source.clone());
        Ok(())
    }

    fn retire(&self, name: &str) -> ServerResult<()> {
        self.active.lock().remove(name);
        Ok(())
    }

    fn remove_storage(&self, name: &str) -> ServerResult<()> {
        self.parts.lock().remove(name);
        Ok(())
    }
}

const SOURCE_FILE: &str = "source.json";
const PATCHES_DIR: &str = "patches";
const INITIAL_DATA_FILE: &str = "initial.data";

/// Filesystem provider: one directory per log under a root directory.
///
/// Layout: `<root>/<name>/source.json` (the description; its presence marks
/// the log active), the index files alongside, and patch bodies under
/// `<root>/<name>/patches/`.
pub struct LocalProvider {
    root: PathBuf,
    lock: Arc<ProcessLock>,
}

impl LocalProvider {
    /// Opens (creating if needed) a provider rooted at `root`.
    pub fn open(root: &Path) -> ServerResult<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            lock: Arc::new(ProcessLock::new(root.to_string_lossy().into_owned())),
        })
    }

    fn log_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn assemble(&self, source: &DataSourceDescription, format: bool) -> ServerResult<PatchLog> {
        let dir = self.log_dir(&source.name);
        let index = if format {
            FileIndex::format(&dir)?
        } else {
            FileIndex::attach(&dir)?
        };
        let storage = FileStorage::open(&dir.join(PATCHES_DIR))?;
        Ok(PatchLog::new(
            source.clone(),
            Arc::new(index),
            Arc::new(storage),
        ))
    }
}

impl PatchStoreProvider for LocalProvider {
    fn store_lock(&self) -> Arc<dyn DistributedLock> {
        Arc::clone(&self.lock) as Arc<dyn DistributedLock>
    }

    fn active_descriptions(&self) -> ServerResult<Vec<DataSourceDescription>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let marker = entry.path().join(SOURCE_FILE);
            if !marker.is_file() {
                continue;
            }
            let bytes = fs::read(&marker)?;
            match serde_json::from_slice::<DataSourceDescription>(&bytes) {
                Ok(source) => found.push(source),
                Err(e) => warn!(path = %marker.display(), "unreadable log description: {e}"),
            }
        }
        Ok(found)
    }

    fn format_log(&self, source: &DataSourceDescription) -> ServerResult<PatchLog> {
        fs::create_dir_all(self.log_dir(&source.name))?;
        self.assemble(source, true)
    }

    fn open_log(&self, source: &DataSourceDescription) -> ServerResult<PatchLog> {
        self.assemble(source, false)
    }

    fn publish(&self, source: &DataSourceDescription) -> ServerResult<()> {
        let mut bytes = serde_json::to_vec_pretty(source)?;
        bytes.push(b'\n');
        fs::write(self.log_dir(&source.name).join(SOURCE_FILE), bytes)?;
        Ok(())
    }

    fn retire(&self, name: &str) -> ServerResult<()> {
        match fs::remove_file(self.log_dir(name).join(SOURCE_FILE)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ServerError::Io(e)),
        }
    }

    fn remove_storage(&self, name: &str) -> ServerResult<()> {
        match fs::remove_dir_all(self.log_dir(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ServerError::Io(e)),
        }
    }

    fn initial_data(&self, name: &str) -> ServerResult<Option<Vec<u8>>> {
        match fs::read(self.log_dir(name).join(INITIAL_DATA_FILE)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ServerError::Io(e)),
        }
    }
}

const NODE_ACTIVE: &str = "activeLogs";
const NODE_LOGS: &str = "logs";
const NODE_LOCK: &str = "lock";

/// Coordination-service provider: membership, index and patch bodies all
/// live in the shared namespace, so several servers see one store.
pub struct CoordProvider {
    coord: Arc<dyn Coordination>,
    root: String,
}

impl CoordProvider {
    /// Creates a provider rooted at `root` in the shared namespace.
    pub fn new(coord: Arc<dyn Coordination>, root: impl Into<String>) -> Self {
        Self {
            coord,
            root: root.into(),
        }
    }

    fn active_path(&self) -> String {
        join(&self.root, NODE_ACTIVE)
    }

    fn log_prefix(&self, name: &str) -> String {
        join(&join(&self.root, NODE_LOGS), name)
    }

    fn assemble(&self, source: &DataSourceDescription, format: bool) -> ServerResult<PatchLog> {
        let prefix = self.log_prefix(&source.name);
        let index = if format {
            CoordIndex::format(Arc::clone(&self.coord), &prefix)?
        } else {
            CoordIndex::attach(Arc::clone(&self.coord), &prefix)?
        };
        let storage = CoordStorage::new(Arc::clone(&self.coord), &prefix);
        Ok(PatchLog::new(source.clone(), index, Arc::new(storage)))
    }
}

impl PatchStoreProvider for CoordProvider {
    fn store_lock(&self) -> Arc<dyn DistributedLock> {
        self.coord.lock(&join(&self.root, NODE_LOCK))
    }

    fn active_descriptions(&self) -> ServerResult<Vec<DataSourceDescription>> {
        let mut found = Vec::new();
        for name in self.coord.children(&self.active_path())? {
            let path = join(&self.active_path(), &name);
            match get_json::<DataSourceDescription>(self.coord.as_ref(), &path)? {
                Some(source) => found.push(source),
                None => warn!(%name, "active entry vanished during listing"),
            }
        }
        Ok(found)
    }

    fn format_log(&self, source: &DataSourceDescription) -> ServerResult<PatchLog> {
        self.assemble(source, true)
    }

    fn open_log(&self, source: &DataSourceDescription) -> ServerResult<PatchLog> {
        self.assemble(source, false)
    }

    fn publish(&self, source: &DataSourceDescription) -> ServerResult<()> {
        put_json(
            self.coord.as_ref(),
            &join(&self.active_path(), &source.name),
            source,
        )
    }

    fn retire(&self, name: &str) -> ServerResult<()> {
        self.coord.delete(&join(&self.active_path(), name))
    }

    fn remove_storage(&self, name: &str) -> ServerResult<()> {
        delete_tree(self.coord.as_ref(), &self.log_prefix(name))
    }

    fn watch_active(&self, callback: WatchCallback) -> ServerResult<()> {
        self.coord.watch_children(&self.active_path(), callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::MemoryCoordination;
    use patchlog_protocol::{Patch, Version};
    use tempfile::tempdir;

    fn mem_store() -> Arc<PatchStore> {
        PatchStore::open(Arc::new(MemoryProvider::new()), ServerConfig::default()).unwrap()
    }

    #[test]
    fn create_append_delete() {
        let store = mem_store();
        let source = store.create_log("ds1", "http://example.org/ds1").unwrap();
        assert_eq!(source.name, "ds1");

        let log = store.get_log("ds1").unwrap();
        let version = log.append(&Patch::anonymous(b"p".to_vec())).unwrap();
        assert_eq!(version, Version::FIRST);

        store.delete_log("ds1").unwrap();
        assert!(store.get_log("ds1").is_none());
        assert!(matches!(
            store.delete_log("ds1"),
            Err(ServerError::NotFound(_))
        ));
    }

    #[test]
    fn create_is_idempotent_by_name() {
        let store = mem_store();
        let first = store.create_log("ds1", "http://example.org/ds1").unwrap();
        let again = store.create_log("ds1", "http://example.org/other").unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn bad_name_rejected_before_any_mutation() {
        let store = mem_store();
        assert!(store.create_log("bad name!", "http://example.org/x").is_err());
        assert!(store.descriptions().is_empty());
    }

    #[test]
    fn lookup_by_id_and_uri() {
        let store = mem_store();
        let source = store.create_log("ds1", "http://example.org/ds1").unwrap();

        assert!(store.find_by_id(&source.id).is_some());
        assert!(store.find_by_uri("http://example.org/ds1").is_some());
        assert!(store.find_by_id(&Id::fresh()).is_none());
        assert!(store.find_by_uri("http://example.org/nope").is_none());
    }

    #[test]
    fn epoch_advances_on_membership_change() {
        let store = mem_store();
        let e0 = store.epoch();
        store.create_log("ds1", "http://example.org/ds1").unwrap();
        let e1 = store.epoch();
        assert!(e1 > e0);
        store.delete_log("ds1").unwrap();
        assert!(store.epoch() > e1);
    }

    #[test]
    fn local_provider_survives_reopen() {
        let dir = tempdir().unwrap();
        let id;
        {
            let provider = Arc::new(LocalProvider::open(dir.path()).unwrap());
            let store = PatchStore::open(provider, ServerConfig::default()).unwrap();
            let source = store.create_log("ds1", "http://example.org/ds1").unwrap();
            id = source.id.clone();
            let log = store.get_log("ds1").unwrap();
            log.append(&Patch::anonymous(b"p1".to_vec())).unwrap();
            log.append(&Patch::anonymous(b"p2".to_vec())).unwrap();
        }

        let provider = Arc::new(LocalProvider::open(dir.path()).unwrap());
        let store = PatchStore::open(provider, ServerConfig::default()).unwrap();
        let log = store.get_log("ds1").unwrap();
        assert_eq!(log.source().id, id);
        assert_eq!(log.current_version(), Version::new(2));
        assert!(log.fetch_version(Version::FIRST).unwrap().is_some());
    }

    #[test]
    fn local_provider_retains_storage_when_configured() {
        let dir = tempdir().unwrap();
        let provider = Arc::new(LocalProvider::open(dir.path()).unwrap());
        let config = ServerConfig::new().with_retain_storage(true);
        let store = PatchStore::open(provider, config).unwrap();
        store.create_log("ds1", "http://example.org/ds1").unwrap();
        store.delete_log("ds1").unwrap();

        // Retired from the active set, but the directory remains.
        assert!(dir.path().join("ds1").join("state.json").is_file());
        assert!(!dir.path().join("ds1").join("source.json").exists());
    }

    #[test]
    fn local_provider_serves_initial_data() {
        let dir = tempdir().unwrap();
        let provider = Arc::new(LocalProvider::open(dir.path()).unwrap());
        let store = PatchStore::open(Arc::clone(&provider) as _, ServerConfig::default()).unwrap();
        store.create_log("ds1", "http://example.org/ds1").unwrap();
        assert_eq!(store.initial_data("ds1").unwrap(), None);

        fs::write(dir.path().join("ds1").join("initial.data"), b"seed").unwrap();
        assert_eq!(store.initial_data("ds1").unwrap().unwrap(), b"seed");
    }

    #[test]
    fn coord_stores_share_membership_via_watch() {
        let coord: Arc<dyn Coordination> = Arc::new(MemoryCoordination::new());
        let a = PatchStore::open(
            Arc::new(CoordProvider::new(Arc::clone(&coord), "/grp")),
            ServerConfig::default(),
        )
        .unwrap();
        let b = PatchStore::open(
            Arc::new(CoordProvider::new(Arc::clone(&coord), "/grp")),
            ServerConfig::default(),
        )
        .unwrap();

        a.create_log("shared", "http://example.org/shared").unwrap();
        // The activeLogs watch fired on the other store.
        let seen = b.get_log("shared").expect("peer store sees new log");

        let log_a = a.get_log("shared").unwrap();
        log_a.append(&Patch::anonymous(b"p".to_vec())).unwrap();
        assert_eq!(seen.current_version(), Version::FIRST);

        a.delete_log("shared").unwrap();
        assert!(b.get_log("shared").is_none());
    }

    #[test]
    fn poll_sync_reconciles_without_watch() {
        let store = mem_store();
        store.create_log("ds1", "http://example.org/ds1").unwrap();
        // A no-op sync leaves the set unchanged.
        let epoch = store.epoch();
        store.sync().unwrap();
        assert_eq!(store.epoch(), epoch);
        assert_eq!(store.descriptions().len(), 1);
    }
}
