//! Coordination service abstraction for multi-server deployments.
//!
//! A [`Coordination`] service offers a shared tree of named nodes with
//! watches and path-scoped locks, the narrow surface this server needs from
//! ZooKeeper or a comparable system. [`MemoryCoordination`] implements it
//! in-process: several server instances sharing one `Arc` behave like
//! several processes sharing one ensemble, which is how the multi-server
//! paths are exercised in tests.

use crate::error::{ServerError, ServerResult};
use crate::lock::{DistributedLock, ProcessLock};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Callback invoked when a watched node or child set changes.
pub type WatchCallback = Arc<dyn Fn() + Send + Sync>;

/// A shared tree of named byte nodes with watches and locks.
///
/// Paths are `/`-separated absolute names. Unlike ZooKeeper's one-shot
/// watches, watches here persist until the service is dropped; callers do
/// not re-arm them.
pub trait Coordination: Send + Sync {
    /// Creates or overwrites the node at `path`.
    fn put(&self, path: &str, data: Vec<u8>) -> ServerResult<()>;

    /// Reads the node at `path`, or `None` if absent.
    fn get(&self, path: &str) -> ServerResult<Option<Vec<u8>>>;

    /// Deletes the node at `path`. Absent nodes are a no-op.
    fn delete(&self, path: &str) -> ServerResult<()>;

    /// Returns true if the node exists.
    fn exists(&self, path: &str) -> ServerResult<bool>;

    /// Names of the direct children of `path`, sorted.
    fn children(&self, path: &str) -> ServerResult<Vec<String>>;

    /// Watches the node at `path`; `callback` fires after every put or
    /// delete of that node.
    fn watch(&self, path: &str, callback: WatchCallback) -> ServerResult<()>;

    /// Watches the child set of `path`; `callback` fires after a direct
    /// child is created or deleted.
    fn watch_children(&self, path: &str, callback: WatchCallback) -> ServerResult<()>;

    /// Returns the cross-process lock scoped to `path`. Repeated calls with
    /// the same path yield the same underlying lock.
    fn lock(&self, path: &str) -> Arc<dyn DistributedLock>;
}

/// Joins two path segments.
pub fn join(base: &str, name: &str) -> String {
    if base.ends_with('/') {
        format!("{base}{name}")
    } else {
        format!("{base}/{name}")
    }
}

#[derive(Default)]
struct Watches {
    nodes: HashMap<String, Vec<WatchCallback>>,
    children: HashMap<String, Vec<WatchCallback>>,
}

/// In-process [`Coordination`] implementation.
#[derive(Default)]
pub struct MemoryCoordination {
    nodes: Mutex<BTreeMap<String, Vec<u8>>>,
    watches: Mutex<Watches>,
    locks: Mutex<HashMap<String, Arc<ProcessLock>>>,
}

impl MemoryCoordination {
    /// Creates an empty service.
    pub fn new() -> Self {
        Self::default()
    }

    fn parent_of(path: &str) -> Option<&str> {
        path.rfind('/').map(|i| &path[..i.max(1)])
    }

    fn fire(&self, path: &str) {
        // Snapshot the callbacks so they run without the watch lock held;
        // a callback may itself read or write nodes.
        let (node_cbs, child_cbs) = {
            let watches = self.watches.lock();
            let node_cbs: Vec<_> = watches.nodes.get(path).cloned().unwrap_or_default();
            let child_cbs: Vec<_> = Self::parent_of(path)
                .and_then(|p| watches.children.get(p).cloned())
                .unwrap_or_default();
            (node_cbs, child_cbs)
        };
        for cb in node_cbs.iter().chain(child_cbs.iter()) {
            cb();
        }
    }
}

impl Coordination for MemoryCoordination {
    fn put(&self, path: &str, data: Vec<u8>) -> ServerResult<()> {
        self.nodes.lock().insert(path.to_string(), data);
        self.fire(path);
        Ok(())
    }

    fn get(&self, path: &str) -> ServerResult<Option<Vec<u8>>> {
        Ok(self.nodes.lock().get(path).cloned())
    }

    fn delete(&self, path: &str) -> ServerResult<()> {
        let removed = self.nodes.lock().remove(path).is_some();
        if removed {
            self.fire(path);
        }
        Ok(())
    }

    fn exists(&self, path: &str) -> ServerResult<bool> {
        Ok(self.nodes.lock().contains_key(path))
    }

    fn children(&self, path: &str) -> ServerResult<Vec<String>> {
        let prefix = if path.ends_with('/') {
            path.to_string()
        } else {
            format!("{path}/")
        };
        let nodes = self.nodes.lock();
        let mut names: Vec<String> = nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                // Intermediate segments count as children even when no node
                // exists at the intermediate path itself.
                let rest = &k[prefix.len()..];
                rest.split('/').next().filter(|s| !s.is_empty()).map(String::from)
            })
            .collect();
        names.dedup();
        Ok(names)
    }

    fn watch(&self, path: &str, callback: WatchCallback) -> ServerResult<()> {
        self.watches
            .lock()
            .nodes
            .entry(path.to_string())
            .or_default()
            .push(callback);
        Ok(())
    }

    fn watch_children(&self, path: &str, callback: WatchCallback) -> ServerResult<()> {
        self.watches
            .lock()
            .children
            .entry(path.to_string())
            .or_default()
            .push(callback);
        Ok(())
    }

    fn lock(&self, path: &str) -> Arc<dyn DistributedLock> {
        let mut locks = self.locks.lock();
        let lock = locks
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(ProcessLock::new(path)));
        Arc::clone(lock) as Arc<dyn DistributedLock>
    }
}

/// Deletes `path` and every node below it.
pub fn delete_tree(coord: &dyn Coordination, path: &str) -> ServerResult<()> {
    for child in coord.children(path)? {
        delete_tree(coord, &join(path, &child))?;
    }
    coord.delete(path)
}

/// Reads and JSON-decodes a node.
pub fn get_json<T: serde::de::DeserializeOwned>(
    coord: &dyn Coordination,
    path: &str,
) -> ServerResult<Option<T>> {
    match coord.get(path)? {
        None => Ok(None),
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| ServerError::Coordination(format!("bad node {path}: {e}"))),
    }
}

/// JSON-encodes and writes a node.
pub fn put_json<T: serde::Serialize>(
    coord: &dyn Coordination,
    path: &str,
    value: &T,
) -> ServerResult<()> {
    let bytes = serde_json::to_vec(value)?;
    coord.put(path, bytes)
}
