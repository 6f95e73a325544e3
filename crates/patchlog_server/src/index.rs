//! Per-log sequencing: the authoritative, crash-durable version index.

use crate::error::{ServerError, ServerResult};
use crate::lock::LogLock;
use parking_lot::RwLock;
use patchlog_protocol::{Id, Version};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, warn};

/// The durable head state of a log: latest version, its patch id, and the
/// id of the patch before it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadState {
    /// Latest committed version, INIT for an empty log.
    pub version: Version,
    /// Id of the patch at `version`, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
    /// Id of the patch at `version - 1`, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Id>,
}

impl HeadState {
    /// The state of a freshly created, empty log.
    pub fn init() -> Self {
        HeadState {
            version: Version::INIT,
            id: None,
            previous: None,
        }
    }
}

/// Audit record for one patch: its id, predecessor and version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchEntry {
    /// The patch id.
    pub id: Id,
    /// Id of the preceding patch, absent for version 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Id>,
    /// The version the patch was committed at.
    pub version: Version,
}

/// The sequencing authority for one log.
///
/// Reads are served from cached in-memory state, refreshed from the backing
/// store on construction and on change notification. `next_version` is a
/// pure calculation and must be called while holding [`Self::log_lock`];
/// `save` durably persists the new head before returning.
pub trait PatchLogIndex: Send + Sync {
    /// The lock serializing appends to this log.
    fn log_lock(&self) -> &LogLock;

    /// Latest committed version; INIT for an empty log.
    fn current_version(&self) -> Version;

    /// Id of the latest patch, if any.
    fn current_id(&self) -> Option<Id>;

    /// Id of the patch before the latest, if any.
    fn previous_id(&self) -> Option<Id>;

    /// Earliest fetchable version; INIT for an empty log.
    fn earliest_version(&self) -> Version;

    /// Id of the earliest patch, if any.
    fn earliest_id(&self) -> Option<Id>;

    /// The version the next accepted append will receive. Call under the
    /// log lock; does not mutate state.
    fn next_version(&self) -> Version {
        self.current_version().next()
    }

    /// Durably records the new head `(version, id, previous)` as one atomic
    /// write, then records the reverse index entry and audit record
    /// best-effort.
    ///
    /// Repeating a save of the same `(version, id)` is an idempotent no-op.
    /// The same version with a different id is an internal inconsistency:
    /// logged loudly, surfaced as an error, cached state left at
    /// last-known-good.
    fn save(&self, version: Version, id: &Id, previous: Option<&Id>) -> ServerResult<()>;

    /// Reverse lookup: the patch id committed at `version`.
    ///
    /// A version with no recorded entry (a crash between the state write
    /// and the index write) is `None`, not an error.
    fn version_to_id(&self, version: Version) -> ServerResult<Option<Id>>;

    /// The audit record for a patch id, if recorded.
    fn patch_info(&self, id: &Id) -> ServerResult<Option<PatchEntry>>;

    /// Re-reads cached state from the backing store. Never regresses the
    /// cached version: a stale snapshot is ignored.
    fn refresh(&self) -> ServerResult<()>;
}

/// What a `save` call should do, given the cached head.
pub(crate) enum SaveAction {
    Apply,
    Idempotent,
}

pub(crate) fn classify_save(head: &HeadState, version: Version, id: &Id) -> ServerResult<SaveAction> {
    if version == head.version {
        return if head.id.as_ref() == Some(id) {
            Ok(SaveAction::Idempotent)
        } else {
            error!(
                %version,
                new_id = %id,
                recorded_id = ?head.id,
                "duplicate save of a version with a different patch id"
            );
            Err(ServerError::Inconsistency(format!(
                "version {version} already recorded with a different patch id"
            )))
        };
    }
    if version != head.version.next() {
        error!(
            %version,
            current = %head.version,
            "save did not advance the version by one"
        );
        return Err(ServerError::Inconsistency(format!(
            "save of version {version} against current version {}",
            head.version
        )));
    }
    Ok(SaveAction::Apply)
}

/// In-memory index for ephemeral logs and tests.
pub struct MemoryIndex {
    head: RwLock<HeadState>,
    earliest: RwLock<Option<(Version, Id)>>,
    versions: RwLock<BTreeMap<i64, Id>>,
    entries: RwLock<HashMap<String, PatchEntry>>,
    lock: LogLock,
}

impl MemoryIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self {
            head: RwLock::new(HeadState::init()),
            earliest: RwLock::new(None),
            versions: RwLock::new(BTreeMap::new()),
            entries: RwLock::new(HashMap::new()),
            lock: LogLock::local_only(),
        }
    }
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl PatchLogIndex for MemoryIndex {
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

    fn save(&self, version: Version, id: &Id, previous: Option<&Id>) -> ServerResult<()> {
        let mut head = self.head.write();
        match classify_save(&head, version, id)? {
            SaveAction::Idempotent => return Ok(()),
            SaveAction::Apply => {}
        }
        *head = HeadState {
            version,
            id: Some(id.clone()),
            previous: previous.cloned(),
        };
        drop(head);

        self.versions.write().insert(version.value(), id.clone());
        self.entries.write().insert(
            id.to_string(),
            PatchEntry {
                id: id.clone(),
                previous: previous.cloned(),
                version,
            },
        );
        let mut earliest = self.earliest.write();
        if earliest.is_none() {
            *earliest = Some((version, id.clone()));
        }
        Ok(())
    }

    fn version_to_id(&self, version: Version) -> ServerResult<Option<Id>> {
        Ok(self.versions.read().get(&version.value()).cloned())
    }

    fn patch_info(&self, id: &Id) -> ServerResult<Option<PatchEntry>> {
        Ok(self.entries.read().get(&id.to_string()).cloned())
    }

    fn refresh(&self) -> ServerResult<()> {
        Ok(())
    }
}

const STATE_FILE: &str = "state.json";
const VERSIONS_DIR: &str = "versions";
const HEADERS_DIR: &str = "headers";

/// File-backed index: the head state lives in a small JSON file written
/// atomically (temp file then rename), with a `versions/` reverse index and
/// `headers/` audit records alongside.
///
/// The lock is process-local; appropriate for single-server deployment.
pub struct FileIndex {
    dir: PathBuf,
    head: RwLock<HeadState>,
    earliest: RwLock<Option<(Version, Id)>>,
    lock: LogLock,
}

impl FileIndex {
    /// Formats a new index at `dir`, writing the INIT state.
    pub fn format(dir: &Path) -> ServerResult<Self> {
        fs::create_dir_all(dir.join(VERSIONS_DIR))?;
        fs::create_dir_all(dir.join(HEADERS_DIR))?;
        let index = Self {
            dir: dir.to_path_buf(),
            head: RwLock::new(HeadState::init()),
            earliest: RwLock::new(None),
            lock: LogLock::local_only(),
        };
        index.write_state(&HeadState::init())?;
        Ok(index)
    }

    /// Attaches to an existing index at `dir`.
    pub fn attach(dir: &Path) -> ServerResult<Self> {
        let head = Self::read_state(dir)?;
        let index = Self {
            dir: dir.to_path_buf(),
            head: RwLock::new(head),
            earliest: RwLock::new(None),
            lock: LogLock::local_only(),
        };
        index.load_earliest()?;
        Ok(index)
    }

    fn read_state(dir: &Path) -> ServerResult<HeadState> {
        let path = dir.join(STATE_FILE);
        let bytes = fs::read(&path).map_err(|e| {
            ServerError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        if bytes.is_empty() {
            return Err(ServerError::Configuration(format!(
                "empty state file: {}",
                path.display()
            )));
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn write_state(&self, head: &HeadState) -> ServerResult<()> {
        let mut bytes = serde_json::to_vec(head)?;
        bytes.push(b'\n');
        let tmp = self.dir.join(".state.tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, self.dir.join(STATE_FILE))?;
        Ok(())
    }

    fn version_file(&self, version: Version) -> PathBuf {
        self.dir
            .join(VERSIONS_DIR)
            .join(format!("{:08}", version.value()))
    }

    fn header_file(&self, id: &Id) -> PathBuf {
        self.dir.join(HEADERS_DIR).join(format!("{id}.json"))
    }

    fn load_earliest(&self) -> ServerResult<()> {
        let mut min: Option<i64> = None;
        for entry in fs::read_dir(self.dir.join(VERSIONS_DIR))? {
            let entry = entry?;
            if let Ok(v) = entry.file_name().to_string_lossy().parse::<i64>() {
                min = Some(min.map_or(v, |m: i64| m.min(v)));
            }
        }
        if let Some(v) = min {
            let version = Version::new(v);
            if let Some(id) = self.version_to_id(version)? {
                *self.earliest.write() = Some((version, id));
            }
        }
        Ok(())
    }
}

impl PatchLogIndex for FileIndex {
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

    fn save(&self, version: Version, id: &Id, previous: Option<&Id>) -> ServerResult<()> {
        let mut head = self.head.write();
        match classify_save(&head, version, id)? {
            SaveAction::Idempotent => return Ok(()),
            SaveAction::Apply => {}
        }
        let new_head = HeadState {
            version,
            id: Some(id.clone()),
            previous: previous.cloned(),
        };
        // The state file is the commit point; everything after is
        // best-effort and tolerated as a gap on read.
        self.write_state(&new_head)?;
        *head = new_head;
        drop(head);

        if let Err(e) = fs::write(self.version_file(version), id.to_string()) {
            warn!(%version, "failed to write reverse index entry: {e}");
        }
        let entry = PatchEntry {
            id: id.clone(),
            previous: previous.cloned(),
            version,
        };
        match serde_json::to_vec(&entry) {
            Ok(bytes) => {
                if let Err(e) = fs::write(self.header_file(id), bytes) {
                    warn!(%id, "failed to write audit record: {e}");
                }
            }
            Err(e) => warn!(%id, "failed to encode audit record: {e}"),
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
        match fs::read_to_string(self.version_file(version)) {
            Ok(s) => Ok(Some(Id::parse(s.trim()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ServerError::Io(e)),
        }
    }

    fn patch_info(&self, id: &Id) -> ServerResult<Option<PatchEntry>> {
        match fs::read(self.header_file(id)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ServerError::Io(e)),
        }
    }

    fn refresh(&self) -> ServerResult<()> {
        let fresh = Self::read_state(&self.dir)?;
        let mut head = self.head.write();
        if fresh.version > head.version {
            *head = fresh;
        }
        Ok(())
    }
}
