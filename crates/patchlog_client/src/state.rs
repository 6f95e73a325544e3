//! Persistent sync cursor: how far a local dataset has applied its log.

use crate::error::{ClientError, ClientResult};
use parking_lot::RwLock;
use patchlog_protocol::{Id, Version};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CursorFile {
    version: Version,
    datasource: Id,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    patch: Option<Id>,
}

/// The durable cursor for one dataset: the last applied version and patch.
///
/// Backed by a small JSON file written atomically (temp file then rename),
/// so a crash leaves either the old cursor or the new one, never a torn
/// file. The file is written before the in-memory value moves: if the
/// write fails, the cursor has not advanced.
pub struct DataState {
    path: PathBuf,
    datasource: Id,
    version: RwLock<Version>,
    patch: RwLock<Option<Id>>,
}

impl DataState {
    /// Creates a fresh cursor at `path` for `datasource`, starting at UNSET.
    pub fn create(path: &Path, datasource: Id) -> ClientResult<Self> {
        let state = Self {
            path: path.to_path_buf(),
            datasource,
            version: RwLock::new(Version::UNSET),
            patch: RwLock::new(None),
        };
        state.write_file(Version::UNSET, None)?;
        Ok(state)
    }

    /// Attaches to an existing cursor file.
    pub fn attach(path: &Path) -> ClientResult<Self> {
        let bytes = fs::read(path)
            .map_err(|e| ClientError::State(format!("cannot read {}: {e}", path.display())))?;
        let file: CursorFile = serde_json::from_slice(&bytes)
            .map_err(|e| ClientError::State(format!("bad cursor {}: {e}", path.display())))?;
        Ok(Self {
            path: path.to_path_buf(),
            datasource: file.datasource,
            version: RwLock::new(file.version),
            patch: RwLock::new(file.patch),
        })
    }

    /// The datasource this cursor tracks.
    pub fn datasource(&self) -> &Id {
        &self.datasource
    }

    /// The last applied version; UNSET if nothing has been applied.
    pub fn version(&self) -> Version {
        *self.version.read()
    }

    /// Id of the last applied patch, if any.
    pub fn latest_patch(&self) -> Option<Id> {
        self.patch.read().clone()
    }

    /// Advances the cursor to `(version, patch)`, persisting first.
    pub fn advance(&self, version: Version, patch: Option<&Id>) -> ClientResult<()> {
        self.write_file(version, patch)?;
        *self.version.write() = version;
        *self.patch.write() = patch.cloned();
        Ok(())
    }

    fn write_file(&self, version: Version, patch: Option<&Id>) -> ClientResult<()> {
        let file = CursorFile {
            version,
            datasource: self.datasource.clone(),
            patch: patch.cloned(),
        };
        let mut bytes = serde_json::to_vec(&file)?;
        bytes.push(b'\n');
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
