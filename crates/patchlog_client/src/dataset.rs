//! The seam between the sync machinery and the local dataset engine.

use crate::error::ClientResult;
use parking_lot::Mutex;
use patchlog_protocol::Patch;

/// Applies fetched patches to the local dataset.
///
/// The log treats patch bodies as opaque bytes; the applier is where a
/// deployment interprets them. Appliers must be idempotent per patch id if
/// the caller may retry.
pub trait PatchApplier: Send + Sync {
    /// Applies one patch.
    fn apply(&self, patch: &Patch) -> ClientResult<()>;
}

/// An applier that keeps every applied patch in memory, in order.
///
/// Stands in for a real dataset engine in tests and small tools.
#[derive(Default)]
pub struct MemoryDataset {
    applied: Mutex<Vec<Patch>>,
}

impl MemoryDataset {
    /// Creates an empty dataset.
    pub fn new() -> Self {
        Self::default()
    }

    /// All patches applied so far, oldest first.
    pub fn applied(&self) -> Vec<Patch> {
        self.applied.lock().clone()
    }

    /// Number of patches applied.
    pub fn len(&self) -> usize {
        self.applied.lock().len()
    }

    /// Returns true if nothing has been applied.
    pub fn is_empty(&self) -> bool {
        self.applied.lock().is_empty()
    }
}

impl PatchApplier for MemoryDataset {
    fn apply(&self, patch: &Patch) -> ClientResult<()> {
        self.applied.lock().push(patch.clone());
        Ok(())
    }
}
