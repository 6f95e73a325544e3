//! A client's connection to one patch log: sync, append and transactions.

use crate::dataset::PatchApplier;
use crate::error::{ClientError, ClientResult};
use crate::state::DataState;
use patchlog_protocol::{Id, Link, Patch, Version};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What to do when a version inside the remote range has no fetchable
/// patch (a gap left by a crash between index writes on the server).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HolePolicy {
    /// Stop and report the missing version.
    #[default]
    Strict,
    /// Log the gap, advance the cursor past it and keep going.
    SkipAndWarn,
}

/// When a connection syncs with the server on its own, relative to
/// transaction boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Only when [`Connection::sync`] or [`Connection::try_sync`] is
    /// called explicitly.
    #[default]
    Manual,
    /// At the start of every transaction. Read transactions tolerate an
    /// unreachable server and run against local state; write transactions
    /// do not.
    OnTransaction,
    /// At the start of write transactions only.
    OnWrite,
}

/// Tunables for sync behavior.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncPolicy {
    /// When to sync without being asked.
    pub mode: SyncMode,
    /// Gap handling during catch-up.
    pub holes: HolePolicy,
}

/// A connection binding a [`Link`], a durable cursor and a local applier
/// into one syncable view of a remote patch log.
pub struct Connection {
    link: Arc<dyn Link>,
    state: DataState,
    applier: Arc<dyn PatchApplier>,
    policy: SyncPolicy,
}

impl Connection {
    /// Creates a connection with the default policy.
    pub fn new(link: Arc<dyn Link>, state: DataState, applier: Arc<dyn PatchApplier>) -> Self {
        Self {
            link,
            state,
            applier,
            policy: SyncPolicy::default(),
        }
    }

    /// Replaces the sync policy.
    pub fn with_policy(mut self, policy: SyncPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The datasource this connection tracks.
    pub fn datasource(&self) -> &Id {
        self.state.datasource()
    }

    /// The local cursor version.
    pub fn version(&self) -> Version {
        self.state.version()
    }

    /// Id of the last locally applied patch, if any.
    pub fn latest_patch(&self) -> Option<Id> {
        self.state.latest_patch()
    }

    /// The server's head version for this datasource.
    pub fn remote_version(&self) -> ClientResult<Version> {
        Ok(self.link.current_version(self.datasource())?)
    }

    /// Catches the local dataset up to the remote head, applying each
    /// missing patch in order and advancing the cursor per patch.
    ///
    /// Returns the local version after the run. Every failure, including
    /// an unreachable server, is an error.
    pub fn sync(&self) -> ClientResult<Version> {
        let remote = self.remote_version()?;
        self.catch_up(remote)
    }

    /// Like [`Connection::sync`], but an unreachable server is tolerated:
    /// the cursor stays put and the current local version is returned.
    pub fn try_sync(&self) -> ClientResult<Version> {
        match self.sync() {
            Ok(version) => Ok(version),
            Err(e) if e.is_connection_problem() => {
                warn!(datasource = %self.datasource(), "sync skipped, server unreachable: {e}");
                Ok(self.version())
            }
            Err(e) => Err(e),
        }
    }

    fn catch_up(&self, remote: Version) -> ClientResult<Version> {
        let local = self.version();
        if !remote.is_valid() || remote <= local {
            if local > remote && remote != Version::UNSET {
                warn!(
                    datasource = %self.datasource(),
                    %local,
                    %remote,
                    "local cursor is ahead of the server"
                );
            }
            return Ok(local);
        }

        let mut version = local.next();
        while version <= remote {
            match self.link.fetch_version(self.datasource(), version)? {
                Some(patch) => {
                    self.applier.apply(&patch)?;
                    self.state.advance(version, patch.id().as_ref())?;
                    debug!(datasource = %self.datasource(), %version, "applied patch");
                }
                None => match self.policy.holes {
                    HolePolicy::Strict => {
                        return Err(ClientError::MissingPatch { version });
                    }
                    HolePolicy::SkipAndWarn => {
                        warn!(
                            datasource = %self.datasource(),
                            %version,
                            "no patch at version, skipping"
                        );
                        self.state.advance(version, self.latest_patch().as_ref())?;
                    }
                },
            }
            version = version.next();
        }
        info!(datasource = %self.datasource(), version = %self.version(), "synced");
        Ok(self.version())
    }

    /// Appends a locally produced patch to the remote log.
    ///
    /// The `previous` header is filled from the cursor when absent. The
    /// cursor always moves to the version the server assigned, with the
    /// patch id recorded as latest; an assignment that is not the cursor's
    /// successor is warned about, and intervening patches are left for the
    /// next sync to apply.
    pub fn append(&self, patch: &Patch) -> ClientResult<Version> {
        let mut patch = patch.clone();
        if patch.previous().is_none() {
            if let Some(latest) = self.latest_patch() {
                patch.set_previous(&latest);
            }
        }
        let version = self.link.append(self.datasource(), &patch)?;

        let expected = self.version().next();
        if version != expected {
            warn!(
                datasource = %self.datasource(),
                assigned = %version,
                %expected,
                "append version is not the cursor's successor"
            );
        }
        self.state.advance(version, patch.id().as_ref())?;
        Ok(version)
    }

    /// Opens a transaction that collects writes into one patch.
    ///
    /// Under [`SyncMode::OnTransaction`] or [`SyncMode::OnWrite`] the
    /// connection first catches up with the server; a sync failure fails
    /// the begin.
    pub fn begin(&self) -> ClientResult<PatchTxn<'_>> {
        match self.policy.mode {
            SyncMode::OnTransaction | SyncMode::OnWrite => {
                self.sync()?;
            }
            SyncMode::Manual => {}
        }
        Ok(PatchTxn {
            connection: self,
            id: Id::fresh(),
            body: Vec::new(),
        })
    }

    /// Marks the start of a read transaction, returning the version local
    /// reads will run at.
    ///
    /// Under [`SyncMode::OnTransaction`] the connection first catches up
    /// with the server, tolerating an unreachable one; other modes leave
    /// the cursor where it is.
    pub fn begin_read(&self) -> ClientResult<Version> {
        match self.policy.mode {
            SyncMode::OnTransaction => self.try_sync(),
            SyncMode::OnWrite | SyncMode::Manual => Ok(self.version()),
        }
    }
}

/// A pending patch under construction.
///
/// Writes accumulate in memory; nothing reaches the server until
/// [`PatchTxn::commit`]. Dropping the transaction abandons it.
pub struct PatchTxn<'a> {
    connection: &'a Connection,
    id: Id,
    body: Vec<u8>,
}

impl PatchTxn<'_> {
    /// The id the committed patch will carry, fixed at begin.
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Adds bytes to the pending patch body.
    pub fn write(&mut self, bytes: &[u8]) {
        self.body.extend_from_slice(bytes);
    }

    /// Returns true if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Builds the patch, appends it and applies it locally.
    pub fn commit(self) -> ClientResult<Version> {
        let patch = Patch::new(self.id, self.body);
        let version = self.connection.append(&patch)?;
        self.connection.applier.apply(&patch)?;
        Ok(version)
    }

    /// Abandons the pending patch.
    pub fn abort(self) {
        debug!("patch transaction aborted");
    }
}
