//! The client-facing operation set, independent of transport.

use crate::error::LinkResult;
use crate::id::{Id, RegToken};
use crate::patch::Patch;
use crate::source::{DataSourceDescription, PatchLogInfo};
use crate::version::Version;

/// The operations a client uses to talk to a patch log server.
///
/// Implementations exist for in-process use (directly over the server's
/// registry), for HTTP, and as a failover wrapper over several links.
///
/// # Contracts
///
/// - Fetch-style calls return `Ok(None)` for not-found, never an error.
/// - Mutating calls require a registration; implementations re-register
///   transparently exactly once when the server reports an expired token.
/// - `append` returns the version the server assigned to the patch.
pub trait Link: Send + Sync {
    /// Registers `client` with the server, returning a fresh token.
    ///
    /// Repeated calls mint fresh tokens; the server replaces its mapping for
    /// the client rather than accumulating stale entries.
    fn register(&self, client: Id) -> LinkResult<RegToken>;

    /// Invalidates the current registration.
    fn deregister(&self) -> LinkResult<()>;

    /// Returns true if the link currently holds a token the server accepts.
    fn is_registered(&self) -> LinkResult<bool>;

    /// Liveness probe. No side effects.
    fn ping(&self) -> LinkResult<()>;

    /// Appends a patch to the given datasource's log.
    fn append(&self, datasource: &Id, patch: &Patch) -> LinkResult<Version>;

    /// Fetches the patch at `version`, or `None` if there is none.
    fn fetch_version(&self, datasource: &Id, version: Version) -> LinkResult<Option<Patch>>;

    /// Fetches the patch with id `patch`, or `None` if there is none.
    fn fetch_id(&self, datasource: &Id, patch: &Id) -> LinkResult<Option<Patch>>;

    /// Creates a new datasource (and its empty log), returning its id.
    fn new_datasource(&self, name: &str, uri: &str) -> LinkResult<Id>;

    /// Removes a datasource's log from the active set.
    fn remove_datasource(&self, datasource: &Id) -> LinkResult<()>;

    /// Looks up a datasource description by id.
    fn describe(&self, datasource: &Id) -> LinkResult<Option<DataSourceDescription>>;

    /// Looks up a datasource description by name.
    fn describe_by_name(&self, name: &str) -> LinkResult<Option<DataSourceDescription>>;

    /// Looks up a datasource description by URI.
    fn describe_by_uri(&self, uri: &str) -> LinkResult<Option<DataSourceDescription>>;

    /// Lists all datasource descriptions known to the server.
    fn list_descriptions(&self) -> LinkResult<Vec<DataSourceDescription>>;

    /// Lists log info snapshots for every datasource.
    fn list_log_info(&self) -> LinkResult<Vec<PatchLogInfo>>;

    /// Returns the log info snapshot for one datasource.
    fn log_info(&self, datasource: &Id) -> LinkResult<Option<PatchLogInfo>>;

    /// Cheap current-version probe, for polling without a full info fetch.
    ///
    /// Returns UNSET for an unknown datasource.
    fn current_version(&self, datasource: &Id) -> LinkResult<Version>;

    /// Fetches the bootstrap blob for a fresh client, if the log has one.
    fn initial_data(&self, datasource: &Id) -> LinkResult<Option<Vec<u8>>>;
}
