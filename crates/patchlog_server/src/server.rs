//! The server proper: registration-gated operations over a [`PatchStore`],
//! plus an in-process [`Link`] for embedded use and tests.

use crate::error::{ServerError, ServerResult};
use crate::registration::Registrations;
use crate::store::PatchStore;
use parking_lot::RwLock;
use patchlog_protocol::{
    DataSourceDescription, Id, Link, LinkError, LinkResult, Patch, PatchLogInfo, RegToken, Version,
};
use std::sync::Arc;
use tracing::debug;

/// A patch log server: one [`PatchStore`] plus the registration registry.
///
/// Mutating operations take an explicit token and fail with
/// [`ServerError::NotRegistered`] when it is absent from the registry.
/// Read operations are open.
pub struct LocalServer {
    store: Arc<PatchStore>,
    registrations: Registrations,
}

impl LocalServer {
    /// Creates a server over `store`.
    pub fn new(store: Arc<PatchStore>) -> Self {
        Self {
            store,
            registrations: Registrations::new(),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<PatchStore> {
        &self.store
    }

    /// Registers `client`, issuing a token.
    pub fn register(&self, client: &Id) -> RegToken {
        self.registrations.register(client)
    }

    /// Invalidates `token`.
    pub fn deregister(&self, token: &RegToken) {
        self.registrations.deregister(token);
    }

    /// Returns true if `token` is live.
    pub fn is_registered(&self, token: &RegToken) -> bool {
        self.registrations.is_registered(token)
    }

    fn check_token(&self, token: &RegToken) -> ServerResult<Id> {
        self.registrations
            .client_of(token)
            .ok_or_else(|| ServerError::NotRegistered("unknown or expired token".to_string()))
    }

    fn log_of(&self, datasource: &Id) -> ServerResult<Arc<crate::log::PatchLog>> {
        self.store
            .find_by_id(datasource)
            .ok_or_else(|| ServerError::NotFound(format!("datasource {datasource}")))
    }

    /// Appends `patch` to the log of `datasource`.
    pub fn append(&self, token: &RegToken, datasource: &Id, patch: &Patch) -> ServerResult<Version> {
        let client = self.check_token(token)?;
        debug!(%client, %datasource, "append");
        self.log_of(datasource)?.append(patch)
    }

    /// The patch at `version` in the log of `datasource`.
    pub fn fetch_version(&self, datasource: &Id, version: Version) -> ServerResult<Option<Patch>> {
        self.log_of(datasource)?.fetch_version(version)
    }

    /// The patch with id `patch` in the log of `datasource`.
    pub fn fetch_id(&self, datasource: &Id, patch: &Id) -> ServerResult<Option<Patch>> {
        self.log_of(datasource)?.fetch_id(patch)
    }

    /// Creates a datasource and its empty log.
    pub fn create_datasource(
        &self,
        token: &RegToken,
        name: &str,
        uri: &str,
    ) -> ServerResult<DataSourceDescription> {
        let client = self.check_token(token)?;
        debug!(%client, name, "create datasource");
        self.store.create_log(name, uri)
    }

    /// Removes a datasource's log from the active set.
    pub fn remove_datasource(&self, token: &RegToken, datasource: &Id) -> ServerResult<()> {
        let client = self.check_token(token)?;
        let log = self.log_of(datasource)?;
        debug!(%client, %datasource, "remove datasource");
        self.store.delete_log(&log.source().name)
    }

    /// Description lookup by id.
    pub fn describe(&self, datasource: &Id) -> Option<DataSourceDescription> {
        self.store.find_by_id(datasource).map(|l| l.source().clone())
    }

    /// Description lookup by name.
    pub fn describe_by_name(&self, name: &str) -> Option<DataSourceDescription> {
        self.store.get_log(name).map(|l| l.source().clone())
    }

    /// Description lookup by URI.
    pub fn describe_by_uri(&self, uri: &str) -> Option<DataSourceDescription> {
        self.store.find_by_uri(uri).map(|l| l.source().clone())
    }

    /// All datasource descriptions.
    pub fn list_descriptions(&self) -> Vec<DataSourceDescription> {
        self.store.descriptions()
    }

    /// Log info snapshots for every datasource.
    pub fn list_log_infos(&self) -> Vec<PatchLogInfo> {
        self.store.log_infos()
    }

    /// The log info snapshot for one datasource.
    pub fn log_info(&self, datasource: &Id) -> Option<PatchLogInfo> {
        self.store.find_by_id(datasource).map(|l| l.info())
    }

    /// Current head version of a datasource; UNSET when unknown.
    pub fn current_version(&self, datasource: &Id) -> Version {
        self.store
            .find_by_id(datasource)
            .map(|l| l.current_version())
            .unwrap_or(Version::UNSET)
    }

    /// Bootstrap blob for a datasource, if any.
    pub fn initial_data(&self, datasource: &Id) -> ServerResult<Option<Vec<u8>>> {
        match self.store.find_by_id(datasource) {
            Some(log) => self.store.initial_data(&log.source().name),
            None => Ok(None),
        }
    }

    /// A counter advancing with every change to the set of logs.
    pub fn epoch(&self) -> i64 {
        self.store.epoch()
    }
}

/// An in-process [`Link`] talking straight to a [`LocalServer`].
///
/// Holds the client identity and current token; when the server reports an
/// expired token on a mutating call, it re-registers once and retries.
pub struct LocalLink {
    server: Arc<LocalServer>,
    client: RwLock<Option<Id>>,
    token: RwLock<Option<RegToken>>,
}

impl LocalLink {
    /// Creates an unregistered link to `server`.
    pub fn new(server: Arc<LocalServer>) -> Self {
        Self {
            server,
            client: RwLock::new(None),
            token: RwLock::new(None),
        }
    }

    fn with_reauth<T>(&self, call: impl Fn(&RegToken) -> ServerResult<T>) -> LinkResult<T> {
        let token = self
            .token
            .read()
            .clone()
            .ok_or_else(|| LinkError::NotRegistered("link is not registered".to_string()))?;
        match call(&token) {
            Err(ServerError::NotRegistered(_)) => {
                let client = self.client.read().clone().ok_or_else(|| {
                    LinkError::NotRegistered("no client identity to re-register".to_string())
                })?;
                debug!(%client, "token rejected, re-registering once");
                let fresh = self.server.register(&client);
                *self.token.write() = Some(fresh.clone());
                call(&fresh).map_err(LinkError::from)
            }
            other => other.map_err(LinkError::from),
        }
    }

    fn fetch_tolerant<T>(result: ServerResult<Option<T>>) -> LinkResult<Option<T>> {
        match result {
            Ok(found) => Ok(found),
            Err(ServerError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl Link for LocalLink {
    fn register(&self, client: Id) -> LinkResult<RegToken> {
        let token = self.server.register(&client);
        *self.client.write() = Some(client);
        *self.token.write() = Some(token.clone());
        Ok(token)
    }

    fn deregister(&self) -> LinkResult<()> {
        if let Some(token) = self.token.write().take() {
            self.server.deregister(&token);
        }
        Ok(())
    }

    fn is_registered(&self) -> LinkResult<bool> {
        Ok(self
            .token
            .read()
            .as_ref()
            .is_some_and(|t| self.server.is_registered(t)))
    }

    fn ping(&self) -> LinkResult<()> {
        Ok(())
    }

    fn append(&self, datasource: &Id, patch: &Patch) -> LinkResult<Version> {
        self.with_reauth(|token| self.server.append(token, datasource, patch))
    }

    fn fetch_version(&self, datasource: &Id, version: Version) -> LinkResult<Option<Patch>> {
        Self::fetch_tolerant(self.server.fetch_version(datasource, version))
    }

    fn fetch_id(&self, datasource: &Id, patch: &Id) -> LinkResult<Option<Patch>> {
        Self::fetch_tolerant(self.server.fetch_id(datasource, patch))
    }

    fn new_datasource(&self, name: &str, uri: &str) -> LinkResult<Id> {
        self.with_reauth(|token| self.server.create_datasource(token, name, uri))
            .map(|source| source.id)
    }

    fn remove_datasource(&self, datasource: &Id) -> LinkResult<()> {
        self.with_reauth(|token| self.server.remove_datasource(token, datasource))
    }

    fn describe(&self, datasource: &Id) -> LinkResult<Option<DataSourceDescription>> {
        Ok(self.server.describe(datasource))
    }

    fn describe_by_name(&self, name: &str) -> LinkResult<Option<DataSourceDescription>> {
        Ok(self.server.describe_by_name(name))
    }

    fn describe_by_uri(&self, uri: &str) -> LinkResult<Option<DataSourceDescription>> {
        Ok(self.server.describe_by_uri(uri))
    }

    fn list_descriptions(&self) -> LinkResult<Vec<DataSourceDescription>> {
        Ok(self.server.list_descriptions())
    }

    fn list_log_info(&self) -> LinkResult<Vec<PatchLogInfo>> {
        Ok(self.server.list_log_infos())
    }

    fn log_info(&self, datasource: &Id) -> LinkResult<Option<PatchLogInfo>> {
        Ok(self.server.log_info(datasource))
    }

    fn current_version(&self, datasource: &Id) -> LinkResult<Version> {
        Ok(self.server.current_version(datasource))
    }

    fn initial_data(&self, datasource: &Id) -> LinkResult<Option<Vec<u8>>> {
        self.server.initial_data(datasource).map_err(LinkError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::store::MemoryProvider;

    fn server() -> Arc<LocalServer> {
        let store = PatchStore::open(Arc::new(MemoryProvider::new()), ServerConfig::default())
            .unwrap();
        Arc::new(LocalServer::new(store))
    }

    #[test]
    fn mutating_calls_require_registration() {
        let server = server();
        let link = LocalLink::new(Arc::clone(&server));

        let err = link.new_datasource("ds1", "http://example.org/ds1").unwrap_err();
        assert!(matches!(err, LinkError::NotRegistered(_)));

        link.register(Id::fresh()).unwrap();
        assert!(link.is_registered().unwrap());
        link.new_datasource("ds1", "http://example.org/ds1").unwrap();
    }

    #[test]
    fn append_and_fetch_through_link() {
        let server = server();
        let link = LocalLink::new(Arc::clone(&server));
        link.register(Id::fresh()).unwrap();
        let ds = link.new_datasource("ds1", "http://example.org/ds1").unwrap();

        let patch = Patch::new(Id::fresh(), b"body".to_vec());
        let version = link.append(&ds, &patch).unwrap();
        assert_eq!(version, Version::FIRST);

        let fetched = link.fetch_version(&ds, version).unwrap().unwrap();
        assert_eq!(fetched.body(), b"body");
        assert_eq!(link.current_version(&ds).unwrap(), Version::FIRST);
    }

    #[test]
    fn fetch_on_unknown_datasource_is_none() {
        let server = server();
        let link = LocalLink::new(server);
        assert_eq!(
            link.fetch_version(&Id::fresh(), Version::FIRST).unwrap(),
            None
        );
        assert_eq!(link.current_version(&Id::fresh()).unwrap(), Version::UNSET);
    }

    #[test]
    fn expired_token_triggers_one_transparent_retry() {
        let server = server();
        let link = LocalLink::new(Arc::clone(&server));
        let admin = LocalLink::new(Arc::clone(&server));
        admin.register(Id::fresh()).unwrap();
        let ds = admin.new_datasource("ds1", "http://example.org/ds1").unwrap();

        let token = link.register(Id::fresh()).unwrap();
        // Expire the token server-side; the next mutating call re-registers.
        server.deregister(&token);
        let version = link.append(&ds, &Patch::anonymous(b"p".to_vec())).unwrap();
        assert_eq!(version, Version::FIRST);
        assert!(link.is_registered().unwrap());
    }

    #[test]
    fn deregistered_link_cannot_mutate() {
        let server = server();
        let link = LocalLink::new(server);
        link.register(Id::fresh()).unwrap();
        link.deregister().unwrap();
        assert!(!link.is_registered().unwrap());
        let err = link.new_datasource("ds1", "http://example.org/ds1").unwrap_err();
        assert!(matches!(err, LinkError::NotRegistered(_)));
    }

    #[test]
    fn remove_datasource_evicts_log() {
        let server = server();
        let link = LocalLink::new(Arc::clone(&server));
        link.register(Id::fresh()).unwrap();
        let ds = link.new_datasource("ds1", "http://example.org/ds1").unwrap();

        link.remove_datasource(&ds).unwrap();
        assert!(link.describe(&ds).unwrap().is_none());
        assert_eq!(link.log_info(&ds).unwrap(), None);
    }

    #[test]
    fn describe_by_each_key() {
        let server = server();
        let link = LocalLink::new(server);
        link.register(Id::fresh()).unwrap();
        let ds = link.new_datasource("ds1", "http://example.org/ds1").unwrap();

        assert_eq!(link.describe(&ds).unwrap().unwrap().name, "ds1");
        assert_eq!(link.describe_by_name("ds1").unwrap().unwrap().id, ds);
        assert_eq!(
            link.describe_by_uri("http://example.org/ds1").unwrap().unwrap().id,
            ds
        );
        assert!(link.describe_by_name("nope").unwrap().is_none());
    }
}
