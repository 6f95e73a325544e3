//! Failover across several links to replicas of the same log set.

use patchlog_protocol::{
    DataSourceDescription, Id, Link, LinkError, LinkResult, Patch, PatchLogInfo, RegToken, Version,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// A [`Link`] over several underlying links, switching between them on
/// connection problems.
///
/// Application errors (bad request, not registered, server error) are
/// returned as-is: the server answered, so another replica would say the
/// same thing. Only transport failures trigger a switch. Each candidate is
/// probed with a ping before the operation is retried on it; after a full
/// cycle of unreachable links the last connection error is returned.
pub struct SwitchableLink {
    links: Vec<Arc<dyn Link>>,
    current: AtomicUsize,
}

impl SwitchableLink {
    /// Creates a failover link over `links`, starting on the first.
    pub fn new(links: Vec<Arc<dyn Link>>) -> Self {
        Self {
            links,
            current: AtomicUsize::new(0),
        }
    }

    /// Index of the link currently in use.
    pub fn current_index(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    fn with_failover<T>(&self, call: impl Fn(&dyn Link) -> LinkResult<T>) -> LinkResult<T> {
        if self.links.is_empty() {
            return Err(LinkError::Configuration("no links configured".to_string()));
        }
        let start = self.current.load(Ordering::SeqCst);
        let count = self.links.len();
        let mut last = None;

        for offset in 0..count {
            let index = (start + offset) % count;
            let link = &self.links[index];
            if offset > 0 {
                if let Err(e) = link.ping() {
                    warn!(index, "candidate link unreachable: {e}");
                    last = Some(e);
                    continue;
                }
                info!(from = start, to = index, "switching to standby link");
            }
            match call(link.as_ref()) {
                Err(e) if e.is_connection_problem() => {
                    warn!(index, "link failed with a connection problem: {e}");
                    last = Some(e);
                }
                other => {
                    self.current.store(index, Ordering::SeqCst);
                    return other;
                }
            }
        }
        Err(last.unwrap_or_else(|| LinkError::Configuration("no links configured".to_string())))
    }
}

impl Link for SwitchableLink {
    fn register(&self, client: Id) -> LinkResult<RegToken> {
        self.with_failover(|link| link.register(client.clone()))
    }

    fn deregister(&self) -> LinkResult<()> {
        self.with_failover(|link| link.deregister())
    }

    fn is_registered(&self) -> LinkResult<bool> {
        self.with_failover(|link| link.is_registered())
    }

    fn ping(&self) -> LinkResult<()> {
        self.with_failover(|link| link.ping())
    }

    fn append(&self, datasource: &Id, patch: &Patch) -> LinkResult<Version> {
        self.with_failover(|link| link.append(datasource, patch))
    }

    fn fetch_version(&self, datasource: &Id, version: Version) -> LinkResult<Option<Patch>> {
        self.with_failover(|link| link.fetch_version(datasource, version))
    }

    fn fetch_id(&self, datasource: &Id, patch: &Id) -> LinkResult<Option<Patch>> {
        self.with_failover(|link| link.fetch_id(datasource, patch))
    }

    fn new_datasource(&self, name: &str, uri: &str) -> LinkResult<Id> {
        self.with_failover(|link| link.new_datasource(name, uri))
    }

    fn remove_datasource(&self, datasource: &Id) -> LinkResult<()> {
        self.with_failover(|link| link.remove_datasource(datasource))
    }

    fn describe(&self, datasource: &Id) -> LinkResult<Option<DataSourceDescription>> {
        self.with_failover(|link| link.describe(datasource))
    }

    fn describe_by_name(&self, name: &str) -> LinkResult<Option<DataSourceDescription>> {
        self.with_failover(|link| link.describe_by_name(name))
    }

    fn describe_by_uri(&self, uri: &str) -> LinkResult<Option<DataSourceDescription>> {
        self.with_failover(|link| link.describe_by_uri(uri))
    }

    fn list_descriptions(&self) -> LinkResult<Vec<DataSourceDescription>> {
        self.with_failover(|link| link.list_descriptions())
    }

    fn list_log_info(&self) -> LinkResult<Vec<PatchLogInfo>> {
        self.with_failover(|link| link.list_log_info())
    }

    fn log_info(&self, datasource: &Id) -> LinkResult<Option<PatchLogInfo>> {
        self.with_failover(|link| link.log_info(datasource))
    }

    fn current_version(&self, datasource: &Id) -> LinkResult<Version> {
        self.with_failover(|link| link.current_version(datasource))
    }

    fn initial_data(&self, datasource: &Id) -> LinkResult<Option<Vec<u8>>> {
        self.with_failover(|link| link.initial_data(datasource))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// A link scripted to be up or down, counting pings.
    struct Scripted {
        up: Mutex<bool>,
        pings: Mutex<usize>,
        version: Version,
    }

    impl Scripted {
        fn up(version: i64) -> Arc<Self> {
            Arc::new(Self {
                up: Mutex::new(true),
                pings: Mutex::new(0),
                version: Version::new(version),
            })
        }

        fn down(version: i64) -> Arc<Self> {
            Arc::new(Self {
                up: Mutex::new(false),
                pings: Mutex::new(0),
                version: Version::new(version),
            })
        }

        fn check(&self) -> LinkResult<()> {
            if *self.up.lock() {
                Ok(())
            } else {
                Err(LinkError::Connection("down".to_string()))
            }
        }
    }

    impl Link for Scripted {
        fn register(&self, _client: Id) -> LinkResult<RegToken> {
            self.check()?;
            Ok(RegToken::fresh())
        }
        fn deregister(&self) -> LinkResult<()> {
            self.check()
        }
        fn is_registered(&self) -> LinkResult<bool> {
            self.check()?;
            Ok(true)
        }
        fn ping(&self) -> LinkResult<()> {
            *self.pings.lock() += 1;
            self.check()
        }
        fn append(&self, _d: &Id, _p: &Patch) -> LinkResult<Version> {
            self.check()?;
            Ok(self.version)
        }
        fn fetch_version(&self, _d: &Id, _v: Version) -> LinkResult<Option<Patch>> {
            self.check()?;
            Ok(None)
        }
        fn fetch_id(&self, _d: &Id, _p: &Id) -> LinkResult<Option<Patch>> {
            self.check()?;
            Ok(None)
        }
        fn new_datasource(&self, _n: &str, _u: &str) -> LinkResult<Id> {
            self.check()?;
            Ok(Id::fresh())
        }
        fn remove_datasource(&self, _d: &Id) -> LinkResult<()> {
            self.check()
        }
        fn describe(&self, _d: &Id) -> LinkResult<Option<DataSourceDescription>> {
            self.check()?;
            Ok(None)
        }
        fn describe_by_name(&self, _n: &str) -> LinkResult<Option<DataSourceDescription>> {
            self.check()?;
            Ok(None)
        }
        fn describe_by_uri(&self, _u: &str) -> LinkResult<Option<DataSourceDescription>> {
            self.check()?;
            Ok(None)
        }
        fn list_descriptions(&self) -> LinkResult<Vec<DataSourceDescription>> {
            self.check()?;
            Ok(Vec::new())
        }
        fn list_log_info(&self) -> LinkResult<Vec<PatchLogInfo>> {
            self.check()?;
            Ok(Vec::new())
        }
        fn log_info(&self, _d: &Id) -> LinkResult<Option<PatchLogInfo>> {
            self.check()?;
            Ok(None)
        }
        fn current_version(&self, _d: &Id) -> LinkResult<Version> {
            self.check()?;
            Ok(self.version)
        }
        fn initial_data(&self, _d: &Id) -> LinkResult<Option<Vec<u8>>> {
            self.check()?;
            Ok(None)
        }
    }

    #[test]
    fn stays_on_healthy_link() {
        let a = Scripted::up(1);
        let b = Scripted::up(2);
        let link = SwitchableLink::new(vec![a.clone() as Arc<dyn Link>, b.clone() as Arc<dyn Link>]);

        assert_eq!(
            link.current_version(&Id::fresh()).unwrap(),
            Version::new(1)
        );
        assert_eq!(link.current_index(), 0);
        assert_eq!(*b.pings.lock(), 0);
    }

    #[test]
    fn switches_on_connection_problem() {
        let a = Scripted::down(1);
        let b = Scripted::up(2);
        let link = SwitchableLink::new(vec![a as Arc<dyn Link>, b.clone() as Arc<dyn Link>]);

        assert_eq!(
            link.current_version(&Id::fresh()).unwrap(),
            Version::new(2)
        );
        assert_eq!(link.current_index(), 1);
        // The standby was probed before use.
        assert_eq!(*b.pings.lock(), 1);
    }

    #[test]
    fn sticks_after_switching() {
        let a = Scripted::down(1);
        let b = Scripted::up(2);
        let link = SwitchableLink::new(vec![a.clone() as Arc<dyn Link>, b.clone() as Arc<dyn Link>]);

        link.current_version(&Id::fresh()).unwrap();
        link.current_version(&Id::fresh()).unwrap();
        assert_eq!(link.current_index(), 1);
        // No extra probe on the second call.
        assert_eq!(*b.pings.lock(), 1);
    }

    #[test]
    fn recovers_when_original_comes_back() {
        let a = Scripted::down(1);
        let b = Scripted::down(2);
        let link = SwitchableLink::new(vec![a.clone() as Arc<dyn Link>, b as Arc<dyn Link>]);

        assert!(link
            .current_version(&Id::fresh())
            .unwrap_err()
            .is_connection_problem());

        *a.up.lock() = true;
        assert_eq!(
            link.current_version(&Id::fresh()).unwrap(),
            Version::new(1)
        );
    }

    #[test]
    fn application_errors_do_not_switch() {
        struct Rejecting;
        impl Link for Rejecting {
            fn register(&self, _c: Id) -> LinkResult<RegToken> {
                Err(LinkError::BadRequest("no".to_string()))
            }
            fn deregister(&self) -> LinkResult<()> {
                unreachable!()
            }
            fn is_registered(&self) -> LinkResult<bool> {
                unreachable!()
            }
            fn ping(&self) -> LinkResult<()> {
                Ok(())
            }
            fn append(&self, _d: &Id, _p: &Patch) -> LinkResult<Version> {
                Err(LinkError::BadRequest("no".to_string()))
            }
            fn fetch_version(&self, _d: &Id, _v: Version) -> LinkResult<Option<Patch>> {
                unreachable!()
            }
            fn fetch_id(&self, _d: &Id, _p: &Id) -> LinkResult<Option<Patch>> {
                unreachable!()
            }
            fn new_datasource(&self, _n: &str, _u: &str) -> LinkResult<Id> {
                unreachable!()
            }
            fn remove_datasource(&self, _d: &Id) -> LinkResult<()> {
                unreachable!()
            }
            fn describe(&self, _d: &Id) -> LinkResult<Option<DataSourceDescription>> {
                unreachable!()
            }
            fn describe_by_name(&self, _n: &str) -> LinkResult<Option<DataSourceDescription>> {
                unreachable!()
            }
            fn describe_by_uri(&self, _u: &str) -> LinkResult<Option<DataSourceDescription>> {
                unreachable!()
            }
            fn list_descriptions(&self) -> LinkResult<Vec<DataSourceDescription>> {
                unreachable!()
            }
            fn list_log_info(&self) -> LinkResult<Vec<PatchLogInfo>> {
                unreachable!()
            }
            fn log_info(&self, _d: &Id) -> LinkResult<Option<PatchLogInfo>> {
                unreachable!()
            }
            fn current_version(&self, _d: &Id) -> LinkResult<Version> {
                unreachable!()
            }
            fn initial_data(&self, _d: &Id) -> LinkResult<Option<Vec<u8>>> {
                unreachable!()
            }
        }

        let standby = Scripted::up(2);
        let link = SwitchableLink::new(vec![Arc::new(Rejecting) as Arc<dyn Link>, standby.clone() as Arc<dyn Link>]);
        let err = link
            .append(&Id::fresh(), &Patch::anonymous(b"p".to_vec()))
            .unwrap_err();
        assert!(matches!(err, LinkError::BadRequest(_)));
        assert_eq!(link.current_index(), 0);
        assert_eq!(*standby.pings.lock(), 0);
    }
}
