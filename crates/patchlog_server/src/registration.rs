//! Client registration and token tracking.

use parking_lot::RwLock;
use patchlog_protocol::{Id, RegToken};
use std::collections::HashMap;
use tracing::{debug, info};

#[derive(Default)]
struct Tables {
    by_token: HashMap<RegToken, Id>,
    by_client: HashMap<String, RegToken>,
}

/// The set of registered clients.
///
/// One live token per client: re-registering replaces the previous token,
/// which stops validating immediately.
#[derive(Default)]
pub struct Registrations {
    tables: RwLock<Tables>,
}

impl Registrations {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `client`, issuing a fresh token. Any token previously held
    /// by the same client is invalidated.
    pub fn register(&self, client: &Id) -> RegToken {
        let token = RegToken::fresh();
        let mut tables = self.tables.write();
        if let Some(old) = tables.by_client.remove(&client.to_string()) {
            tables.by_token.remove(&old);
            debug!(%client, "replacing existing registration");
        }
        tables.by_token.insert(token.clone(), client.clone());
        tables.by_client.insert(client.to_string(), token.clone());
        info!(%client, "registered client");
        token
    }

    /// Removes the registration holding `token`. Unknown tokens are a no-op.
    pub fn deregister(&self, token: &RegToken) {
        let mut tables = self.tables.write();
        if let Some(client) = tables.by_token.remove(token) {
            tables.by_client.remove(&client.to_string());
            info!(%client, "deregistered client");
        }
    }

    /// The client holding `token`, if the token is live.
    pub fn client_of(&self, token: &RegToken) -> Option<Id> {
        self.tables.read().by_token.get(token).cloned()
    }

    /// Returns true if `token` is live.
    pub fn is_registered(&self, token: &RegToken) -> bool {
        self.tables.read().by_token.contains_key(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_validate() {
        let reg = Registrations::new();
        let client = Id::fresh();
        let token = reg.register(&client);

        assert!(reg.is_registered(&token));
        assert_eq!(reg.client_of(&token), Some(client));
    }

    #[test]
    fn reregistration_invalidates_old_token() {
        let reg = Registrations::new();
        let client = Id::fresh();
        let first = reg.register(&client);
        let second = reg.register(&client);

        assert!(!reg.is_registered(&first));
        assert!(reg.is_registered(&second));
    }

    #[test]
    fn deregister_is_terminal_and_idempotent() {
        let reg = Registrations::new();
        let token = reg.register(&Id::fresh());
        reg.deregister(&token);
        assert!(!reg.is_registered(&token));
        reg.deregister(&token);
    }

    #[test]
    fn unknown_token_is_not_registered() {
        let reg = Registrations::new();
        assert!(!reg.is_registered(&RegToken::fresh()));
        assert!(reg.client_of(&RegToken::fresh()).is_none());
    }
}
