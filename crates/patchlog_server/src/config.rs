//! Server configuration.

/// Configuration for a patch log server instance.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Keep a removed log's underlying patch storage for audit instead of
    /// deleting it.
    pub retain_storage_on_delete: bool,
}

impl ServerConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            retain_storage_on_delete: false,
        }
    }

    /// Sets whether deleted logs keep their underlying storage.
    pub fn with_retain_storage(mut self, retain: bool) -> Self {
        self.retain_storage_on_delete = retain;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert!(!config.retain_storage_on_delete);
    }

    #[test]
    fn builder() {
        let config = ServerConfig::new().with_retain_storage(true);
        assert!(config.retain_storage_on_delete);
    }
}
