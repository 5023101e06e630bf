use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

use sqlgate_common::{Result, SqlGateError};

use crate::ownership::OwnershipTable;
use crate::server::{BackendServer, ServerConfig, ServerInfo};

/// Process-wide table of backend servers, keyed by unique name.
#[derive(Default)]
pub struct ServerRegistry {
    servers: DashMap<String, Arc<BackendServer>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        ServerRegistry::default()
    }

    /// Create and register a server. Fails if the name is taken.
    pub fn create(&self, config: ServerConfig) -> Result<Arc<BackendServer>> {
        let name = config.name.clone();
        match self.servers.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(SqlGateError::ServerExists(name)),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let server = Arc::new(BackendServer::new(config));
                entry.insert(server.clone());
                info!(
                    "Created server '{}' at {}",
                    server.name(),
                    server.address_string()
                );
                Ok(server)
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<BackendServer>> {
        self.servers.get(name).map(|entry| entry.clone())
    }

    /// Destroy a server. Refused while a monitor claims it.
    pub fn destroy(&self, name: &str, ownership: &OwnershipTable) -> Result<()> {
        if let Some(owner) = ownership.claimed_by(name) {
            return Err(SqlGateError::ServerClaimed {
                server: name.to_string(),
                owner,
            });
        }
        if self.servers.remove(name).is_none() {
            return Err(SqlGateError::ServerNotFound(name.to_string()));
        }
        info!("Destroyed server '{}'", name);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn infos(&self) -> Vec<ServerInfo> {
        self.servers.iter().map(|entry| entry.info()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str) -> ServerConfig {
        ServerConfig {
            name: name.to_string(),
            address: "127.0.0.1".to_string(),
            port: 3306,
            protocol: "mariadb".to_string(),
            monitor_user: String::new(),
            monitor_password: String::new(),
            disk_space_limits: Default::default(),
        }
    }

    #[test]
    fn test_create_and_get() {
        let registry = ServerRegistry::new();
        registry.create(config("db1")).unwrap();

        assert!(registry.get("db1").is_some());
        assert!(registry.get("db2").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let registry = ServerRegistry::new();
        registry.create(config("db1")).unwrap();
        assert!(matches!(
            registry.create(config("db1")),
            Err(SqlGateError::ServerExists(_))
        ));
    }

    #[test]
    fn test_destroy_refused_while_claimed() {
        let registry = ServerRegistry::new();
        let ownership = OwnershipTable::new();
        registry.create(config("db1")).unwrap();
        ownership.claim("db1", "cluster-a").unwrap();

        assert!(matches!(
            registry.destroy("db1", &ownership),
            Err(SqlGateError::ServerClaimed { .. })
        ));

        ownership.release("db1");
        registry.destroy("db1", &ownership).unwrap();
        assert!(registry.is_empty());
    }
}
