//! The interface to the backend wire protocol.
//!
//! The protocol implementation itself lives in the proxy's front-end
//! modules and is out of scope here; the monitor only needs the small
//! query surface below. `TcpConnector` is the minimal concrete
//! implementation: plain TCP liveness with no query support.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use thiserror::Error;
use tokio::io::Interest;
use tokio::net::TcpStream;

use sqlgate_registry::{BackendServer, Plaintext};

use crate::settings::ConnectionSettings;

/// Connection-phase failures.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The server rejected the monitor user's credentials.
    #[error("access denied for monitor user: {0}")]
    AccessDenied(String),

    /// The attempt exceeded the configured connect timeout.
    #[error("connection timed out after {0} ms")]
    Timeout(u64),

    #[error("{0}")]
    Refused(String),
}

impl ConnectError {
    pub fn is_access_denied(&self) -> bool {
        matches!(self, ConnectError::AccessDenied(_))
    }
}

/// Failures of queries on an established connection.
#[derive(Debug, Error)]
pub enum QueryError {
    /// Access to a specific table, column or routine was denied. Tolerated
    /// by the permissions check.
    #[error("access denied to database object: {0}")]
    ObjectAccessDenied(String),

    /// The server does not support the statement, e.g. the disk-space
    /// information table is missing.
    #[error("statement not supported by this server: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Failed(String),
}

/// The cluster role a backend reports for itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportedRole {
    Master,
    Slave,
    Synced,
    Unknown,
}

/// Replication topology facts reported by a backend.
#[derive(Debug, Clone, Copy)]
pub struct ServerFacts {
    /// The backend's own node id; -1 when the backend does not expose one.
    pub node_id: i64,
    /// Node id of the backend this one replicates from; -1 for none.
    pub master_id: i64,
    pub role: ReportedRole,
}

impl Default for ServerFacts {
    fn default() -> Self {
        ServerFacts {
            node_id: -1,
            master_id: -1,
            role: ReportedRole::Unknown,
        }
    }
}

/// One mounted filesystem as reported by the server-side information table.
#[derive(Debug, Clone)]
pub struct MountInfo {
    pub path: String,
    pub total: u64,
    pub available: u64,
}

/// An established monitor connection to one backend.
#[async_trait]
pub trait BackendConnection: Send + Sync {
    /// Cheap liveness check on the existing handle.
    async fn ping(&mut self) -> Result<(), ConnectError>;

    /// Replication topology facts.
    async fn query_facts(&mut self) -> Result<ServerFacts, QueryError>;

    /// Mounted filesystems with capacity information.
    async fn query_disk_space(&mut self) -> Result<Vec<MountInfo>, QueryError>;

    /// Run a module's permission probe statement, discarding any result.
    async fn probe_query(&mut self, statement: &str) -> Result<(), QueryError>;
}

/// Factory for monitor connections; implemented per backend protocol.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection as `user`. The caller bounds the attempt with the
    /// configured connect timeout; `settings` carries the read and write
    /// timeouts to apply to subsequent operations on the handle.
    async fn connect(
        &self,
        server: &BackendServer,
        settings: &ConnectionSettings,
        user: &str,
        password: &Plaintext,
    ) -> Result<Box<dyn BackendConnection>, ConnectError>;
}

/// Liveness-only connector: a successful TCP connect counts as running.
///
/// The query surface reports `Unsupported`, so role bits stay untouched and
/// the disk-space check disables itself per server.
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        server: &BackendServer,
        _settings: &ConnectionSettings,
        _user: &str,
        _password: &Plaintext,
    ) -> Result<Box<dyn BackendConnection>, ConnectError> {
        let addr = format!("{}:{}", server.address, server.port);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|err| ConnectError::Refused(format!("{}: {}", addr, err)))?;
        Ok(Box::new(TcpConnection { stream }))
    }
}

struct TcpConnection {
    stream: TcpStream,
}

#[async_trait]
impl BackendConnection for TcpConnection {
    async fn ping(&mut self) -> Result<(), ConnectError> {
        self.stream
            .ready(Interest::READABLE | Interest::WRITABLE)
            .await
            .map_err(|err| ConnectError::Refused(err.to_string()))?;

        // A read of zero bytes means the peer closed the connection;
        // WouldBlock means the socket is idle but alive.
        let mut buf = [0u8; 1];
        match self.stream.try_read(&mut buf) {
            Ok(0) => Err(ConnectError::Refused("connection closed by peer".into())),
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(ConnectError::Refused(err.to_string())),
        }
    }

    async fn query_facts(&mut self) -> Result<ServerFacts, QueryError> {
        Err(QueryError::Unsupported(
            "plain TCP probe cannot inspect replication state".into(),
        ))
    }

    async fn query_disk_space(&mut self) -> Result<Vec<MountInfo>, QueryError> {
        Err(QueryError::Unsupported(
            "plain TCP probe cannot read the disk information table".into(),
        ))
    }

    async fn probe_query(&mut self, _statement: &str) -> Result<(), QueryError> {
        // Connectivity is the whole check for the liveness-only protocol.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlgate_registry::ServerConfig;
    use tokio::net::TcpListener;

    fn server_at(port: u16) -> BackendServer {
        BackendServer::new(ServerConfig {
            name: "db1".to_string(),
            address: "127.0.0.1".to_string(),
            port,
            protocol: "tcp".to_string(),
            monitor_user: String::new(),
            monitor_password: String::new(),
            disk_space_limits: Default::default(),
        })
    }

    #[tokio::test]
    async fn test_tcp_connect_and_ping() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = server_at(port);

        let mut conn = TcpConnector
            .connect(
                &server,
                &ConnectionSettings::default(),
                "",
                &sqlgate_registry::Secret::default().expose(),
            )
            .await
            .unwrap();

        // Keep the accepted half alive while pinging.
        let (_accepted, _) = listener.accept().await.unwrap();
        conn.ping().await.unwrap();

        assert!(matches!(
            conn.query_disk_space().await,
            Err(QueryError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_tcp_connect_refused() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let server = server_at(port);
        let result = TcpConnector
            .connect(
                &server,
                &ConnectionSettings::default(),
                "",
                &sqlgate_registry::Secret::default().expose(),
            )
            .await;
        assert!(matches!(result, Err(ConnectError::Refused(_))));
    }
}
