//! Retrying ping/connect primitive for monitor connections.

use std::time::Instant;
use tokio::time::timeout;

use sqlgate_registry::{BackendServer, Secret};

use crate::backend::{BackendConnection, ConnectError, Connector};
use crate::settings::ConnectionSettings;

/// How a probe concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The existing handle answered a ping; no reconnect happened.
    ExistingOk,
    /// A new connection was established.
    NewConnOk,
    /// The last attempt's wall time reached the connect timeout.
    Timeout,
    /// Any other connection failure.
    Refused,
}

#[derive(Debug)]
pub struct ProbeResult {
    pub outcome: ProbeOutcome,
    /// The last connection error, when the outcome is a failure.
    pub error: Option<ConnectError>,
}

impl ProbeResult {
    pub fn is_ok(&self) -> bool {
        matches!(
            self.outcome,
            ProbeOutcome::ExistingOk | ProbeOutcome::NewConnOk
        )
    }
}

/// Probe one server. If `existing` answers a ping it is returned untouched;
/// otherwise it is dropped and up to `connect_attempts` connects are made,
/// each bounded by the connect timeout. Credentials follow the per-server
/// override, falling back to the cluster monitor user; the password is
/// decrypted per attempt into a buffer zeroed on drop.
pub async fn probe(
    connector: &dyn Connector,
    server: &BackendServer,
    settings: &ConnectionSettings,
    existing: Option<Box<dyn BackendConnection>>,
) -> (Option<Box<dyn BackendConnection>>, ProbeResult) {
    if let Some(mut conn) = existing {
        if conn.ping().await.is_ok() {
            return (
                Some(conn),
                ProbeResult {
                    outcome: ProbeOutcome::ExistingOk,
                    error: None,
                },
            );
        }
        // The handle is dead; fall through to a full reconnect.
    }

    let (user, secret): (&str, Secret) = if !server.monitor_user().is_empty() {
        (server.monitor_user(), server.monitor_password().clone())
    } else {
        (
            settings.username.as_str(),
            Secret::new(settings.password.clone()),
        )
    };

    let connect_timeout = settings.connect_timeout();
    let mut last_error: Option<ConnectError> = None;
    let mut last_timed_out = false;

    for _ in 0..settings.connect_attempts.max(1) {
        let password = secret.expose();
        let started = Instant::now();
        match timeout(
            connect_timeout,
            connector.connect(server, settings, user, &password),
        )
        .await
        {
            Ok(Ok(conn)) => {
                return (
                    Some(conn),
                    ProbeResult {
                        outcome: ProbeOutcome::NewConnOk,
                        error: None,
                    },
                );
            }
            Ok(Err(err)) => {
                last_timed_out = started.elapsed() >= connect_timeout;
                last_error = Some(err);
            }
            Err(_) => {
                last_timed_out = true;
                last_error = Some(ConnectError::Timeout(settings.connect_timeout_ms));
            }
        }
    }

    let outcome = if last_timed_out {
        ProbeOutcome::Timeout
    } else {
        ProbeOutcome::Refused
    };
    (
        None,
        ProbeResult {
            outcome,
            error: last_error,
        },
    )
}
