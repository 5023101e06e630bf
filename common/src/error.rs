use thiserror::Error;

pub type Result<T> = std::result::Result<T, SqlGateError>;

/// Errors surfaced by the proxy's monitoring and registry subsystems
#[derive(Debug, Error)]
pub enum SqlGateError {
    #[error("I/O error: {message}")]
    Io { message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("server '{0}' does not exist")]
    ServerNotFound(String),

    #[error("server '{0}' already exists")]
    ServerExists(String),

    #[error("server '{server}' is already monitored by '{owner}'")]
    ServerClaimed { server: String, owner: String },

    #[error("monitor '{0}' does not exist")]
    MonitorNotFound(String),

    #[error("monitor '{0}' already exists")]
    MonitorExists(String),

    #[error("unknown monitor module '{0}'")]
    UnknownModule(String),

    #[error("monitor '{0}' is running; stop it before making structural changes")]
    MonitorRunning(String),

    #[error("monitor '{0}' is not running")]
    MonitorNotRunning(String),

    #[error(
        "the server is monitored, so only the maintenance and drain status can be \
         set or cleared manually; status was not modified"
    )]
    StatusNotModifiable,

    #[error("monitor permissions check failed: {0}")]
    PermissionsCheck(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for SqlGateError {
    fn from(err: std::io::Error) -> Self {
        SqlGateError::Io {
            message: err.to_string(),
        }
    }
}
