pub mod backend;
pub mod disk;
pub mod frontend;
pub mod journal;
pub mod module;
pub mod probe;
pub mod registry;
pub mod script;
pub mod server;
pub mod settings;
pub mod worker;

pub use backend::{
    BackendConnection, ConnectError, Connector, MountInfo, QueryError, ReportedRole, ServerFacts,
    TcpConnector,
};
pub use frontend::{FrontendNotifier, NoopNotifier};
pub use module::{MonitorModule, ReplicationModule};
pub use probe::{ProbeOutcome, ProbeResult};
pub use registry::MonitorRegistry;
pub use server::{MonitorServer, StatusRequest};
pub use settings::{ConnectionSettings, MonitorSettings};
pub use worker::{Monitor, MonitorState};
