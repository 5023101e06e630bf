use sqlgate_registry::BackendServer;

/// Interface through which the monitor tells the proxy front end about
/// servers that stopped being usable. The front end force-closes client
/// connections routed to those backends.
pub trait FrontendNotifier: Send + Sync {
    fn hangup(&self, server: &BackendServer);
}

/// Default notifier for deployments without a front end attached (tests,
/// standalone monitoring).
pub struct NoopNotifier;

impl FrontendNotifier for NoopNotifier {
    fn hangup(&self, _server: &BackendServer) {}
}
