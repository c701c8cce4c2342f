//! Hooks into the component that owns the balancer.

/// Asked to stop the owning node manager when the balancer hits a fatal
/// error and cannot keep running in a known state.
pub trait ShutdownRequester: Send + Sync + 'static {
    /// Request an orderly shutdown of the owner.
    fn request_shutdown(&self, reason: &str);
}

/// No-op shutdown requester.
pub struct NoopShutdown;

impl ShutdownRequester for NoopShutdown {
    fn request_shutdown(&self, _reason: &str) {}
}

/// Shutdown requester that only logs the request.
pub struct LoggingShutdown;

impl ShutdownRequester for LoggingShutdown {
    fn request_shutdown(&self, reason: &str) {
        tracing::error!(reason, "Master balancer requested owner shutdown");
    }
}
