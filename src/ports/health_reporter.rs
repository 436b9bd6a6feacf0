/// Receives failure signals whenever a request is turned into a 5xx by the
/// gateway itself (upstream unreachable, recovered panic).
///
/// Implementations must not block: the call happens on the request path.
pub trait HealthReporter: Send + Sync + 'static {
    fn fail(&self, body: String);
}

/// Reporter used when no health-check collaborator is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHealthReporter;

impl HealthReporter for NoopHealthReporter {
    fn fail(&self, body: String) {
        tracing::debug!(%body, "health failure not reported: no collaborator configured");
    }
}
