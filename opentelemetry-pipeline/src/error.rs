use thiserror::Error;

/// Errors returned by the pipeline tracer lifecycle operations.
///
/// Data-shape anomalies coming from the host pipeline (duplicate end
/// events, missing locations, malformed propagation data) are absorbed and
/// logged, never surfaced here; this enum covers programmer-error-class
/// misuse only.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Shutdown was requested more than once.
    #[error("pipeline tracer already shut down")]
    AlreadyShutdown,

    /// The background sweeper could not be stopped cleanly.
    #[error("shutdown failed: {0}")]
    ShutdownFailed(String),
}
