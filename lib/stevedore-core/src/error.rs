//! The error taxonomy for the engine.
//!
//! Per-message and per-container failures never reach here: they are
//! handled locally (dropped, logged, or turned into a pump/route
//! teardown) exactly as described by the propagation rules in the
//! error handling design. What lands in [`EngineError`] is everything
//! that is either user-facing (bad config, bad route) or fatal to the
//! process.

use snafu::Snafu;

/// Errors surfaced to a caller of the Route Registry or Control API.
///
/// These map directly onto the `ConfigError` / `PersistorError` rows
/// of the error taxonomy: malformed input is the caller's problem,
/// disk failures are logged but never roll back in-memory state.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RegistryError {
    /// An adapter kind with no registered factory.
    #[snafu(display("unknown adapter kind: {kind}"))]
    UnknownAdapter { kind: String },

    /// The adapter factory itself rejected the route (bad address, bad options).
    #[snafu(display("adapter rejected route: {source}"))]
    AdapterConstruction { source: Box<dyn std::error::Error + Send + Sync> },

    /// No route exists with the given id.
    #[snafu(display("no such route: {id}"))]
    NotFound { id: String },
}

/// Errors from parsing a route descriptor or route URI.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("malformed route uri {uri:?}: {reason}"))]
    BadUri { uri: String, reason: String },

    #[snafu(display("malformed route filter: {reason}"))]
    BadFilter { reason: String },

    #[snafu(display("malformed route descriptor: {source}"))]
    BadDescriptor { source: serde_json::Error },
}

/// Errors from the on-disk route store.
///
/// A `PersistorError` is always logged and never propagated back into
/// registry state: the in-memory registry is authoritative.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    #[snafu(display("store io error at {path}: {source}"))]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("failed to decode route record at {path}: {source}"))]
    Decode {
        path: String,
        source: serde_json::Error,
    },
}

/// Fatal, process-terminating errors.
///
/// These are the only errors the Job Supervisor needs to know about:
/// everything else is absorbed at a lower layer.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FatalEngineError {
    #[snafu(display("container runtime event subscription closed"))]
    EventStreamClosed,

    #[snafu(display("{job} setup failed: {source}"))]
    Setup {
        job: &'static str,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[snafu(display("{job} terminated: {source}"))]
    JobTerminated {
        job: &'static str,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}
