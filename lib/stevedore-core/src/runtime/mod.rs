//! The container runtime client: the narrow, injected collaborator
//! the Pump Supervisor uses for container listing, event
//! subscription, and log-tail. The production implementation
//! ([`bollard_runtime::BollardRuntime`]) talks to Docker; tests use
//! [`mock::MockRuntime`].

pub mod bollard_runtime;
#[cfg(any(test, feature = "test-support"))]
pub mod mock;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::container::ContainerInfo;
use crate::message::Source;

/// A container lifecycle event as reported by the runtime's event
/// stream.
#[derive(Debug, Clone)]
pub struct RuntimeEvent {
    pub kind: RuntimeEventKind,
    pub container_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeEventKind {
    Start,
    Restart,
    Rename,
    Die,
}

/// One line read from a container's combined stdout/stderr tail,
/// already demultiplexed by the runtime client (mirroring how
/// `bollard`'s `LogOutput` arrives pre-split by stream, sparing the
/// engine from re-implementing the runtime's binary frame header).
#[derive(Debug, Clone)]
pub struct LogLine {
    pub source: Source,
    pub data: Vec<u8>,
}

/// Parameters for a single follow-logs call.
#[derive(Debug, Clone)]
pub struct FollowOptions {
    pub stdout: bool,
    pub stderr: bool,
    pub follow: bool,
    /// Only return log lines produced after this time.
    pub since: Option<chrono::DateTime<chrono::Utc>>,
    /// `None` means "all".
    pub tail: Option<u32>,
}

/// The container-runtime capability the Pump Supervisor depends on.
/// Kept deliberately narrow: list/inspect for bootstrap and eligibility
/// checks, an event stream for lifecycle tracking, and a per-container
/// follow-logs call the Supervisor re-enters on every return (its tail
/// loop).
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn list_running(&self) -> Result<Vec<ContainerInfo>, RuntimeError>;

    async fn inspect(&self, id: &str) -> Result<ContainerInfo, RuntimeError>;

    async fn events(&self) -> Result<BoxStream<'static, Result<RuntimeEvent, RuntimeError>>, RuntimeError>;

    async fn follow_logs(
        &self,
        id: &str,
        options: FollowOptions,
    ) -> Result<BoxStream<'static, Result<LogLine, RuntimeError>>, RuntimeError>;
}

/// A `TransientIOError`/`TerminalContainerError` from the runtime
/// client. The Supervisor treats any error from `follow_logs` as
/// terminal for that container's tail loop (the container is
/// re-inspected; if it is gone, the Pump is torn down) and any error
/// from `events()` itself as fatal to the whole engine.
#[derive(Debug, snafu::Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RuntimeError {
    #[snafu(display("container {id} not found"))]
    NotFound { id: String },

    #[snafu(display("runtime request failed: {source}"))]
    Request {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}
