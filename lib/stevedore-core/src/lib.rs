//! The log-routing engine: container attachment/pump, the in-memory
//! route registry and matcher, per-record fan-out with backpressure
//! and cancellation, and the route persistence store.
//!
//! This crate never talks HTTP (see `stevedore-api`) and never parses
//! a command line (see the `stevedore` binary). It depends on a container
//! runtime only through the narrow [`runtime::ContainerRuntime`] trait
//! and on a sink only through [`adapter::Adapter`], so it can be
//! exercised end to end against [`runtime::mock::MockRuntime`] and an
//! in-memory adapter without a Docker daemon.

pub mod adapter;
pub mod adapters;
pub mod container;
pub mod error;
pub mod matcher;
pub mod message;
pub mod pump;
pub mod registry;
pub mod route;
pub mod runtime;
pub mod store;
pub mod supervisor;
pub mod transport;
pub mod transports;

pub use adapter::{
    Adapter, AdapterFactories, AdapterFactory, AdapterFactoryError, Sink, SinkSender, SINK_CAPACITY,
};
#[cfg(any(test, feature = "test-support"))]
pub use adapters::{TestAdapterRegistry, TestRecorderHandle};
pub use container::ContainerInfo;
pub use error::{ConfigError, FatalEngineError, RegistryError, StoreError};
pub use matcher::{is_multi_container, matches_container, matches_message};
pub use message::{Message, Source};
pub use pump::ContainerPump;
pub use registry::Registry;
pub use route::{generate_id, parse_uri, Route, RouteDescriptor, RouteFilter};
pub use runtime::{ContainerRuntime, FollowOptions, LogLine, RuntimeError, RuntimeEvent, RuntimeEventKind};
pub use store::RouteStore;
pub use supervisor::{PumpSupervisor, SupervisorConfig};
pub use transport::{Connection, Transport, TransportError, TransportFactories, TransportFactory};
