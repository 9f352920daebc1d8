//! The Adapter Contract: the single capability a Route's sink
//! must satisfy, plus the capability-record factory table the
//! Registry uses to construct one from a [`RouteDescriptor`].

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::message::Message;
use crate::route::RouteDescriptor;

/// The receiving half of a Route's sink channel, handed to an
/// Adapter's [`Adapter::stream`]. Bounded, so a slow Adapter applies
/// backpressure to the Pump rather than growing without limit; the
/// Pump's eviction policy is what keeps a stuck Adapter from stalling
/// the rest of the engine.
pub type Sink = mpsc::Receiver<Message>;

/// The sending half, held by the Registry's drain task and by every
/// [`crate::pump::ContainerPump`] this Route is attached to.
pub type SinkSender = mpsc::Sender<Message>;

/// Capacity of a freshly created sink channel. Chosen to absorb a
/// short burst without adding meaningful latency; the operator-visible
/// backpressure knob is the 1-second eviction deadline, not this
/// buffer size.
pub const SINK_CAPACITY: usize = 256;

/// A sink plug-in consuming Messages from one Route until the sink
/// closes. Implementations own their transport, retries, reconnection
/// policy, and flushing; when an Adapter decides its Route is no
/// longer usable it must cancel the Route itself (closing its own
/// sink) rather than spin forever.
#[async_trait]
pub trait Adapter: Send {
    async fn stream(self: Box<Self>, sink: Sink);
}

/// Constructs an Adapter from a route descriptor's address/options,
/// failing if the descriptor is malformed for this adapter kind.
pub type AdapterFactory =
    Box<dyn Fn(&RouteDescriptor) -> Result<Box<dyn Adapter>, AdapterFactoryError> + Send + Sync>;

#[derive(Debug, snafu::Snafu)]
#[snafu(display("{message}"))]
pub struct AdapterFactoryError {
    message: String,
}

impl AdapterFactoryError {
    pub fn new(msg: impl Into<String>) -> Self {
        AdapterFactoryError { message: msg.into() }
    }
}

/// The process-wide table of adapter-kind -> factory. Populated once
/// at startup (built-in kinds plus whatever the binary registers) and
/// never mutated afterward: the core only ever holds these factory
/// records, never concrete adapter types.
#[derive(Default)]
pub struct AdapterFactories {
    factories: RwLock<HashMap<String, AdapterFactory>>,
}

impl AdapterFactories {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: impl Into<String>, factory: AdapterFactory) {
        self.factories.write().unwrap().insert(kind.into(), factory);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Builds an Adapter for the given descriptor's `adapter` kind,
    /// or `None` if no factory is registered for it — the caller maps
    /// that onto a `ConfigError` / HTTP 400.
    pub fn build(&self, descriptor: &RouteDescriptor) -> Option<Result<Box<dyn Adapter>, AdapterFactoryError>> {
        let (kind, _transport) = descriptor.adapter_parts();
        self.factories
            .read()
            .unwrap()
            .get(kind)
            .map(|factory| factory(descriptor))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.read().unwrap().contains_key(kind)
    }
}
