//! Reference [`Adapter`] implementations shipped with the engine:
//! `raw`, a line-oriented forwarder over the Transport contract, and
//! `test`, an in-memory recorder used by the test suite and the end to
//! end scenarios in place of a real sink. Both are deliberately thin —
//! they exist so the engine can run and be tested without an operator
//! supplying their own adapter crate.

use std::collections::HashMap;
use std::sync::Arc;
#[cfg(any(test, feature = "test-support"))]
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::adapter::{Adapter, AdapterFactories, AdapterFactoryError, Sink};
use crate::message::Message;
use crate::route::RouteDescriptor;
use crate::transport::{Transport, TransportFactories};

/// Forwards each message as a line of text over a dialed
/// [`Transport`] connection: one line per message, connection dialed
/// once and reused, adapter gives up (ending its drain task, which
/// cancels the Route) on the first write error rather than
/// reconnecting.
pub struct RawAdapter {
    address: String,
    options: HashMap<String, String>,
    transport: Arc<dyn Transport>,
    /// Template applied to each message's payload before it is
    /// written. `{data}` is replaced with the line; anything else is
    /// passed through verbatim. Defaults to `"{data}\n"`.
    format: String,
}

impl RawAdapter {
    fn render(&self, msg: &Message) -> String {
        let line = self.format.replace("{data}", &msg.payload);
        if line.ends_with('\n') {
            line
        } else {
            format!("{line}\n")
        }
    }
}

#[async_trait]
impl Adapter for RawAdapter {
    async fn stream(self: Box<Self>, mut sink: Sink) {
        let mut conn = match self.transport.dial(&self.address, &self.options).await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!(address = %self.address, %err, "raw: dial failed, route will not deliver");
                return;
            }
        };

        while let Some(msg) = sink.recv().await {
            let line = self.render(&msg);
            if let Err(err) = conn.write_all(line.as_bytes()).await {
                tracing::warn!(address = %self.address, %err, "raw: write failed, ending route");
                return;
            }
        }
    }
}

/// Builds a `raw` [`AdapterFactory`](crate::adapter::AdapterFactory)
/// bound to the given transport table. The descriptor's transport
/// suffix (default `udp`) selects which registered transport dials
/// the connection.
pub fn raw_factory(
    transports: Arc<TransportFactories>,
) -> impl Fn(&RouteDescriptor) -> Result<Box<dyn Adapter>, AdapterFactoryError> + Send + Sync {
    move |descriptor: &RouteDescriptor| {
        let (_, transport_suffix) = descriptor.adapter_parts();
        let suffix = transport_suffix.unwrap_or("udp");
        let transport = transports
            .get(suffix)
            .ok_or_else(|| AdapterFactoryError::new(format!("no transport registered for suffix {suffix:?}")))?;

        let format = descriptor
            .options
            .as_ref()
            .and_then(|opts| opts.get("format"))
            .cloned()
            .unwrap_or_else(|| "{data}\n".to_string());

        Ok(Box::new(RawAdapter {
            address: descriptor.address.clone(),
            options: descriptor.options.clone().unwrap_or_default(),
            transport,
            format,
        }) as Box<dyn Adapter>)
    }
}

/// In-memory recorder for one `test://` address, shared between the
/// drain task's [`TestAdapter`] and whatever test code holds a handle
/// from [`TestAdapterRegistry::recorder`].
#[cfg(any(test, feature = "test-support"))]
#[derive(Default)]
struct Recorder {
    messages: StdMutex<Vec<Message>>,
}

/// A handle a test can use to read back everything routed to one
/// `test://` address.
#[cfg(any(test, feature = "test-support"))]
#[derive(Clone)]
pub struct TestRecorderHandle {
    recorder: Arc<Recorder>,
}

#[cfg(any(test, feature = "test-support"))]
impl TestRecorderHandle {
    pub fn messages(&self) -> Vec<Message> {
        self.recorder.messages.lock().unwrap().clone()
    }
}

#[cfg(any(test, feature = "test-support"))]
struct TestAdapter {
    recorder: Arc<Recorder>,
}

#[cfg(any(test, feature = "test-support"))]
#[async_trait]
impl Adapter for TestAdapter {
    async fn stream(self: Box<Self>, mut sink: Sink) {
        while let Some(msg) = sink.recv().await {
            self.recorder.messages.lock().unwrap().push(msg);
        }
    }
}

/// Owns one [`Recorder`] per address a `test://` Route has ever used,
/// so a test can POST/configure a route against `test://anything` and
/// later retrieve exactly what it received, without a real network
/// sink. Not part of the production adapter set: only compiled in
/// under the `test-support` feature (or `cfg(test)`), mirroring
/// [`crate::runtime::mock`].
#[cfg(any(test, feature = "test-support"))]
#[derive(Default)]
pub struct TestAdapterRegistry {
    recorders: StdMutex<HashMap<String, Arc<Recorder>>>,
}

#[cfg(any(test, feature = "test-support"))]
impl TestAdapterRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn recorder_for(&self, address: &str) -> Arc<Recorder> {
        self.recorders
            .lock()
            .unwrap()
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(Recorder::default()))
            .clone()
    }

    /// Returns a handle to read back messages recorded for `address`,
    /// creating an (empty) recorder if none exists yet.
    pub fn recorder(&self, address: &str) -> TestRecorderHandle {
        TestRecorderHandle { recorder: self.recorder_for(address) }
    }

    /// Builds the `test` adapter factory bound to this registry,
    /// ready to hand to [`AdapterFactories::register`].
    pub fn factory(self: &Arc<Self>) -> impl Fn(&RouteDescriptor) -> Result<Box<dyn Adapter>, AdapterFactoryError> + Send + Sync {
        let registry = self.clone();
        move |descriptor: &RouteDescriptor| {
            Ok(Box::new(TestAdapter { recorder: registry.recorder_for(&descriptor.address) }) as Box<dyn Adapter>)
        }
    }
}

/// Registers the `raw` adapter kind (backed by `transports`) into
/// `adapters`. Called once at bootstrap; the `test` kind is registered
/// separately by whoever owns a [`TestAdapterRegistry`], since unlike
/// `raw` it has a handle the caller needs to keep.
pub fn register_builtin(adapters: &AdapterFactories, transports: Arc<TransportFactories>) {
    adapters.register("raw", Box::new(raw_factory(transports)));
}
