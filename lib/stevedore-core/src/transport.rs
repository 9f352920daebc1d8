//! The Transport Contract: a dial-a-connection capability that
//! adapters consume. The engine itself never retries a dial;
//! reconnection policy is the adapter's problem.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// A transport-level connection, readable and writable like any
/// stream socket. Boxed so TCP, UDP-wrapped-as-stream, and TLS
/// connections share one adapter-facing type.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Connection for T {}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn dial(
        &self,
        address: &str,
        options: &HashMap<String, String>,
    ) -> Result<Box<dyn Connection>, TransportError>;
}

#[derive(Debug, snafu::Snafu)]
#[snafu(visibility(pub))]
pub enum TransportError {
    #[snafu(display("failed to dial {address}: {source}"))]
    Dial {
        address: String,
        source: std::io::Error,
    },
    #[snafu(display("transport config error: {reason}"))]
    Config { reason: String },
}

pub type TransportFactory = Arc<dyn Transport>;

/// The process-wide table of transport-suffix -> dialer, mirroring
/// [`crate::adapter::AdapterFactories`]. A Route's `adapter` field of
/// `kind+transport` selects both an Adapter factory and, if the
/// Adapter asks for one, a Transport factory from this table.
#[derive(Default)]
pub struct TransportFactories {
    factories: RwLock<HashMap<String, TransportFactory>>,
}

impl TransportFactories {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, suffix: impl Into<String>, transport: TransportFactory) {
        self.factories.write().unwrap().insert(suffix.into(), transport);
    }

    /// Returns a cloned handle to the registered transport, so the
    /// caller can `.dial()` it without holding the table's lock across
    /// an await point.
    pub fn get(&self, suffix: &str) -> Option<TransportFactory> {
        self.factories.read().unwrap().get(suffix).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}
