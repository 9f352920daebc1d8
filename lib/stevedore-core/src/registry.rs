//! The Route Registry: the authoritative in-memory table of live
//! Routes, backed by the [`crate::store::RouteStore`] for persistence.
//! Owns each Route's drain task, which wires the Route to the Pump
//! Supervisor and hands its sink to the Route's Adapter.

use std::collections::HashMap;
use std::sync::Arc;

use snafu::{OptionExt, ResultExt};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::adapter::{AdapterFactories, SINK_CAPACITY};
use crate::error::{FatalEngineError, NotFoundSnafu, RegistryError, UnknownAdapterSnafu};
use crate::route::{generate_id, Route, RouteDescriptor};
use crate::store::RouteStore;
use crate::supervisor::PumpSupervisor;

struct Entry {
    route: Arc<Route>,
    drain: JoinHandle<()>,
}

/// The registry of live routes. In practice a binary holds one
/// `Registry` behind an `Arc` for the whole process lifetime.
pub struct Registry {
    routes: RwLock<HashMap<String, Entry>>,
    adapters: Arc<AdapterFactories>,
    supervisor: Arc<PumpSupervisor>,
    store: Option<RouteStore>,
}

impl Registry {
    pub fn new(
        adapters: Arc<AdapterFactories>,
        supervisor: Arc<PumpSupervisor>,
        store: Option<RouteStore>,
    ) -> Self {
        Registry {
            routes: RwLock::new(HashMap::new()),
            adapters,
            supervisor,
            store,
        }
    }

    /// Loads every persisted descriptor from the store (if configured)
    /// and adds each as a live Route. A descriptor that no longer
    /// names a registered adapter kind is logged and skipped, rather
    /// than aborting startup.
    pub async fn restore(&self) -> Result<(), RegistryError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let descriptors = store
            .load_all()
            .await
            .map_err(|source| RegistryError::AdapterConstruction {
                source: Box::new(source),
            })?;
        for descriptor in descriptors {
            let id = descriptor.id.clone();
            if let Err(err) = self.add_internal(descriptor, false).await {
                tracing::warn!(?id, %err, "registry: dropping unrestorable route");
            }
        }
        Ok(())
    }

    /// Adds a new Route from a descriptor, persisting it (if a store
    /// is configured) and spawning its drain task. Assigns a fresh id
    /// if the descriptor did not carry one. If a Route already exists
    /// with the given id, the predecessor is cancelled first.
    pub async fn add(&self, descriptor: RouteDescriptor) -> Result<Arc<Route>, RegistryError> {
        self.add_internal(descriptor, true).await
    }

    /// Adds a bootstrap Route (one parsed from a command-line/env
    /// source such as `ROUTE_URIS`) without writing it to the store.
    /// Mirrors the original's `Setup` adding env routes while its
    /// persistor is still nil: bootstrap routes are reconstructed from
    /// the environment on every restart, so persisting them would only
    /// grow the store with a fresh id'd duplicate each boot.
    pub async fn add_bootstrap(&self, descriptor: RouteDescriptor) -> Result<Arc<Route>, RegistryError> {
        self.add_internal(descriptor, false).await
    }

    async fn add_internal(
        &self,
        mut descriptor: RouteDescriptor,
        persist: bool,
    ) -> Result<Arc<Route>, RegistryError> {
        let id = descriptor.id.clone().unwrap_or_else(generate_id);
        descriptor.id = Some(id.clone());

        let (kind, transport) = descriptor.adapter_parts();
        let kind = kind.to_string();
        let transport = transport.map(str::to_string);

        let built = self
            .adapters
            .build(&descriptor)
            .context(UnknownAdapterSnafu { kind: kind.clone() })?;
        let adapter = built.map_err(|source| RegistryError::AdapterConstruction {
            source: Box::new(source),
        })?;

        let filter = descriptor
            .filter()
            .map_err(|source| RegistryError::AdapterConstruction {
                source: Box::new(source),
            })?;

        let route = Arc::new(Route::new(
            id.clone(),
            filter,
            kind,
            transport,
            descriptor.address.clone(),
            descriptor.options.clone().unwrap_or_default(),
            adapter,
        ));

        if persist {
            if let Some(store) = &self.store {
                store
                    .put(&route.to_descriptor())
                    .await
                    .map_err(|source| RegistryError::AdapterConstruction {
                        source: Box::new(source),
                    })?;
            }
        }

        let mut routes = self.routes.write().await;
        if let Some(previous) = routes.remove(&id) {
            // Fire cancellation and let the drain task's own
            // cancel-observing cleanup (detaching from every Pump,
            // deregistering its watcher) run to completion in the
            // background. Aborting it here instead would race the
            // task's internal `tokio::select!` against the abort
            // signal and can skip that cleanup entirely, leaking the
            // subscription and watcher entries it would have removed.
            previous.route.cancel();
            tokio::spawn(async move {
                let _ = previous.drain.await;
            });
        }

        let drain = spawn_drain_task(route.clone(), self.supervisor.clone());
        routes.insert(id, Entry { route: route.clone(), drain });
        Ok(route)
    }

    /// Cancels and forgets a Route. Removing an unknown id is a
    /// `NotFound` error, matching the Control API's `DELETE
    /// /routes/{id}` semantics.
    pub async fn remove(&self, id: &str) -> Result<(), RegistryError> {
        let entry = self
            .routes
            .write()
            .await
            .remove(id)
            .context(NotFoundSnafu { id: id.to_string() })?;
        entry.route.cancel();
        tokio::spawn(async move {
            let _ = entry.drain.await;
        });
        if let Some(store) = &self.store {
            let _ = store.remove(id).await;
        }
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Route>> {
        self.routes.read().await.get(id).map(|e| e.route.clone())
    }

    pub async fn get_all(&self) -> Vec<Arc<Route>> {
        self.routes.read().await.values().map(|e| e.route.clone()).collect()
    }

    /// Gives the Control API's viewer endpoint a handle to the Pump
    /// Supervisor so it can attach an ephemeral, unregistered Route
    /// without going through `add`/`remove` and the store.
    pub fn supervisor(&self) -> Arc<PumpSupervisor> {
        self.supervisor.clone()
    }

    /// Cancels every live Route. Used during process shutdown.
    pub async fn clear(&self) {
        let mut routes = self.routes.write().await;
        for (_, entry) in routes.drain() {
            entry.route.cancel();
            entry.drain.abort();
        }
    }

    /// The Job Supervisor's `run` phase for the registry. Every Route's
    /// drain task is already spawned at add-time rather than gated
    /// behind a separate "routing" flag, since the Job Supervisor's
    /// setup phase completes before the Pump Supervisor's event loop
    /// starts producing anything to route, making the distinction
    /// unobservable. This job has nothing left to do but stay alive,
    /// so the control plane keeps running even with zero routes
    /// configured.
    pub async fn run(&self) -> Result<(), FatalEngineError> {
        std::future::pending().await
    }
}

/// Spawns the task that owns a Route's boxed Adapter: wires the Route
/// into the Pump Supervisor and hands the sink-receiving half to the
/// Adapter. Ends (closing the sink) once the Supervisor's attach loop
/// returns, whether from explicit cancellation or from a `die` event
/// ending a single-container Route's routing.
fn spawn_drain_task(route: Arc<Route>, supervisor: Arc<PumpSupervisor>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (sink_tx, sink_rx) = mpsc::channel(SINK_CAPACITY);
        let adapter = route.take_adapter();
        let adapter_task = tokio::spawn(adapter.stream(sink_rx));

        supervisor.route(route.clone(), sink_tx.clone()).await;
        drop(sink_tx);

        let _ = adapter_task.await;
        route.cancel();
        tracing::debug!(route_id = %route.id, "registry: drain task ended");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Adapter, Sink};
    use crate::runtime::mock::MockRuntime;
    use crate::supervisor::SupervisorConfig;
    use async_trait::async_trait;

    struct NullAdapter;
    #[async_trait]
    impl Adapter for NullAdapter {
        async fn stream(self: Box<Self>, mut sink: Sink) {
            while sink.recv().await.is_some() {}
        }
    }

    fn adapters() -> Arc<AdapterFactories> {
        let factories = AdapterFactories::new();
        factories.register(
            "null",
            Box::new(|_descriptor| Ok(Box::new(NullAdapter) as Box<dyn Adapter>)),
        );
        Arc::new(factories)
    }

    fn supervisor() -> Arc<PumpSupervisor> {
        PumpSupervisor::new(Arc::new(MockRuntime::new()), SupervisorConfig::default())
    }

    fn descriptor() -> RouteDescriptor {
        RouteDescriptor {
            id: None,
            filter_id: None,
            filter_name: None,
            filter_sources: None,
            filter_labels: None,
            adapter: "null".to_string(),
            address: "mem://".to_string(),
            options: None,
        }
    }

    #[tokio::test]
    async fn add_assigns_id_and_is_retrievable() {
        let registry = Registry::new(adapters(), supervisor(), None);
        let route = registry.add(descriptor()).await.unwrap();
        assert!(!route.id.is_empty());
        assert!(registry.get(&route.id).await.is_some());
    }

    #[tokio::test]
    async fn add_rejects_unknown_adapter_kind() {
        let registry = Registry::new(adapters(), supervisor(), None);
        let mut d = descriptor();
        d.adapter = "nonexistent".to_string();
        let err = registry.add(d).await.unwrap_err();
        assert!(matches!(err, RegistryError::UnknownAdapter { .. }));
    }

    #[tokio::test]
    async fn remove_unknown_id_errors() {
        let registry = Registry::new(adapters(), supervisor(), None);
        let err = registry.remove("does-not-exist").await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn remove_cancels_route_and_drops_it() {
        let registry = Registry::new(adapters(), supervisor(), None);
        let route = registry.add(descriptor()).await.unwrap();
        let id = route.id.clone();
        registry.remove(&id).await.unwrap();
        assert!(registry.get(&id).await.is_none());
        assert!(route.is_closed());
    }

    #[tokio::test]
    async fn adding_duplicate_id_cancels_predecessor() {
        let registry = Registry::new(adapters(), supervisor(), None);
        let mut d = descriptor();
        d.id = Some("fixed-id".to_string());
        let first = registry.add(d.clone()).await.unwrap();
        let second = registry.add(d).await.unwrap();
        assert!(first.is_closed());
        assert!(!second.is_closed());
    }

    #[tokio::test]
    async fn persists_and_restores_routes() {
        let dir = tempfile::tempdir().unwrap();
        let store = RouteStore::new(dir.path());
        store.ensure_dir().await.unwrap();

        let registry = Registry::new(adapters(), supervisor(), Some(RouteStore::new(dir.path())));
        let route = registry.add(descriptor()).await.unwrap();
        let id = route.id.clone();
        drop(route);

        let restored = Registry::new(adapters(), supervisor(), Some(store));
        restored.restore().await.unwrap();
        assert!(restored.get(&id).await.is_some());
    }
}
