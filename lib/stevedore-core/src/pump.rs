//! The Container Pump: converts one container's stdout/stderr
//! byte streams into a lazy sequence of [`Message`]s and fans each out
//! to every currently-subscribed sink whose Route matches it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::adapter::SinkSender;
use crate::container::ContainerInfo;
use crate::matcher;
use crate::message::{Message, Source};
use crate::route::Route;

/// The grace window a slow subscriber gets before [`ContainerPump::send`]
/// gives up on it and evicts it from the subscription map.
pub const SEND_GRACE: Duration = Duration::from_secs(1);

/// An opaque handle identifying one sink-stream subscription, used as
/// the key into a Pump's subscription map. Routes are looked up by
/// handle rather than the Pump holding a `Route` reference directly,
/// avoiding a Pump <-> Route reference cycle.
pub type SinkHandle = u64;

struct Subscription {
    sink: SinkSender,
    route: Arc<Route>,
}

/// Per-container line reader and subscription manager.
///
/// Invariant: the subscription map is guarded by a mutex, and `send`
/// iterates under that lock, serializing the eviction-on-timeout check
/// across subscribers rather than fanning out concurrently.
pub struct ContainerPump {
    pub container: std::sync::Mutex<Arc<ContainerInfo>>,
    subscriptions: Mutex<HashMap<SinkHandle, Subscription>>,
    next_handle: AtomicU64,
}

impl ContainerPump {
    pub fn new(container: ContainerInfo) -> Arc<Self> {
        Arc::new(ContainerPump {
            container: std::sync::Mutex::new(Arc::new(container)),
            subscriptions: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(0),
        })
    }

    pub fn container_info(&self) -> Arc<ContainerInfo> {
        self.container.lock().unwrap().clone()
    }

    /// Applied on a `rename` event: patches the container's display
    /// name without disturbing existing subscriptions or in-flight
    /// reads.
    pub fn rename(&self, new_name: String) {
        let mut guard = self.container.lock().unwrap();
        let mut updated = (**guard).clone();
        updated.name = new_name;
        *guard = Arc::new(updated);
    }

    /// Subscribes `sink` to this Pump for as long as `route` stays
    /// unmatched-and-uncancelled. Returns the handle `remove` needs.
    pub async fn add(&self, sink: SinkSender, route: Arc<Route>) -> SinkHandle {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.subscriptions
            .lock()
            .await
            .insert(handle, Subscription { sink, route });
        handle
    }

    /// Idempotent: removing an already-removed handle is a no-op.
    pub async fn remove(&self, handle: SinkHandle) {
        self.subscriptions.lock().await.remove(&handle);
    }

    /// Delivers `msg` to every subscriber whose Route matches it.
    /// Iterates the subscription map under its lock; a subscriber that
    /// doesn't drain within [`SEND_GRACE`] is evicted rather than
    /// allowed to stall the rest of the fan-out.
    pub async fn send(&self, msg: Message) {
        let mut subs = self.subscriptions.lock().await;
        let mut evict = Vec::new();
        for (&handle, sub) in subs.iter() {
            if sub.route.is_closed() || !matcher::matches_message(&sub.route.filter, &msg) {
                continue;
            }
            match timeout(SEND_GRACE, sub.sink.send(msg.clone())).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => evict.push(handle),
                Err(_) => {
                    tracing::debug!(handle, "pump: send timeout, evicting slow subscriber");
                    evict.push(handle);
                }
            }
        }
        for handle in evict {
            subs.remove(&handle);
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscriptions.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Adapter, Sink};
    use crate::route::RouteFilter;
    use async_trait::async_trait;
    use std::collections::HashMap as Map;

    struct NullAdapter;
    #[async_trait]
    impl Adapter for NullAdapter {
        async fn stream(self: Box<Self>, _sink: Sink) {}
    }

    fn container(id: &str) -> ContainerInfo {
        ContainerInfo {
            id: id.to_string(),
            name: "/c".to_string(),
            env: vec![],
            labels: Map::new(),
            tty: false,
            log_driver: "json-file".to_string(),
            running: true,
        }
    }

    fn route(filter: RouteFilter) -> Arc<Route> {
        Arc::new(Route::new(
            "r1".to_string(),
            filter,
            "test".to_string(),
            None,
            "mem://".to_string(),
            Map::new(),
            Box::new(NullAdapter),
        ))
    }

    #[tokio::test]
    async fn send_delivers_only_to_matching_subscribers() {
        let pump = ContainerPump::new(container("abc"));
        let (tx_match, mut rx_match) = tokio::sync::mpsc::channel(8);
        let (tx_nomatch, mut rx_nomatch) = tokio::sync::mpsc::channel(8);

        pump.add(tx_match, route(RouteFilter {
            filter_sources: vec![Source::Stdout],
            ..Default::default()
        }))
        .await;
        pump.add(tx_nomatch, route(RouteFilter {
            filter_sources: vec![Source::Stderr],
            ..Default::default()
        }))
        .await;

        pump.send(Message::new(
            Arc::new(container("abc")),
            Source::Stdout,
            "hello".to_string(),
        ))
        .await;

        let received = rx_match.try_recv().unwrap();
        assert_eq!(received.payload, "hello");
        assert!(rx_nomatch.try_recv().is_err());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let pump = ContainerPump::new(container("abc"));
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        let handle = pump.add(tx, route(RouteFilter::default())).await;
        pump.remove(handle).await;
        pump.remove(handle).await;
        assert_eq!(pump.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn slow_subscriber_is_evicted_without_blocking_others() {
        let pump = ContainerPump::new(container("abc"));
        let (tx_slow, rx_slow) = tokio::sync::mpsc::channel(1);
        // Fill the channel so the next send blocks, then never drain it.
        tx_slow.try_send(Message::new(
            Arc::new(container("abc")),
            Source::Stdout,
            "filler".to_string(),
        )).unwrap();
        std::mem::forget(rx_slow);

        let (tx_fast, mut rx_fast) = tokio::sync::mpsc::channel(8);

        pump.add(tx_slow, route(RouteFilter::default())).await;
        pump.add(tx_fast, route(RouteFilter::default())).await;

        pump.send(Message::new(
            Arc::new(container("abc")),
            Source::Stdout,
            "hi".to_string(),
        ))
        .await;

        assert_eq!(pump.subscriber_count().await, 1);
        assert_eq!(rx_fast.try_recv().unwrap().payload, "hi");
    }
}
