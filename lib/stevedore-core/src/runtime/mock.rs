//! An in-memory [`ContainerRuntime`] used by property and end-to-end
//! tests: a handle the test drives directly, plumbed into the engine
//! through the same trait a real client would implement.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures_util::stream;
use tokio::sync::{mpsc, Mutex};

use crate::container::ContainerInfo;
use crate::message::Source;

use super::{ContainerRuntime, FollowOptions, LogLine, RuntimeError, RuntimeEvent, RuntimeEventKind};

struct Inner {
    containers: HashMap<String, ContainerInfo>,
    event_tx: mpsc::UnboundedSender<RuntimeEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<RuntimeEvent>>,
    log_lines: HashMap<String, mpsc::UnboundedSender<LogLine>>,
    log_sources: HashMap<String, Arc<Mutex<Option<mpsc::UnboundedReceiver<LogLine>>>>>,
}

/// A runtime double whose container set, event stream, and per-container
/// log lines are driven directly by the test.
#[derive(Clone)]
pub struct MockRuntime {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        MockRuntime {
            inner: Arc::new(Mutex::new(Inner {
                containers: HashMap::new(),
                event_tx,
                event_rx: Some(event_rx),
                log_lines: HashMap::new(),
                log_sources: HashMap::new(),
            })),
        }
    }

    /// Registers a container as running and emits a `start` event for it.
    pub async fn start_container(&self, info: ContainerInfo) {
        let mut inner = self.inner.lock().await;
        let id = info.id.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        inner.log_lines.insert(id.clone(), tx);
        inner
            .log_sources
            .insert(id.clone(), Arc::new(Mutex::new(Some(rx))));
        inner.containers.insert(id.clone(), info);
        let _ = inner.event_tx.send(RuntimeEvent {
            kind: RuntimeEventKind::Start,
            container_id: id,
        });
    }

    /// Marks a container as no longer running and emits a `die` event.
    pub async fn kill_container(&self, id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(container) = inner.containers.get_mut(id) {
            container.running = false;
        }
        inner.log_lines.remove(id);
        let _ = inner.event_tx.send(RuntimeEvent {
            kind: RuntimeEventKind::Die,
            container_id: id.to_string(),
        });
    }

    /// Renames a container and emits a `rename` event.
    pub async fn rename_container(&self, id: &str, new_name: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(container) = inner.containers.get_mut(id) {
            container.name = format!("/{new_name}");
        }
        let _ = inner.event_tx.send(RuntimeEvent {
            kind: RuntimeEventKind::Rename,
            container_id: id.to_string(),
        });
    }

    /// Appends one line to a container's active log stream.
    pub async fn emit_line(&self, id: &str, source: Source, data: impl Into<Vec<u8>>) {
        let inner = self.inner.lock().await;
        if let Some(tx) = inner.log_lines.get(id) {
            let _ = tx.send(LogLine {
                source,
                data: data.into(),
            });
        }
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn list_running(&self) -> Result<Vec<ContainerInfo>, RuntimeError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .containers
            .values()
            .filter(|c| c.running)
            .cloned()
            .collect())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInfo, RuntimeError> {
        let inner = self.inner.lock().await;
        inner
            .containers
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound { id: id.to_string() })
    }

    async fn events(
        &self,
    ) -> Result<BoxStream<'static, Result<RuntimeEvent, RuntimeError>>, RuntimeError> {
        let mut inner = self.inner.lock().await;
        let rx = inner
            .event_rx
            .take()
            .expect("MockRuntime::events called more than once");
        Ok(Box::pin(futures_util::stream::unfold(rx, |mut rx| async {
            rx.recv().await.map(|event| (Ok(event), rx))
        })))
    }

    async fn follow_logs(
        &self,
        id: &str,
        _options: FollowOptions,
    ) -> Result<BoxStream<'static, Result<LogLine, RuntimeError>>, RuntimeError> {
        let inner = self.inner.lock().await;
        let source = inner
            .log_sources
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound { id: id.to_string() })?;
        drop(inner);
        let rx = source
            .lock()
            .await
            .take()
            .unwrap_or_else(|| {
                let (_tx, rx) = mpsc::unbounded_channel();
                rx
            });
        Ok(Box::pin(stream::unfold(rx, |mut rx| async {
            rx.recv().await.map(|line| (Ok(line), rx))
        })))
    }
}
