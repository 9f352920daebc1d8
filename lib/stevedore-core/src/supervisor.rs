//! The Pump Supervisor: tracks container lifecycle via the
//! runtime's event stream, owns every live [`ContainerPump`], and
//! gives the Route Registry's drain tasks a way to attach a Route's
//! sink to every Pump it currently matches (and every one it will
//! come to match later).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::{oneshot, Mutex};

use crate::adapter::SinkSender;
use crate::container::{ContainerInfo, ExclusionLabel};
use crate::error::FatalEngineError;
use crate::matcher;
use crate::message::Message;
use crate::pump::{ContainerPump, SinkHandle};
use crate::route::Route;
use crate::runtime::{ContainerRuntime, FollowOptions, RuntimeEvent, RuntimeEventKind};

/// Operator-configured knobs governing which containers get pumped
/// and how their tail loop behaves. Populated from the environment by
/// the bootstrap binary.
#[derive(Debug, Clone, Default)]
pub struct SupervisorConfig {
    pub exclusions: Vec<ExclusionLabel>,
    pub allow_tty: bool,
    /// If `false`, newly discovered containers are tailed from "now"
    /// rather than from the beginning of their log.
    pub backlog: bool,
    pub tail: Option<u32>,
    pub inactivity_timeout: Option<Duration>,
}

struct WatcherEntry {
    id: u64,
    route: Arc<Route>,
    sink: SinkSender,
    attached: HashMap<String, SinkHandle>,
    /// Fired by a `die` event matching a single-container Route: ends
    /// this watcher's `route()` call (detaching from all Pumps)
    /// without cancelling the Route itself, so the drain task and its
    /// Adapter are untouched — only the routing stops.
    stop_tx: Option<oneshot::Sender<()>>,
}

/// Pump ownership and route-watcher registration live behind one
/// lock. Keeping them in the same critical section is what makes
/// "attach a newly started Pump to every registered watcher" and
/// "register a watcher against every currently-live Pump" mutually
/// exclusive: whichever happens first, the other is guaranteed to see
/// its result, so a Route is never attached to the same Pump twice and
/// never misses one that existed the moment it started watching.
struct State {
    pumps: HashMap<String, Arc<ContainerPump>>,
    watchers: Vec<WatcherEntry>,
    next_watcher: u64,
}

/// Tracks every currently-live [`ContainerPump`] and every Route
/// currently being routed, mediating between the two.
pub struct PumpSupervisor {
    runtime: Arc<dyn ContainerRuntime>,
    state: Mutex<State>,
    config: SupervisorConfig,
}

impl PumpSupervisor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: SupervisorConfig) -> Arc<Self> {
        Arc::new(PumpSupervisor {
            runtime,
            state: Mutex::new(State {
                pumps: HashMap::new(),
                watchers: Vec::new(),
                next_watcher: 0,
            }),
            config,
        })
    }

    fn is_eligible(&self, info: &ContainerInfo) -> bool {
        if !info.has_tailable_driver() {
            tracing::debug!(id = info.short_id(), "supervisor: unsupported log driver, skipping");
            return false;
        }
        if info.has_ignore_env() {
            tracing::debug!(id = info.short_id(), "supervisor: LOGSPOUT=ignore, skipping");
            return false;
        }
        if self.config.exclusions.iter().any(|rule| rule.matches(info)) {
            tracing::debug!(id = info.short_id(), "supervisor: excluded by label, skipping");
            return false;
        }
        if info.tty && !self.config.allow_tty {
            tracing::debug!(id = info.short_id(), "supervisor: tty container, ALLOW_TTY not set, skipping");
            return false;
        }
        true
    }

    /// `true` iff a Pump currently exists for the given container id.
    pub async fn routing_from(&self, id: &str) -> bool {
        self.state.lock().await.pumps.contains_key(id)
    }

    /// Runs the supervisor to completion: lists already-running
    /// containers, synthesizes a start for each, then processes the
    /// runtime's event stream forever. Returns only on a terminal,
    /// fatal condition (the event stream closing or erroring).
    pub async fn run(self: Arc<Self>) -> Result<(), FatalEngineError> {
        let running = self
            .runtime
            .list_running()
            .await
            .map_err(|source| FatalEngineError::Setup {
                job: "pump supervisor",
                source: Box::new(source),
            })?;
        for info in running {
            self.clone().handle_start(info).await;
        }

        let mut events = self
            .runtime
            .events()
            .await
            .map_err(|source| FatalEngineError::Setup {
                job: "pump supervisor",
                source: Box::new(source),
            })?;

        while let Some(event) = events.next().await {
            match event {
                Ok(event) => self.clone().handle_event(event).await,
                Err(err) => {
                    tracing::warn!(%err, "supervisor: error on event stream");
                }
            }
        }

        Err(FatalEngineError::EventStreamClosed)
    }

    async fn handle_event(self: Arc<Self>, event: RuntimeEvent) {
        match event.kind {
            RuntimeEventKind::Start | RuntimeEventKind::Restart => {
                match self.runtime.inspect(&event.container_id).await {
                    Ok(info) => self.handle_start(info).await,
                    Err(err) => {
                        tracing::warn!(id = %event.container_id, %err, "supervisor: inspect failed on start/restart");
                    }
                }
            }
            RuntimeEventKind::Rename => {
                let state = self.state.lock().await;
                if let Some(pump) = state.pumps.get(&event.container_id) {
                    let pump = pump.clone();
                    drop(state);
                    match self.runtime.inspect(&event.container_id).await {
                        Ok(info) => pump.rename(info.name),
                        Err(err) => {
                            tracing::warn!(id = %event.container_id, %err, "supervisor: inspect failed on rename");
                        }
                    }
                }
            }
            RuntimeEventKind::Die => {
                self.stop_single_container_watchers(&event.container_id).await;
            }
        }
    }

    /// Creates a Pump for a newly-started, eligible container and
    /// attaches it to every currently-registered watcher whose filter
    /// matches, all under one critical section so no `route()` call
    /// racing this insert can either miss the new Pump or double-attach
    /// to it.
    async fn handle_start(self: Arc<Self>, info: ContainerInfo) {
        let id = info.id.clone();
        if !self.is_eligible(&info) {
            return;
        }

        let mut state = self.state.lock().await;
        if state.pumps.contains_key(&id) {
            return;
        }

        let pump = ContainerPump::new(info);
        state.pumps.insert(id.clone(), pump.clone());

        for watcher in state.watchers.iter_mut() {
            if watcher.attached.contains_key(&id) {
                continue;
            }
            if matcher::matches_container(&watcher.route.filter, &pump.container_info()) {
                let handle = pump.add(watcher.sink.clone(), watcher.route.clone()).await;
                watcher.attached.insert(id.clone(), handle);
            }
        }
        drop(state);

        let supervisor = self.clone();
        tokio::spawn(async move {
            supervisor.tail_loop(id, pump).await;
        });
    }

    /// On a `die` event, ends routing (but does not cancel) every
    /// single-container Route whose `filter_id` is a prefix of the
    /// dying container's id, matching `Route()`'s return-on-die
    /// semantics below.
    async fn stop_single_container_watchers(&self, dying_id: &str) {
        let mut state = self.state.lock().await;
        for watcher in state.watchers.iter_mut() {
            if !watcher.route.is_single_container() {
                continue;
            }
            let Some(prefix) = &watcher.route.filter.filter_id else {
                continue;
            };
            if dying_id.starts_with(prefix.as_str()) {
                if let Some(tx) = watcher.stop_tx.take() {
                    let _ = tx.send(());
                }
            }
        }
    }

    /// Attaches `sink` to every Pump currently matching `route`'s
    /// filter, registers a watcher so future matching Pumps are
    /// attached as they appear, and blocks until the Route is
    /// cancelled or a `die` event ends a single-container Route's
    /// routing. On return, detaches `sink` from every Pump it was
    /// attached to.
    pub async fn route(&self, route: Arc<Route>, sink: SinkSender) {
        let (stop_tx, stop_rx) = oneshot::channel();
        let watcher_id = {
            let mut state = self.state.lock().await;
            let mut attached = HashMap::new();
            for pump in state.pumps.values() {
                if matcher::matches_container(&route.filter, &pump.container_info()) {
                    let handle = pump.add(sink.clone(), route.clone()).await;
                    attached.insert(pump.container_info().id.clone(), handle);
                }
            }
            let watcher_id = state.next_watcher;
            state.next_watcher += 1;
            state.watchers.push(WatcherEntry {
                id: watcher_id,
                route: route.clone(),
                sink: sink.clone(),
                attached,
                stop_tx: Some(stop_tx),
            });
            watcher_id
        };

        let mut cancel_rx = route.take_cancel_rx();
        tokio::select! {
            _ = &mut cancel_rx => {}
            _ = stop_rx => {}
        }

        let mut state = self.state.lock().await;
        if let Some(pos) = state.watchers.iter().position(|w| w.id == watcher_id) {
            let watcher = state.watchers.remove(pos);
            for (container_id, handle) in watcher.attached {
                if let Some(pump) = state.pumps.get(&container_id) {
                    pump.remove(handle).await;
                }
            }
        }
    }

    async fn tail_loop(self: Arc<Self>, container_id: String, pump: Arc<ContainerPump>) {
        let mut since = if self.config.backlog { None } else { Some(Utc::now()) };

        loop {
            let opts = FollowOptions {
                stdout: true,
                stderr: true,
                follow: true,
                since,
                tail: self.config.tail,
            };

            match self.runtime.follow_logs(&container_id, opts).await {
                Ok(mut lines) => {
                    while let Some(item) = lines.next().await {
                        match item {
                            Ok(line) => {
                                let container = pump.container_info();
                                let msg = Message::new(container, line.source, decode_line(line.data));
                                pump.send(msg).await;
                            }
                            Err(err) => {
                                tracing::debug!(id = %container_id, %err, "supervisor: log stream error, rewinding");
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    tracing::debug!(id = %container_id, %err, "supervisor: follow_logs failed, rewinding");
                }
            }

            since = Some(match self.config.inactivity_timeout {
                Some(timeout) => Utc::now() - chrono::Duration::from_std(timeout).unwrap_or_default(),
                None => Utc::now(),
            });

            match self.runtime.inspect(&container_id).await {
                Ok(info) if info.running => continue,
                _ => break,
            }
        }

        self.state.lock().await.pumps.remove(&container_id);
    }
}

fn decode_line(data: Vec<u8>) -> String {
    String::from_utf8_lossy(&data).trim_end_matches('\n').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Adapter, Sink};
    use crate::message::Source;
    use crate::route::RouteFilter;
    use crate::runtime::mock::MockRuntime;
    use async_trait::async_trait;
    use std::collections::HashMap as Map;
    use tokio::sync::mpsc;

    struct NullAdapter;
    #[async_trait]
    impl Adapter for NullAdapter {
        async fn stream(self: Box<Self>, _sink: Sink) {}
    }

    fn container(id: &str, name: &str) -> ContainerInfo {
        ContainerInfo {
            id: id.to_string(),
            name: format!("/{name}"),
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
            "null".to_string(),
            None,
            "mem://".to_string(),
            Map::new(),
            Box::new(NullAdapter),
        ))
    }

    #[tokio::test]
    async fn eligibility_filters_skip_excluded_containers() {
        let runtime = MockRuntime::new();
        let supervisor = PumpSupervisor::new(
            Arc::new(runtime.clone()),
            SupervisorConfig {
                exclusions: vec![ExclusionLabel {
                    key: "skip".to_string(),
                    value: "true".to_string(),
                }],
                ..Default::default()
            },
        );

        let mut excluded = container("abc", "excluded");
        excluded.labels.insert("skip".to_string(), "true".to_string());
        runtime.start_container(excluded).await;
        runtime.start_container(container("def", "kept")).await;

        let supervisor_clone = supervisor.clone();
        tokio::spawn(async move {
            let _ = supervisor_clone.run().await;
        });
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!supervisor.routing_from("abc").await);
        assert!(supervisor.routing_from("def").await);
    }

    #[tokio::test]
    async fn route_attaches_to_matching_pump_and_receives_messages() {
        let runtime = MockRuntime::new();
        let supervisor = PumpSupervisor::new(Arc::new(runtime.clone()), SupervisorConfig::default());
        runtime.start_container(container("abc123", "web")).await;

        let supervisor_clone = supervisor.clone();
        tokio::spawn(async move {
            let _ = supervisor_clone.run().await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let r = route(RouteFilter {
            filter_name: Some("web".to_string()),
            ..Default::default()
        });
        let (sink_tx, mut sink_rx) = mpsc::channel(8);

        let supervisor_for_route = supervisor.clone();
        let route_for_route = r.clone();
        tokio::spawn(async move {
            supervisor_for_route.route(route_for_route, sink_tx).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        runtime.emit_line("abc123", Source::Stdout, "hello").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let msg = sink_rx.try_recv().expect("message should have been routed");
        assert_eq!(msg.payload, "hello");

        r.cancel();
    }

    #[tokio::test]
    async fn die_event_stops_single_container_route() {
        let runtime = MockRuntime::new();
        let supervisor = PumpSupervisor::new(Arc::new(runtime.clone()), SupervisorConfig::default());
        runtime.start_container(container("abc123456789", "web")).await;

        let supervisor_clone = supervisor.clone();
        tokio::spawn(async move {
            let _ = supervisor_clone.run().await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let r = route(RouteFilter {
            filter_id: Some("abc123456789".to_string()),
            ..Default::default()
        });
        let (sink_tx, _sink_rx) = mpsc::channel(8);

        let supervisor_for_route = supervisor.clone();
        let route_for_route = r.clone();
        let route_task = tokio::spawn(async move {
            supervisor_for_route.route(route_for_route, sink_tx).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        runtime.kill_container("abc123456789").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(route_task.is_finished());
        assert!(!r.is_closed());
    }

    #[tokio::test]
    async fn concurrent_start_and_route_never_double_attaches() {
        // Regression test: a Pump starting concurrently with a Route
        // beginning to watch must be attached exactly once, never
        // twice (which would double-deliver every message).
        let runtime = MockRuntime::new();
        let supervisor = PumpSupervisor::new(Arc::new(runtime.clone()), SupervisorConfig::default());

        let r = route(RouteFilter::default());
        let (sink_tx, mut sink_rx) = mpsc::channel(64);

        let supervisor_clone = supervisor.clone();
        tokio::spawn(async move {
            let _ = supervisor_clone.run().await;
        });

        let supervisor_for_route = supervisor.clone();
        let route_for_route = r.clone();
        tokio::spawn(async move {
            supervisor_for_route.route(route_for_route, sink_tx).await;
        });

        runtime.start_container(container("abc123", "web")).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        runtime.emit_line("abc123", Source::Stdout, "hi").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(sink_rx.try_recv().unwrap().payload, "hi");
        assert!(sink_rx.try_recv().is_err(), "message must be delivered exactly once");

        r.cancel();
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;
        use proptest::proptest;

        /// Over N container birth/death cycles, the Pump map's size
        /// returns to baseline: no Pump is left behind once every
        /// container in a cycle has died and its tail loop had a chance
        /// to notice and remove it.
        proptest! {
            #![proptest_config(proptest::prelude::ProptestConfig::with_cases(8))]
            #[test]
            fn pump_count_returns_to_baseline_after_birth_death_cycles(cycles in any::<u8>().prop_map(|n| (n % 5) + 1)) {
                let runtime_handle = tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                    .unwrap();

                runtime_handle.block_on(async move {
                    let runtime = MockRuntime::new();
                    let supervisor = PumpSupervisor::new(Arc::new(runtime.clone()), SupervisorConfig::default());

                    let supervisor_clone = supervisor.clone();
                    tokio::spawn(async move {
                        let _ = supervisor_clone.run().await;
                    });
                    tokio::time::sleep(Duration::from_millis(10)).await;

                    for cycle in 0..cycles {
                        let id = format!("cycle{cycle}");
                        runtime.start_container(container(&id, "churner")).await;
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        assert!(supervisor.routing_from(&id).await);

                        runtime.kill_container(&id).await;
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        assert!(!supervisor.routing_from(&id).await);
                    }
                });
            }
        }
    }
}
