//! Cluster Coordinator
//!
//! Owns a named group channel, tracks the membership view, and offers
//! a scheduled-task facility to the layers above. A single pump task
//! consumes channel events, so view swaps and listener callbacks are
//! serialized and observed strictly in view-id order.
//!
//! The coordinator never creates scheduling resources of its own:
//! every background task runs on the runtime handle the hosting code
//! supplies through the [`CoordinatorRegistry`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::channel::{ChannelEvent, ChannelFactory, GroupChannel, NodeId};
use crate::metrics::Metrics;

use super::view::ClusterView;

const RECONNECT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const RECONNECT_MAX_BACKOFF: Duration = Duration::from_secs(30);
const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Error type for coordinator operations
#[derive(Debug)]
pub enum ClusterError {
    /// The group channel could not be opened or is gone
    ChannelUnavailable(String),
    /// The coordinator was shut down
    ShutDown,
}

impl fmt::Display for ClusterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterError::ChannelUnavailable(msg) => write!(f, "Channel unavailable: {}", msg),
            ClusterError::ShutDown => write!(f, "Coordinator shut down"),
        }
    }
}

impl std::error::Error for ClusterError {}

/// Callbacks invoked by the coordinator's pump task.
///
/// `on_view_changed` is called strictly in view-id order. All methods
/// run on the pump task; implementations must not block for long.
pub trait CoordinatorListener: Send + Sync {
    fn on_view_changed(&self, view: &Arc<ClusterView>) {
        let _ = view;
    }

    /// Advisory: the transport looks unhealthy. Never fatal.
    fn on_partition_suspected(&self, detail: &str) {
        let _ = detail;
    }

    /// An inbound data frame from another member.
    fn on_message(&self, from: &NodeId, payload: &Bytes) {
        let _ = (from, payload);
    }
}

struct TaskInner {
    cancelled: Arc<AtomicBool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

/// Cancellation handle for a fixed-rate task.
///
/// After `cancel` returns, no further invocation of the task begins.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<TaskInner>,
}

impl TaskHandle {
    /// Stop the task. Waits out an invocation already in flight, so no
    /// invocation is running or will start once this returns.
    pub async fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        let join = self.inner.join.lock().take();
        if let Some(join) = join {
            join.abort();
            let _ = join.await;
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }
}

/// Tracks membership for one named group channel.
pub struct Coordinator {
    channel_name: String,
    node_name: String,
    local: NodeId,
    factory: Arc<dyn ChannelFactory>,
    channel: RwLock<Arc<dyn GroupChannel>>,
    view: RwLock<Arc<ClusterView>>,
    listeners: RwLock<Vec<Arc<dyn CoordinatorListener>>>,
    scheduler: Handle,
    metrics: Arc<Metrics>,
    probe_interval: Duration,
    shutdown: Arc<AtomicBool>,
    tasks: Mutex<Vec<TaskHandle>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    fn start(
        channel_name: String,
        node_name: String,
        channel: Arc<dyn GroupChannel>,
        events: mpsc::Receiver<ChannelEvent>,
        factory: Arc<dyn ChannelFactory>,
        scheduler: Handle,
        metrics: Arc<Metrics>,
        probe_interval: Duration,
    ) -> Arc<Self> {
        let local = channel.local_node().clone();
        let view = Arc::new(ClusterView::initial(local.clone()));
        metrics.cluster_members_current.set(view.len() as i64);

        let coordinator = Arc::new(Self {
            channel_name,
            node_name,
            local,
            factory,
            channel: RwLock::new(channel),
            view: RwLock::new(view),
            listeners: RwLock::new(Vec::new()),
            scheduler: scheduler.clone(),
            metrics,
            probe_interval,
            shutdown: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
            pump: Mutex::new(None),
        });

        let pump_coordinator = coordinator.clone();
        let pump = scheduler.spawn(async move {
            pump_coordinator.pump(events).await;
        });
        *coordinator.pump.lock() = Some(pump);

        coordinator
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    pub fn local_node(&self) -> &NodeId {
        &self.local
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub(crate) fn scheduler(&self) -> &Handle {
        &self.scheduler
    }

    pub(crate) fn group_channel(&self) -> Arc<dyn GroupChannel> {
        self.channel.read().clone()
    }

    /// Most recently applied view. Non-blocking; may be transiently
    /// stale while a membership event is mid-flight.
    pub fn current_view(&self) -> Arc<ClusterView> {
        self.view.read().clone()
    }

    pub fn is_member(&self, node_name: &str) -> bool {
        self.current_view().contains(&NodeId::new(node_name))
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Register a listener for view, partition, and message events.
    pub fn add_listener(&self, listener: Arc<dyn CoordinatorListener>) {
        self.listeners.write().push(listener);
    }

    /// Run `task` every `period` on the injected scheduler. The first
    /// invocation happens one period after this call.
    pub fn schedule_at_fixed_rate<F>(&self, period: Duration, mut task: F) -> TaskHandle
    where
        F: FnMut() + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let join = self.scheduler.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first interval tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if flag.load(Ordering::Acquire) {
                    return;
                }
                task();
            }
        });

        let handle = TaskHandle {
            inner: Arc::new(TaskInner {
                cancelled,
                join: Mutex::new(Some(join)),
            }),
        };
        self.tasks.lock().push(handle.clone());
        handle
    }

    /// Disconnect the channel and release every scheduled task. Safe
    /// to call more than once and after a partial start; no listener
    /// callback begins after this returns.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(
            "Coordinator '{}' on channel '{}' shutting down",
            self.node_name, self.channel_name
        );

        let tasks: Vec<TaskHandle> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.cancel().await;
        }

        let channel = self.channel.read().clone();
        channel.close().await;

        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            pump.abort();
            let _ = pump.await;
        }

        // Listeners hold the coordinator in turn; dropping them here
        // breaks the reference cycle
        self.listeners.write().clear();
    }

    /// Consume channel events, swap views, run the probe ticker.
    async fn pump(self: Arc<Self>, mut events: mpsc::Receiver<ChannelEvent>) {
        let mut probe = tokio::time::interval(self.probe_interval);
        probe.set_missed_tick_behavior(MissedTickBehavior::Skip);
        probe.tick().await;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(ChannelEvent::MembershipChanged { members }) => {
                        self.apply_membership(members);
                    }
                    Some(ChannelEvent::Message { from, payload }) => {
                        self.dispatch_message(&from, &payload);
                    }
                    Some(ChannelEvent::PartitionSuspected { detail }) => {
                        self.notify_partition(&detail);
                    }
                    Some(ChannelEvent::Closed) | None => {
                        if self.shutdown.load(Ordering::Acquire) {
                            return;
                        }
                        self.notify_partition("group channel closed");
                        match self.reconnect().await {
                            Some(rx) => events = rx,
                            None => return,
                        }
                    }
                },
                _ = probe.tick() => {
                    let channel = self.channel.read().clone();
                    if let Err(e) = channel.probe().await {
                        self.notify_partition(&format!("liveness probe failed: {}", e));
                    }
                }
            }
        }
    }

    /// Swap in the successor view and notify listeners in order.
    fn apply_membership(&self, members: Vec<NodeId>) {
        let normalized = ClusterView::normalize(members);

        let new_view = {
            let mut slot = self.view.write();
            if slot.members() == normalized.as_slice() {
                return;
            }
            let next = Arc::new(slot.next(normalized));
            *slot = next.clone();
            next
        };

        info!("Channel '{}': {}", self.channel_name, new_view);
        self.metrics.view_changes_total.inc();
        self.metrics.cluster_members_current.set(new_view.len() as i64);

        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_view_changed(&new_view);
        }
    }

    fn dispatch_message(&self, from: &NodeId, payload: &Bytes) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_message(from, payload);
        }
    }

    fn notify_partition(&self, detail: &str) {
        warn!(
            "Channel '{}': partition suspected: {}",
            self.channel_name, detail
        );
        self.metrics.partition_suspected_total.inc();

        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_partition_suspected(detail);
        }
    }

    /// Reopen the channel through the factory with exponential backoff
    /// until it comes back or shutdown is requested.
    async fn reconnect(&self) -> Option<mpsc::Receiver<ChannelEvent>> {
        let mut backoff = RECONNECT_INITIAL_BACKOFF;

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return None;
            }
            tokio::time::sleep(backoff).await;

            match self.factory.open(&self.channel_name, &self.node_name).await {
                Ok((channel, events)) => {
                    info!(
                        "Channel '{}': reconnected as '{}'",
                        self.channel_name, self.node_name
                    );
                    *self.channel.write() = channel;
                    return Some(events);
                }
                Err(e) => {
                    debug!(
                        "Channel '{}': reconnect failed ({}), retrying in {:?}",
                        self.channel_name, e, backoff
                    );
                    backoff = std::cmp::min(backoff * 2, RECONNECT_MAX_BACKOFF);
                }
            }
        }
    }
}

/// Opens coordinators by channel name, idempotently.
///
/// The registry carries the injected channel factory and the runtime
/// handle the coordinators schedule on. Joining the same channel name
/// twice returns the existing coordinator.
pub struct CoordinatorRegistry {
    factory: Arc<dyn ChannelFactory>,
    scheduler: Handle,
    metrics: Arc<Metrics>,
    probe_interval: Duration,
    coordinators: DashMap<String, Arc<Coordinator>>,
}

impl CoordinatorRegistry {
    pub fn new(factory: Arc<dyn ChannelFactory>, scheduler: Handle, metrics: Arc<Metrics>) -> Self {
        Self {
            factory,
            scheduler,
            metrics,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            coordinators: DashMap::new(),
        }
    }

    pub fn with_probe_interval(mut self, probe_interval: Duration) -> Self {
        self.probe_interval = probe_interval;
        self
    }

    /// Attach to a named channel and begin tracking membership.
    ///
    /// Idempotent per channel name: a second join returns the existing
    /// coordinator. An entry whose coordinator was shut down counts as
    /// stale and is replaced.
    pub async fn join(
        &self,
        channel_name: &str,
        node_name: &str,
    ) -> Result<Arc<Coordinator>, ClusterError> {
        if let Some(existing) = self.coordinators.get(channel_name) {
            if !existing.is_shut_down() {
                return Ok(existing.clone());
            }
        }

        let (channel, events) = self
            .factory
            .open(channel_name, node_name)
            .await
            .map_err(|e| ClusterError::ChannelUnavailable(e.to_string()))?;

        let coordinator = Coordinator::start(
            channel_name.to_string(),
            node_name.to_string(),
            channel,
            events,
            self.factory.clone(),
            self.scheduler.clone(),
            self.metrics.clone(),
            self.probe_interval,
        );

        // A concurrent join may have raced us; keep whichever landed
        // first and tear the loser down.
        match self.coordinators.entry(channel_name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if occupied.get().is_shut_down() {
                    occupied.insert(coordinator.clone());
                    Ok(coordinator)
                } else {
                    let existing = occupied.get().clone();
                    drop(occupied);
                    coordinator.shutdown().await;
                    Ok(existing)
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(coordinator.clone());
                Ok(coordinator)
            }
        }
    }

    /// Look up an already-joined coordinator.
    pub fn get(&self, channel_name: &str) -> Option<Arc<Coordinator>> {
        self.coordinators.get(channel_name).map(|c| c.clone())
    }

    /// Shut down and forget the coordinator for one channel.
    pub async fn leave(&self, channel_name: &str) {
        if let Some((_, coordinator)) = self.coordinators.remove(channel_name) {
            coordinator.shutdown().await;
        }
    }

    /// Shut down every coordinator this registry opened.
    pub async fn shutdown_all(&self) {
        let names: Vec<String> = self.coordinators.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.leave(&name).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LocalNetwork;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn registry(network: &LocalNetwork) -> CoordinatorRegistry {
        CoordinatorRegistry::new(
            Arc::new(network.clone()),
            Handle::current(),
            Metrics::new(),
        )
        .with_probe_interval(Duration::from_secs(3600))
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            if Instant::now() > deadline {
                panic!("condition not met within deadline");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn join_is_idempotent_per_channel() {
        let network = LocalNetwork::new();
        let registry = registry(&network);

        let first = registry.join("test", "a").await.unwrap();
        let second = registry.join("test", "a").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn view_tracks_joins_and_leaves_monotonically() {
        let network = LocalNetwork::new();
        let registry_a = registry(&network);
        let registry_b = registry(&network);

        let a = registry_a.join("test", "a").await.unwrap();
        wait_until(|| a.current_view().contains(&NodeId::new("a"))).await;
        let before = a.current_view().id();

        let b = registry_b.join("test", "b").await.unwrap();
        wait_until(|| a.current_view().contains(&NodeId::new("b"))).await;
        assert!(a.current_view().id() > before);
        assert!(a.is_member("b"));

        let with_b = a.current_view().id();
        registry_b.leave("test").await;
        wait_until(|| !a.current_view().contains(&NodeId::new("b"))).await;
        assert!(a.current_view().id() > with_b);
        assert!(!a.is_member("b"));

        drop(b);
        registry_a.shutdown_all().await;
    }

    #[tokio::test]
    async fn listeners_observe_increasing_view_ids() {
        struct Recorder {
            ids: Mutex<Vec<u64>>,
        }
        impl CoordinatorListener for Recorder {
            fn on_view_changed(&self, view: &Arc<ClusterView>) {
                self.ids.lock().push(view.id());
            }
        }

        let network = LocalNetwork::new();
        let registry_a = registry(&network);
        let registry_b = registry(&network);

        let a = registry_a.join("test", "a").await.unwrap();
        let recorder = Arc::new(Recorder {
            ids: Mutex::new(Vec::new()),
        });
        a.add_listener(recorder.clone());

        let _b = registry_b.join("test", "b").await.unwrap();
        wait_until(|| a.is_member("b")).await;
        registry_b.leave("test").await;
        wait_until(|| !a.is_member("b")).await;

        let ids = recorder.ids.lock().clone();
        assert!(!ids.is_empty());
        assert!(ids.windows(2).all(|w| w[0] < w[1]));

        registry_a.shutdown_all().await;
    }

    #[tokio::test]
    async fn fixed_rate_task_stops_after_cancel() {
        let network = LocalNetwork::new();
        let registry = registry(&network);
        let a = registry.join("test", "a").await.unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let task_count = count.clone();
        let handle = a.schedule_at_fixed_rate(Duration::from_millis(10), move || {
            task_count.fetch_add(1, Ordering::SeqCst);
        });

        wait_until(|| count.load(Ordering::SeqCst) >= 3).await;
        handle.cancel().await;
        assert!(handle.is_cancelled());

        let frozen = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), frozen);

        registry.shutdown_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_waits_for_an_invocation_in_flight() {
        let network = LocalNetwork::new();
        let registry = registry(&network);
        let a = registry.join("test", "a").await.unwrap();

        let in_flight = Arc::new(AtomicBool::new(false));
        let count = Arc::new(AtomicUsize::new(0));
        let task_flag = in_flight.clone();
        let task_count = count.clone();
        let handle = a.schedule_at_fixed_rate(Duration::from_millis(10), move || {
            task_flag.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            task_count.fetch_add(1, Ordering::SeqCst);
            task_flag.store(false, Ordering::SeqCst);
        });

        wait_until(|| in_flight.load(Ordering::SeqCst)).await;
        handle.cancel().await;

        // cancel returned only once the running invocation finished,
        // and no new one starts
        assert!(!in_flight.load(Ordering::SeqCst));
        let frozen = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), frozen);

        registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn shutdown_releases_listener_references() {
        struct Noop;
        impl CoordinatorListener for Noop {}

        let network = LocalNetwork::new();
        let registry = registry(&network);
        let a = registry.join("test", "a").await.unwrap();

        let listener = Arc::new(Noop);
        a.add_listener(listener.clone());
        assert_eq!(Arc::strong_count(&listener), 2);

        // Shutdown drops the listener list, so a listener that holds
        // the coordinator no longer forms a cycle
        a.shutdown().await;
        assert_eq!(Arc::strong_count(&listener), 1);
    }

    #[tokio::test]
    async fn shutdown_silences_listeners() {
        struct Counter {
            calls: AtomicUsize,
        }
        impl CoordinatorListener for Counter {
            fn on_view_changed(&self, _view: &Arc<ClusterView>) {
                self.calls.fetch_add(1, Ordering::SeqCst);
            }
        }

        let network = LocalNetwork::new();
        let registry_a = registry(&network);
        let registry_b = registry(&network);

        let a = registry_a.join("test", "a").await.unwrap();
        let counter = Arc::new(Counter {
            calls: AtomicUsize::new(0),
        });
        a.add_listener(counter.clone());

        a.shutdown().await;
        let frozen = counter.calls.load(Ordering::SeqCst);

        // New membership traffic after shutdown must not reach the listener
        let _b = registry_b.join("test", "b").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.calls.load(Ordering::SeqCst), frozen);

        registry_b.shutdown_all().await;
    }
}
