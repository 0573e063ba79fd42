/**
 * Shared informers
 *
 * An informer consumes one event stream for a (cluster, resource kind,
 * selector) triple, keeps the last seen state of every object in an index and
 * fans each change out to its registered handlers. Informers are handed out
 * by a per-cluster factory so every watcher of the same kind shares one
 * stream. The stream stays open while at least one subscriber is attached.
 */
use super::config::{INITIAL_BACKOFF_SECONDS, MAX_BACKOFF_SECONDS, RESTART_DELAY_MILLIS};
use super::selector::LabelSelector;
use crate::k8s::transport::{ClusterTransport, EventSource, RawEvent, resource_key};
use futures::StreamExt;
use kube::ResourceExt;
use kube::api::{ApiResource, DynamicObject};
use kube::runtime::watcher::Event;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Namespace and name of an object; the namespace is empty for
/// cluster-scoped kinds
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    #[must_use]
    pub fn of(obj: &DynamicObject) -> Self {
        Self::new(obj.namespace().unwrap_or_default(), obj.name_any())
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Payload of a delete notification
#[derive(Debug, Clone)]
pub enum DeletedObject {
    /// The delete was observed directly
    Known(DynamicObject),
    /// The object vanished while the stream was relisting; `obj` is the last
    /// state the informer saw
    FinalStateUnknown { key: ObjectKey, obj: DynamicObject },
}

impl DeletedObject {
    #[must_use]
    pub const fn object(&self) -> &DynamicObject {
        match self {
            Self::Known(obj) | Self::FinalStateUnknown { obj, .. } => obj,
        }
    }

    #[must_use]
    pub fn into_object(self) -> DynamicObject {
        match self {
            Self::Known(obj) | Self::FinalStateUnknown { obj, .. } => obj,
        }
    }
}

/// Receives changes from an informer.
///
/// Handlers run on the informer's task while its index is locked; they must
/// not call back into the same informer, e.g. through `lookup` or `evict`.
pub trait ResourceEventHandler: Send + Sync {
    fn on_add(&self, obj: &DynamicObject, is_initial_list: bool);
    fn on_update(&self, old: &DynamicObject, new: &DynamicObject);
    fn on_delete(&self, deleted: DeletedObject);
}

#[derive(Default)]
struct InformerState {
    handlers: Vec<Arc<dyn ResourceEventHandler>>,
    index: HashMap<ObjectKey, DynamicObject>,
    // Keys seen since the last `Init`, while a relist is in progress
    relist: Option<HashSet<ObjectKey>>,
}

impl InformerState {
    fn upsert(&mut self, obj: DynamicObject, is_initial_list: bool) {
        let key = ObjectKey::of(&obj);
        if let Some(seen) = self.relist.as_mut() {
            seen.insert(key.clone());
        }
        match self.index.insert(key, obj.clone()) {
            Some(old) => self.handlers.iter().for_each(|h| h.on_update(&old, &obj)),
            None => self.handlers.iter().for_each(|h| h.on_add(&obj, is_initial_list)),
        }
    }

    fn delete(&mut self, deleted: &DeletedObject) {
        for handler in &self.handlers {
            handler.on_delete(deleted.clone());
        }
    }
}

#[derive(Default)]
struct Lifecycle {
    subscribers: usize,
    // Stop token and task of the open stream
    stream: Option<(CancellationToken, JoinHandle<()>)>,
}

/// One shared event stream and its object index
pub struct Informer {
    cluster: String,
    resource: String,
    source: Arc<dyn EventSource>,
    state: Mutex<InformerState>,
    synced: watch::Sender<bool>,
    lifecycle: Mutex<Lifecycle>,
    shutdown: CancellationToken,
}

impl Informer {
    #[must_use]
    pub fn new(
        cluster: &str,
        resource: &str,
        source: Arc<dyn EventSource>,
        shutdown: CancellationToken,
    ) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            cluster: cluster.to_string(),
            resource: resource.to_string(),
            source,
            state: Mutex::new(InformerState::default()),
            synced,
            lifecycle: Mutex::new(Lifecycle::default()),
            shutdown,
        }
    }

    fn lock(&self) -> MutexGuard<'_, InformerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a handler. Objects already in the index are replayed to it as
    /// adds before any further change is delivered.
    #[allow(clippy::significant_drop_tightening)]
    pub fn add_event_handler(&self, handler: Arc<dyn ResourceEventHandler>) {
        let mut state = self.lock();
        for obj in state.index.values() {
            handler.on_add(obj, true);
        }
        state.handlers.push(handler);
    }

    /// True once the first full list has been delivered
    #[must_use]
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Signal that flips to `true` on first sync
    #[must_use]
    pub fn synced_signal(&self) -> watch::Receiver<bool> {
        self.synced.subscribe()
    }

    /// True while at least one subscriber keeps the stream open
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.lifecycle().stream.is_some()
    }

    #[must_use]
    pub fn subscribers(&self) -> usize {
        self.lifecycle().subscribers
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn lookup(&self, namespace: &str, name: &str) -> Option<DynamicObject> {
        self.lock()
            .index
            .get(&ObjectKey::new(namespace, name))
            .cloned()
    }

    #[must_use]
    pub fn list(&self) -> Vec<DynamicObject> {
        self.lock().index.values().cloned().collect()
    }

    /// Drop an object from the index ahead of the stream and tell every
    /// handler it is gone. Returns the evicted object.
    #[allow(clippy::significant_drop_tightening)]
    pub fn evict(&self, namespace: &str, name: &str) -> Option<DynamicObject> {
        let mut state = self.lock();
        let obj = state.index.remove(&ObjectKey::new(namespace, name))?;
        debug!(cluster = %self.cluster, resource = %self.resource, %namespace, %name, "Evicted object from informer");
        state.delete(&DeletedObject::Known(obj.clone()));
        Some(obj)
    }

    /// Stay subscribed until `cancel` fires or the factory shuts down.
    ///
    /// The first subscriber opens the event stream. Later subscribers attach
    /// to it, and it is closed once the last one leaves.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.attach();

        tokio::select! {
            () = cancel.cancelled() => {}
            () = self.shutdown.cancelled() => {}
        }

        if let Some(stream) = self.detach() {
            if let Err(e) = stream.await {
                warn!(cluster = %self.cluster, resource = %self.resource, error = %e, "Event stream task failed");
            }
            info!(cluster = %self.cluster, resource = %self.resource, "🛑 Informer stopped");
        }
    }

    #[allow(clippy::significant_drop_tightening)]
    fn attach(self: &Arc<Self>) {
        let mut lifecycle = self.lifecycle();
        lifecycle.subscribers += 1;
        if lifecycle.stream.is_some() {
            debug!(cluster = %self.cluster, resource = %self.resource, subscribers = lifecycle.subscribers, "Attached to running informer");
            return;
        }

        info!(cluster = %self.cluster, resource = %self.resource, "🔍 Starting informer");
        let stop = self.shutdown.child_token();
        let informer = Arc::clone(self);
        let task = tokio::spawn({
            let stop = stop.clone();
            async move { informer.consume(stop).await }
        });
        lifecycle.stream = Some((stop, task));
    }

    // Returns the stream task to await when the last subscriber leaves
    fn detach(&self) -> Option<JoinHandle<()>> {
        let mut lifecycle = self.lifecycle();
        lifecycle.subscribers = lifecycle.subscribers.saturating_sub(1);
        if lifecycle.subscribers > 0 {
            debug!(cluster = %self.cluster, resource = %self.resource, subscribers = lifecycle.subscribers, "Detached from informer");
            return None;
        }
        let (stop, task) = lifecycle.stream.take()?;
        stop.cancel();
        Some(task)
    }

    // Read the event stream until `stop`, reopening it with backoff whenever
    // it ends
    async fn consume(&self, stop: CancellationToken) {
        let mut backoff_seconds = INITIAL_BACKOFF_SECONDS;
        loop {
            let mut stream = self.source.open();
            let mut delivered = false;

            loop {
                let next = tokio::select! {
                    biased;
                    () = stop.cancelled() => return,
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(event)) => {
                        delivered = true;
                        self.handle(event);
                    }
                    Some(Err(e)) => {
                        warn!(cluster = %self.cluster, resource = %self.resource, error = %e, "Event stream error");
                    }
                    None => break,
                }
            }

            let delay = if delivered {
                backoff_seconds = INITIAL_BACKOFF_SECONDS;
                Duration::from_millis(RESTART_DELAY_MILLIS)
            } else {
                let delay = Duration::from_secs(backoff_seconds);
                backoff_seconds = (backoff_seconds * 2).min(MAX_BACKOFF_SECONDS);
                delay
            };
            warn!(
                cluster = %self.cluster,
                resource = %self.resource,
                "🔄 Event stream ended, restarting in {}ms",
                delay.as_millis()
            );

            tokio::select! {
                biased;
                () = stop.cancelled() => return,
                () = sleep(delay) => {}
            }
        }
    }

    fn handle(&self, event: RawEvent) {
        let mut state = self.lock();
        match event {
            Event::Init => {
                debug!(cluster = %self.cluster, resource = %self.resource, "Relisting");
                state.relist = Some(HashSet::new());
            }
            Event::InitApply(obj) => state.upsert(obj, true),
            Event::Apply(obj) => state.upsert(obj, false),
            Event::InitDone => {
                if let Some(seen) = state.relist.take() {
                    let stale: Vec<ObjectKey> = state
                        .index
                        .keys()
                        .filter(|key| !seen.contains(*key))
                        .cloned()
                        .collect();
                    for key in stale {
                        if let Some(obj) = state.index.remove(&key) {
                            debug!(cluster = %self.cluster, resource = %self.resource, %key, "Object vanished during relist");
                            state.delete(&DeletedObject::FinalStateUnknown { key, obj });
                        }
                    }
                }
                drop(state);
                if !self.synced.send_replace(true) {
                    info!(cluster = %self.cluster, resource = %self.resource, "✅ Informer synced");
                }
            }
            Event::Delete(obj) => {
                let key = ObjectKey::of(&obj);
                state.index.remove(&key);
                state.delete(&DeletedObject::Known(obj));
            }
        }
    }
}

/// Hands out one shared informer per resource kind and selector on a cluster
pub struct InformerFactory {
    cluster: String,
    transport: Arc<dyn ClusterTransport>,
    informers: Mutex<HashMap<String, Arc<Informer>>>,
    shutdown: CancellationToken,
}

impl InformerFactory {
    #[must_use]
    pub fn new(cluster: &str, transport: Arc<dyn ClusterTransport>) -> Self {
        Self {
            cluster: cluster.to_string(),
            transport,
            informers: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// The shared informer for `resource` and `selector`, created on first use
    #[must_use]
    pub fn for_resource(
        &self,
        resource: &ApiResource,
        selector: Option<&LabelSelector>,
    ) -> Arc<Informer> {
        let selector = selector.filter(|s| !s.is_empty());
        let name = resource_key(resource);
        let key = match selector {
            Some(selector) => format!("{name}?{selector}"),
            None => name.clone(),
        };

        self.informers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_insert_with(|| {
                debug!(cluster = %self.cluster, resource = %name, "Creating shared informer");
                Arc::new(Informer::new(
                    &self.cluster,
                    &name,
                    self.transport.event_source(resource, selector),
                    self.shutdown.child_token(),
                ))
            })
            .clone()
    }

    /// Stop every informer handed out so far; calling again has no effect
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!(cluster = %self.cluster, "🛑 Shutting down informer factory");
            self.shutdown.cancel();
        }
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.informers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
