//! In-memory cluster transport.
//!
//! Objects live in a map keyed by resource kind; every event source opened
//! against it gets a full initial list followed by live changes. Like the
//! kube fake clients it is modelled on, a delete issued through a client is
//! not echoed back on the feed unless `with_delete_events(true)` is set.
use super::{ClusterTransport, Discovery, EventSource, EventStream, RawEvent, ResourceClient, resource_key};
use crate::error::{Error, Result};
use crate::k8s::watch::selector::LabelSelector;
use async_trait::async_trait;
use futures::{StreamExt, stream};
use k8s_openapi::serde_json;
use kube::api::{ApiResource, DynamicObject};
use kube::error::ErrorResponse;
use kube::runtime::watcher::Event;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

type ObjectMap = BTreeMap<String, BTreeMap<(String, String), DynamicObject>>;

/// A mutation that reached the in-memory cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeCall {
    pub action: &'static str,
    pub resource: String,
    pub namespace: String,
    pub name: String,
    /// Impersonated user, `None` for system calls
    pub user: Option<String>,
    pub groups: Vec<String>,
}

struct Subscriber {
    resource: String,
    selector: Option<LabelSelector>,
    tx: mpsc::UnboundedSender<RawEvent>,
}

impl Subscriber {
    fn wants(&self, resource: &str, obj: &DynamicObject) -> bool {
        self.resource == resource
            && self
                .selector
                .as_ref()
                .is_none_or(|s| s.matches(obj.labels()))
    }
}

#[derive(Default)]
struct State {
    objects: ObjectMap,
    subscribers: Vec<Subscriber>,
    calls: Vec<FakeCall>,
}

impl State {
    fn broadcast(&mut self, resource: &str, event: &RawEvent) {
        let obj = match event {
            Event::Apply(obj) | Event::Delete(obj) | Event::InitApply(obj) => obj,
            Event::Init | Event::InitDone => return,
        };
        self.subscribers.retain(|s| !s.tx.is_closed());
        for subscriber in self.subscribers.iter().filter(|s| s.wants(resource, obj)) {
            let _ = subscriber.tx.send(event.clone());
        }
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    resource_version: AtomicU64,
    delete_events: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_version(&self) -> String {
        (self.resource_version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }
}

/// In-memory cluster. Cloning shares the same object set.
#[derive(Clone, Default)]
pub struct FakeTransport {
    shared: Arc<Shared>,
    served: Option<Arc<HashSet<String>>>,
}

impl FakeTransport {
    /// Transport without discovery; every kind is accepted
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable discovery, serving `resource` in addition to any kinds already
    /// registered this way
    #[must_use]
    pub fn serving(mut self, resource: &ApiResource) -> Self {
        let mut served = self.served.as_deref().cloned().unwrap_or_default();
        served.insert(resource_key(resource));
        self.served = Some(Arc::new(served));
        self
    }

    /// Echo client deletes as delete events on the feed
    #[must_use]
    pub fn with_delete_events(self, enabled: bool) -> Self {
        self.shared.delete_events.store(enabled, Ordering::SeqCst);
        self
    }

    /// Insert or replace a typed object and notify watchers
    ///
    /// # Errors
    ///
    /// Returns an error if the object cannot be represented as a dynamic object
    pub fn seed<K>(&self, obj: &K) -> Result<()>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let resource = ApiResource::erase::<K>(&());
        let dynamic: DynamicObject = serde_json::from_value(serde_json::to_value(obj)?)?;
        self.apply(&resource, dynamic);
        Ok(())
    }

    /// Insert or replace an object as if changed on the server
    pub fn apply(&self, resource: &ApiResource, mut obj: DynamicObject) {
        let key = resource_key(resource);
        let id = (obj.namespace().unwrap_or_default(), obj.name_any());
        obj.metadata.resource_version = Some(self.shared.next_version());
        if obj.metadata.uid.is_none() {
            obj.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        }

        let mut state = self.shared.lock();
        state
            .objects
            .entry(key.clone())
            .or_default()
            .insert(id, obj.clone());
        state.broadcast(&key, &Event::Apply(obj));
    }

    /// Remove an object as if deleted on the server; always notifies watchers
    pub fn remove(&self, resource: &ApiResource, namespace: &str, name: &str) -> Option<DynamicObject> {
        let key = resource_key(resource);
        let mut state = self.shared.lock();
        let removed = state
            .objects
            .get_mut(&key)
            .and_then(|objects| objects.remove(&(namespace.to_string(), name.to_string())));
        if let Some(obj) = &removed {
            state.broadcast(&key, &Event::Delete(obj.clone()));
        }
        removed
    }

    #[must_use]
    pub fn contains(&self, resource: &ApiResource, namespace: &str, name: &str) -> bool {
        self.shared
            .lock()
            .objects
            .get(&resource_key(resource))
            .is_some_and(|objects| objects.contains_key(&(namespace.to_string(), name.to_string())))
    }

    /// Every mutation issued through a client, oldest first
    #[must_use]
    pub fn calls(&self) -> Vec<FakeCall> {
        self.shared.lock().calls.clone()
    }

    fn client_for(&self, resource: &ApiResource, identity: Option<(&str, &[String])>) -> Arc<dyn ResourceClient> {
        Arc::new(FakeClient {
            shared: self.shared.clone(),
            resource: resource_key(resource),
            user: identity.map(|(user, _)| user.to_string()),
            groups: identity.map(|(_, groups)| groups.to_vec()).unwrap_or_default(),
        })
    }
}

impl ClusterTransport for FakeTransport {
    fn event_source(
        &self,
        resource: &ApiResource,
        label_selector: Option<&LabelSelector>,
    ) -> Arc<dyn EventSource> {
        Arc::new(FakeEventSource {
            shared: self.shared.clone(),
            resource: resource_key(resource),
            selector: label_selector.filter(|s| !s.is_empty()).cloned(),
        })
    }

    fn discovery(&self) -> Option<Arc<dyn Discovery>> {
        self.served.clone().map(|served| Arc::new(FakeDiscovery { served }) as Arc<dyn Discovery>)
    }

    fn client(&self, resource: &ApiResource) -> Arc<dyn ResourceClient> {
        self.client_for(resource, None)
    }

    fn impersonated_client(
        &self,
        resource: &ApiResource,
        user: &str,
        groups: &[String],
    ) -> Result<Arc<dyn ResourceClient>> {
        warn!(%user, ?groups, "Impersonation is not enforced by the in-memory transport");
        Ok(self.client_for(resource, Some((user, groups))))
    }

    fn delivers_delete_events(&self) -> bool {
        self.shared.delete_events.load(Ordering::SeqCst)
    }
}

struct FakeDiscovery {
    served: Arc<HashSet<String>>,
}

#[async_trait]
impl Discovery for FakeDiscovery {
    async fn is_served(&self, resource: &ApiResource) -> Result<bool> {
        Ok(self.served.contains(&resource_key(resource)))
    }
}

struct FakeEventSource {
    shared: Arc<Shared>,
    resource: String,
    selector: Option<LabelSelector>,
}

impl EventSource for FakeEventSource {
    #[allow(clippy::significant_drop_tightening)]
    fn open(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriber = Subscriber {
            resource: self.resource.clone(),
            selector: self.selector.clone(),
            tx,
        };

        let mut initial = vec![Event::Init];
        {
            let mut state = self.shared.lock();
            if let Some(objects) = state.objects.get(&self.resource) {
                initial.extend(
                    objects
                        .values()
                        .filter(|obj| subscriber.wants(&self.resource, obj))
                        .cloned()
                        .map(Event::InitApply),
                );
            }
            state.subscribers.push(subscriber);
        }
        initial.push(Event::InitDone);
        debug!(resource = %self.resource, objects = initial.len() - 2, "Opened in-memory event stream");

        stream::iter(initial)
            .chain(UnboundedReceiverStream::new(rx))
            .map(Ok)
            .boxed()
    }
}

struct FakeClient {
    shared: Arc<Shared>,
    resource: String,
    user: Option<String>,
    groups: Vec<String>,
}

impl FakeClient {
    fn record(&self, state: &mut State, action: &'static str, namespace: &str, name: &str) {
        state.calls.push(FakeCall {
            action,
            resource: self.resource.clone(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            user: self.user.clone(),
            groups: self.groups.clone(),
        });
    }
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::Kube(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

fn not_found(resource: &str, namespace: &str, name: &str) -> Error {
    api_error(404, "NotFound", format!("{resource} {namespace}/{name} not found"))
}

#[async_trait]
impl ResourceClient for FakeClient {
    async fn get(&self, namespace: &str, name: &str) -> Result<DynamicObject> {
        self.shared
            .lock()
            .objects
            .get(&self.resource)
            .and_then(|objects| objects.get(&(namespace.to_string(), name.to_string())))
            .cloned()
            .ok_or_else(|| not_found(&self.resource, namespace, name))
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<DynamicObject>> {
        Ok(self
            .shared
            .lock()
            .objects
            .get(&self.resource)
            .map(|objects| {
                objects
                    .iter()
                    .filter(|((ns, _), _)| namespace.is_none_or(|want| want == ns))
                    .map(|(_, obj)| obj.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    #[allow(clippy::significant_drop_tightening)]
    async fn create(&self, namespace: &str, obj: &DynamicObject) -> Result<DynamicObject> {
        let name = obj.name_any();
        let mut created = obj.clone();
        created.metadata.namespace = (!namespace.is_empty()).then(|| namespace.to_string());
        created.metadata.resource_version = Some(self.shared.next_version());
        created.metadata.uid = Some(uuid::Uuid::new_v4().to_string());

        let mut state = self.shared.lock();
        let objects = state.objects.entry(self.resource.clone()).or_default();
        let id = (namespace.to_string(), name.clone());
        if objects.contains_key(&id) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("{} {namespace}/{name} already exists", self.resource),
            ));
        }
        objects.insert(id, created.clone());
        self.record(&mut state, "create", namespace, &name);
        state.broadcast(&self.resource, &Event::Apply(created.clone()));
        Ok(created)
    }

    #[allow(clippy::significant_drop_tightening)]
    async fn replace(&self, namespace: &str, obj: &DynamicObject) -> Result<DynamicObject> {
        let name = obj.name_any();
        let mut replaced = obj.clone();
        replaced.metadata.resource_version = Some(self.shared.next_version());

        let mut state = self.shared.lock();
        let id = (namespace.to_string(), name.clone());
        let Some(existing) = state
            .objects
            .get_mut(&self.resource)
            .and_then(|objects| objects.get_mut(&id))
        else {
            return Err(not_found(&self.resource, namespace, &name));
        };
        replaced.metadata.uid.clone_from(&existing.metadata.uid);
        *existing = replaced.clone();
        self.record(&mut state, "replace", namespace, &name);
        state.broadcast(&self.resource, &Event::Apply(replaced.clone()));
        Ok(replaced)
    }

    #[allow(clippy::significant_drop_tightening)]
    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.shared.lock();
        let removed = state
            .objects
            .get_mut(&self.resource)
            .and_then(|objects| objects.remove(&(namespace.to_string(), name.to_string())))
            .ok_or_else(|| not_found(&self.resource, namespace, name))?;
        self.record(&mut state, "delete", namespace, name);
        if self.shared.delete_events.load(Ordering::SeqCst) {
            state.broadcast(&self.resource, &Event::Delete(removed));
        }
        Ok(())
    }
}
