use super::cluster_manager::ClusterManager;
use super::informer::{DeletedObject, Informer, ObjectKey, ResourceEventHandler};
use super::object::Object;
use super::watcher::{WatchOptions, WatcherCore};
use crate::error::{Error, Result};
use crate::k8s::identity::{GroupResolver, RequestContext};
use crate::k8s::transport::{ResourceClient, resource_key};
use k8s_openapi::serde_json;
use kube::api::{ApiResource, DynamicObject};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Turns a raw object from `cluster` into the watched type; `None` skips it
pub type Converter<K> = Arc<dyn Fn(&DynamicObject, &str) -> Option<K> + Send + Sync>;

/// Options for clients handed out by a watcher
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Target another resource kind than the one being watched
    pub resource: Option<ApiResource>,
}

impl ClientOptions {
    #[must_use]
    pub fn with_resource(resource: ApiResource) -> Self {
        Self {
            resource: Some(resource),
        }
    }
}

/// Informer handler that converts raw objects and feeds a watcher's store
pub(crate) struct ClusterFeed<K> {
    cluster: String,
    core: Arc<WatcherCore<K>>,
    converter: Option<Converter<K>>,
    reserved_namespace: String,
}

impl<K> ClusterFeed<K>
where
    K: Object + DeserializeOwned,
{
    fn reserved(&self, namespace: Option<&str>) -> bool {
        namespace == Some(self.reserved_namespace.as_str())
    }

    fn convert(&self, raw: &DynamicObject) -> Option<K> {
        if self.reserved(raw.metadata.namespace.as_deref()) {
            return None;
        }

        if let Some(converter) = &self.converter {
            let converted = (**converter)(raw, &self.cluster);
            if converted.is_none() {
                debug!(cluster = %self.cluster, key = %ObjectKey::of(raw), "Converter skipped object");
            }
            return converted;
        }

        match serde_json::to_value(raw).and_then(serde_json::from_value) {
            Ok(obj) => Some(obj),
            Err(e) => {
                warn!(
                    cluster = %self.cluster,
                    key = %ObjectKey::of(raw),
                    target = std::any::type_name::<K>(),
                    error = %e,
                    "Dropping object that failed to convert"
                );
                None
            }
        }
    }

    // A state that no longer converts must not leave the previous one behind
    fn forget(&self, raw: &DynamicObject) {
        let key = ObjectKey::of(raw);
        if self.core.remove_key(&self.cluster, &key.namespace, &key.name).is_some() {
            debug!(cluster = %self.cluster, %key, "Dropped stale object after failed conversion");
        }
    }
}

impl<K> ResourceEventHandler for ClusterFeed<K>
where
    K: Object + DeserializeOwned,
{
    fn on_add(&self, obj: &DynamicObject, _is_initial_list: bool) {
        match self.convert(obj) {
            Some(converted) => self.core.add(&self.cluster, converted),
            None => self.forget(obj),
        }
    }

    fn on_update(&self, _old: &DynamicObject, new: &DynamicObject) {
        match self.convert(new) {
            Some(converted) => self.core.update(&self.cluster, converted),
            None => self.forget(new),
        }
    }

    fn on_delete(&self, deleted: DeletedObject) {
        let obj = deleted.into_object();
        if self.reserved(obj.metadata.namespace.as_deref()) {
            return;
        }
        // Keyed removal, so an object that no longer converts still leaves
        let key = ObjectKey::of(&obj);
        self.core.remove_key(&self.cluster, &key.namespace, &key.name);
    }
}

/// One watched resource kind on one cluster.
///
/// If the cluster does not serve the kind the watcher is still constructed,
/// but stays unregistered: it never starts and holds no objects.
pub struct ClusterWatcher<K> {
    cluster: String,
    manager: Arc<ClusterManager>,
    informer: Option<Arc<Informer>>,
    resource: ApiResource,
    feed: Arc<ClusterFeed<K>>,
    quick_delete: bool,
    group_resolver: Arc<dyn GroupResolver>,
}

impl<K> ClusterWatcher<K>
where
    K: Object + DeserializeOwned,
{
    pub(crate) async fn new(
        manager: Arc<ClusterManager>,
        core: Arc<WatcherCore<K>>,
        options: &WatchOptions<K>,
        resource: ApiResource,
        reserved_namespace: &str,
        group_resolver: Arc<dyn GroupResolver>,
    ) -> Self {
        let cluster = manager.name().to_string();
        let feed = Arc::new(ClusterFeed {
            cluster: cluster.clone(),
            core,
            converter: options.converter.clone(),
            reserved_namespace: reserved_namespace.to_string(),
        });

        let informer = match manager
            .create_informer(&resource, options.label_selector.as_ref())
            .await
        {
            Ok(informer) => {
                informer.add_event_handler(feed.clone());
                Some(informer)
            }
            Err(e) => {
                error!(%cluster, resource = %resource_key(&resource), error = %e, "❌ Creating informer");
                None
            }
        };

        Self {
            cluster,
            manager,
            informer,
            resource,
            feed,
            quick_delete: options.quick_delete,
            group_resolver,
        }
    }

    #[must_use]
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    #[must_use]
    pub const fn is_registered(&self) -> bool {
        self.informer.is_some()
    }

    #[must_use]
    pub fn informer(&self) -> Option<&Arc<Informer>> {
        self.informer.as_ref()
    }

    /// Run the event loop until `cancel` fires; unregistered watchers do nothing
    #[must_use]
    pub fn start(&self, cancel: &CancellationToken) -> Option<JoinHandle<()>> {
        let informer = self.informer.clone()?;
        let cancel = cancel.clone();
        Some(tokio::spawn(async move { informer.run(cancel).await }))
    }

    pub fn on_add(&self, obj: &DynamicObject) {
        self.feed.on_add(obj, false);
    }

    pub fn on_update(&self, old: &DynamicObject, new: &DynamicObject) {
        self.feed.on_update(old, new);
    }

    pub fn on_delete(&self, deleted: DeletedObject) {
        self.feed.on_delete(deleted);
    }

    /// Delete an object on the cluster as the calling actor
    ///
    /// # Errors
    ///
    /// Returns an error if the actor cannot be impersonated or the remote
    /// delete fails; the local cache is left untouched in that case
    pub async fn delete(&self, ctx: &RequestContext, namespace: &str, name: &str) -> Result<()> {
        let client = self
            .impersonated_client(ctx, &ClientOptions::default())
            .await?;
        if self.quick_delete {
            self.remote_delete(client.as_ref(), namespace, name).await?;
            info!(cluster = %self.cluster, %namespace, %name, "Using quick delete");
            self.purge(namespace, name, None);
            return Ok(());
        }

        if !self.manager.transport().delivers_delete_events() {
            let existing = client.get(namespace, name).await.ok();
            self.remote_delete(client.as_ref(), namespace, name).await?;
            self.purge(namespace, name, existing);
            return Ok(());
        }

        self.remote_delete(client.as_ref(), namespace, name).await
    }

    async fn remote_delete(&self, client: &dyn ResourceClient, namespace: &str, name: &str) -> Result<()> {
        client
            .delete(namespace, name)
            .await
            .map_err(|e| Error::remote(&self.cluster, "deleting object", e))
    }

    // Remove an object locally without waiting for the event stream
    fn purge(&self, namespace: &str, name: &str, last_known: Option<DynamicObject>) {
        let evicted = self
            .informer
            .as_ref()
            .and_then(|informer| informer.evict(namespace, name));
        if evicted.is_some() {
            return;
        }
        match last_known {
            Some(obj) => self.feed.on_delete(DeletedObject::Known(obj)),
            None => {
                self.feed.core.remove_key(&self.cluster, namespace, name);
            }
        }
    }

    /// Client for this cluster authorized as the request's actor and the
    /// groups it belongs to
    ///
    /// # Errors
    ///
    /// Returns `Error::Unauthenticated` without an actor,
    /// `Error::GroupResolution` if memberships cannot be listed, or the
    /// client construction error
    pub async fn impersonated_client(
        &self,
        ctx: &RequestContext,
        options: &ClientOptions,
    ) -> Result<Arc<dyn ResourceClient>> {
        let actor = ctx.actor()?;
        let groups = self
            .group_resolver
            .groups_for(actor)
            .await
            .map_err(|e| Error::GroupResolution {
                user: actor.identity.clone(),
                reason: e.to_string(),
            })?;

        let resource = options.resource.as_ref().unwrap_or(&self.resource);
        self.manager
            .transport()
            .impersonated_client(resource, &actor.identity, &groups)
    }

    /// Client for this cluster using the process's own credentials
    #[must_use]
    pub fn system_authenticated_client(&self, options: &ClientOptions) -> Arc<dyn ResourceClient> {
        let resource = options.resource.as_ref().unwrap_or(&self.resource);
        self.manager.system_client(resource)
    }

    #[must_use]
    pub fn resource(&self) -> &ApiResource {
        &self.resource
    }
}
