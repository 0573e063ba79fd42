use super::cluster_watcher::{ClientOptions, ClusterWatcher, Converter};
use super::data_store::{DataStore, Filter};
use super::manager::Manager;
use super::object::{EnvironmentWrapper, Object};
use super::selector::LabelSelector;
use crate::error::{Error, Result};
use crate::k8s::identity::RequestContext;
use crate::k8s::transport::{NamespacedClient, ResourceClient, resource_key};
use kube::Resource;
use kube::api::{ApiResource, DynamicObject};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A resource type that can be watched with the default resource kind and
/// the serde conversion fallback
pub trait Watchable: Resource<DynamicType = ()> + Object + DeserializeOwned + Debug {}

impl<K> Watchable for K where K: Resource<DynamicType = ()> + Object + DeserializeOwned + Debug {}

/// Callback invoked with the cluster and object after the store changes.
///
/// Hooks run synchronously on the informer task while the informer's index is
/// locked. Querying the watcher is fine, but a hook must not block or reach
/// back into the informer itself (`Informer::lookup`, `Informer::evict`),
/// which deadlocks.
pub type WatcherHook<K> = Arc<dyn Fn(&str, &K) + Send + Sync>;

/// Counts of store mutations applied by one watcher
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatcherStats {
    pub added: u64,
    pub updated: u64,
    pub removed: u64,
}

struct Hooks<K> {
    on_add: Option<WatcherHook<K>>,
    on_update: Option<WatcherHook<K>>,
    on_remove: Option<WatcherHook<K>>,
}

impl<K> Default for Hooks<K> {
    fn default() -> Self {
        Self {
            on_add: None,
            on_update: None,
            on_remove: None,
        }
    }
}

/// State shared by a watcher and all of its cluster feeds
pub(crate) struct WatcherCore<K> {
    store: DataStore<K>,
    hooks: RwLock<Hooks<K>>,
    added: AtomicU64,
    updated: AtomicU64,
    removed: AtomicU64,
    resource: String,
}

impl<K: Object> WatcherCore<K> {
    pub(crate) fn new(resource: &str) -> Self {
        Self {
            store: DataStore::new(),
            hooks: RwLock::new(Hooks::default()),
            added: AtomicU64::new(0),
            updated: AtomicU64::new(0),
            removed: AtomicU64::new(0),
            resource: resource.to_string(),
        }
    }

    pub(crate) const fn store(&self) -> &DataStore<K> {
        &self.store
    }

    fn hook(&self, pick: impl Fn(&Hooks<K>) -> Option<WatcherHook<K>>) -> Option<WatcherHook<K>> {
        pick(&self.hooks.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn set_hook(&self, set: impl FnOnce(&mut Hooks<K>)) {
        set(&mut self.hooks.write().unwrap_or_else(PoisonError::into_inner));
    }

    pub(crate) fn add(&self, cluster: &str, obj: K) {
        debug!(%cluster, resource = %self.resource, namespace = %obj.object_namespace(), name = %obj.object_name(), "Adding object");
        self.store.add(cluster, obj.clone());
        self.added.fetch_add(1, Ordering::Relaxed);
        if let Some(hook) = self.hook(|h| h.on_add.clone()) {
            hook(cluster, &obj);
        }
    }

    pub(crate) fn update(&self, cluster: &str, obj: K) {
        debug!(%cluster, resource = %self.resource, namespace = %obj.object_namespace(), name = %obj.object_name(), "Updating object");
        self.store.update(cluster, obj.clone());
        self.updated.fetch_add(1, Ordering::Relaxed);
        if let Some(hook) = self.hook(|h| h.on_update.clone()) {
            hook(cluster, &obj);
        }
    }

    pub(crate) fn remove_key(&self, cluster: &str, namespace: &str, name: &str) -> Option<K> {
        let removed = self.store.remove_key(cluster, namespace, name)?;
        debug!(%cluster, resource = %self.resource, %namespace, %name, "Removing object");
        self.removed.fetch_add(1, Ordering::Relaxed);
        if let Some(hook) = self.hook(|h| h.on_remove.clone()) {
            hook(cluster, &removed);
        }
        Some(removed)
    }

    fn stats(&self) -> WatcherStats {
        WatcherStats {
            added: self.added.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
        }
    }
}

/// How a watcher subscribes and converts objects
pub struct WatchOptions<K> {
    pub(crate) converter: Option<Converter<K>>,
    pub(crate) resource: Option<ApiResource>,
    pub(crate) label_selector: Option<LabelSelector>,
    pub(crate) quick_delete: bool,
}

impl<K> Default for WatchOptions<K> {
    fn default() -> Self {
        Self {
            converter: None,
            resource: None,
            label_selector: None,
            quick_delete: false,
        }
    }
}

impl<K> Clone for WatchOptions<K> {
    fn clone(&self) -> Self {
        Self {
            converter: self.converter.clone(),
            resource: self.resource.clone(),
            label_selector: self.label_selector.clone(),
            quick_delete: self.quick_delete,
        }
    }
}

impl<K> WatchOptions<K> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Convert raw objects with `converter` instead of deserializing them
    #[must_use]
    pub fn with_converter<F>(mut self, converter: F) -> Self
    where
        F: Fn(&DynamicObject, &str) -> Option<K> + Send + Sync + 'static,
    {
        self.converter = Some(Arc::new(converter));
        self
    }

    /// Watch `resource` instead of the kind `K` declares
    #[must_use]
    pub fn with_resource(mut self, resource: ApiResource) -> Self {
        self.resource = Some(resource);
        self
    }

    /// Only subscribe to objects matching `selector`; applied by the server
    #[must_use]
    pub fn with_label_selector(mut self, selector: LabelSelector) -> Self {
        self.label_selector = Some(selector);
        self
    }

    /// Purge deleted objects locally as soon as the remote delete succeeds
    #[must_use]
    pub const fn with_quick_delete(mut self, enabled: bool) -> Self {
        self.quick_delete = enabled;
        self
    }
}

/// One resource kind watched across every cluster of a `Manager`
pub struct Watcher<K> {
    watchers: Vec<ClusterWatcher<K>>,
    core: Arc<WatcherCore<K>>,
    resource: ApiResource,
}

impl<K: Watchable> Watcher<K> {
    pub(crate) async fn new(manager: &Manager, options: WatchOptions<K>) -> Self {
        let resource = options
            .resource
            .clone()
            .unwrap_or_else(|| ApiResource::erase::<K>(&()));
        let core = Arc::new(WatcherCore::new(&resource_key(&resource)));

        let mut watchers = Vec::new();
        for cluster in manager.cluster_managers() {
            let watcher = ClusterWatcher::new(
                cluster.clone(),
                core.clone(),
                &options,
                resource.clone(),
                &manager.options().reserved_namespace,
                manager.options().group_resolver.clone(),
            )
            .await;

            if let Some(informer) = watcher.informer() {
                manager.add_cache_sync(informer.synced_signal());
                watchers.push(watcher);
            }
        }

        info!(
            resource = %resource_key(&resource),
            clusters = watchers.len(),
            "📦 Created watcher"
        );
        Self {
            watchers,
            core,
            resource,
        }
    }
}

impl<K> Watcher<K>
where
    K: Object + DeserializeOwned,
{
    /// Launch one event loop per cluster; each runs until `cancel` fires
    pub fn start(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        info!(resource = %resource_key(&self.resource), clusters = self.watchers.len(), "🔍 Starting watcher");
        self.watchers
            .iter()
            .filter_map(|watcher| watcher.start(cancel))
            .collect()
    }

    /// True if at least one cluster serves the watched kind
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.watchers.iter().any(ClusterWatcher::is_registered)
    }

    /// Clusters this watcher observes
    #[must_use]
    pub fn clusters(&self) -> Vec<String> {
        self.watchers
            .iter()
            .map(|watcher| watcher.cluster().to_string())
            .collect()
    }

    #[must_use]
    pub const fn resource(&self) -> &ApiResource {
        &self.resource
    }

    #[must_use]
    pub fn stats(&self) -> WatcherStats {
        self.core.stats()
    }

    #[must_use]
    pub fn all(&self) -> Vec<EnvironmentWrapper<K>> {
        self.core.store().all()
    }

    /// # Errors
    ///
    /// Returns `Error::NotFound` if the object is not cached
    pub fn get(&self, cluster: &str, namespace: &str, name: &str) -> Result<K> {
        self.core.store().get(cluster, namespace, name)
    }

    #[must_use]
    pub fn get_by_cluster(&self, cluster: &str, filters: &[Filter]) -> Vec<EnvironmentWrapper<K>> {
        self.core.store().get_by_cluster(cluster, filters)
    }

    #[must_use]
    pub fn get_by_namespace(&self, namespace: &str, filters: &[Filter]) -> Vec<EnvironmentWrapper<K>> {
        self.core.store().get_by_namespace(namespace, filters)
    }

    fn cluster_watcher(&self, cluster: &str) -> Result<&ClusterWatcher<K>> {
        self.watchers
            .iter()
            .find(|watcher| watcher.cluster() == cluster)
            .ok_or_else(|| Error::NoWatcher {
                cluster: cluster.to_string(),
            })
    }

    /// Call `hook` after every stored add; see [`WatcherHook`] for what a
    /// hook may not do
    pub fn on_add(&self, hook: impl Fn(&str, &K) + Send + Sync + 'static) {
        let hook: WatcherHook<K> = Arc::new(hook);
        self.core.set_hook(|h| h.on_add = Some(hook));
    }

    /// Call `hook` after every stored update, under the same rules as
    /// [`Watcher::on_add`]
    pub fn on_update(&self, hook: impl Fn(&str, &K) + Send + Sync + 'static) {
        let hook: WatcherHook<K> = Arc::new(hook);
        self.core.set_hook(|h| h.on_update = Some(hook));
    }

    /// Call `hook` with the removed object, under the same rules as
    /// [`Watcher::on_add`]
    pub fn on_remove(&self, hook: impl Fn(&str, &K) + Send + Sync + 'static) {
        let hook: WatcherHook<K> = Arc::new(hook);
        self.core.set_hook(|h| h.on_remove = Some(hook));
    }

    /// Delete an object in `cluster` as the request's actor
    ///
    /// # Errors
    ///
    /// Returns `Error::NoWatcher` without contacting any cluster if `cluster`
    /// is not watched, otherwise the error from the cluster watcher
    pub async fn delete(&self, ctx: &RequestContext, cluster: &str, namespace: &str, name: &str) -> Result<()> {
        self.cluster_watcher(cluster)?
            .delete(ctx, namespace, name)
            .await
    }

    /// # Errors
    ///
    /// Returns `Error::NoWatcher` for an unknown cluster or the impersonation
    /// error
    pub async fn impersonated_client(
        &self,
        ctx: &RequestContext,
        cluster: &str,
        options: &ClientOptions,
    ) -> Result<Arc<dyn ResourceClient>> {
        self.cluster_watcher(cluster)?
            .impersonated_client(ctx, options)
            .await
    }

    /// # Errors
    ///
    /// Same as `impersonated_client`
    pub async fn impersonated_client_with_namespace(
        &self,
        ctx: &RequestContext,
        cluster: &str,
        namespace: &str,
        options: &ClientOptions,
    ) -> Result<NamespacedClient> {
        let client = self.impersonated_client(ctx, cluster, options).await?;
        Ok(NamespacedClient::new(client, namespace))
    }

    /// # Errors
    ///
    /// Returns `Error::NoWatcher` for an unknown cluster
    pub fn system_authenticated_client(
        &self,
        cluster: &str,
        options: &ClientOptions,
    ) -> Result<Arc<dyn ResourceClient>> {
        Ok(self
            .cluster_watcher(cluster)?
            .system_authenticated_client(options))
    }
}
