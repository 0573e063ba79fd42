//! The seam between the watch layer and a cluster's API server.
//!
//! Everything above this module talks to clusters through these traits only.
//! `live` backs them with a kube client, `fake` with an in-memory object set
//! for tests and local development.
use crate::error::Result;
use crate::k8s::watch::selector::LabelSelector;
use async_trait::async_trait;
use futures::stream::BoxStream;
use kube::api::{ApiResource, DynamicObject};
use kube::runtime::watcher::Event;
use std::sync::Arc;

pub mod fake;
pub mod live;

pub use fake::{FakeCall, FakeTransport};
pub use live::LiveTransport;

/// One watch notification for an untyped object
pub type RawEvent = Event<DynamicObject>;

pub type EventStream = BoxStream<'static, Result<RawEvent>>;

/// Produces the add/update/delete feed for one resource kind.
///
/// Every stream starts with a full list (`Init`, `InitApply`..., `InitDone`)
/// and then delivers changes. `open` is called again if a stream ends.
pub trait EventSource: Send + Sync {
    fn open(&self) -> EventStream;
}

/// Answers whether a cluster serves a group/version/resource
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn is_served(&self, resource: &ApiResource) -> Result<bool>;
}

/// Direct calls against one resource kind. An empty namespace addresses
/// cluster-scoped objects.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<DynamicObject>;
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<DynamicObject>>;
    async fn create(&self, namespace: &str, obj: &DynamicObject) -> Result<DynamicObject>;
    async fn replace(&self, namespace: &str, obj: &DynamicObject) -> Result<DynamicObject>;
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Connection to one cluster
pub trait ClusterTransport: Send + Sync {
    fn event_source(
        &self,
        resource: &ApiResource,
        label_selector: Option<&LabelSelector>,
    ) -> Arc<dyn EventSource>;

    /// `None` skips the served-kind check before subscribing
    fn discovery(&self) -> Option<Arc<dyn Discovery>>;

    /// Client running as the process's own identity
    fn client(&self, resource: &ApiResource) -> Arc<dyn ResourceClient>;

    /// Client whose calls are authorized as `user` with `groups`
    ///
    /// # Errors
    ///
    /// Returns an error if the identity cannot be encoded or the client
    /// cannot be built
    fn impersonated_client(
        &self,
        resource: &ApiResource,
        user: &str,
        groups: &[String],
    ) -> Result<Arc<dyn ResourceClient>>;

    /// Whether a remote delete is followed by a delete event on the feed
    fn delivers_delete_events(&self) -> bool {
        true
    }
}

/// A `ResourceClient` pinned to one namespace
#[derive(Clone)]
pub struct NamespacedClient {
    inner: Arc<dyn ResourceClient>,
    namespace: String,
}

impl NamespacedClient {
    #[must_use]
    pub fn new(inner: Arc<dyn ResourceClient>, namespace: impl Into<String>) -> Self {
        Self {
            inner,
            namespace: namespace.into(),
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// # Errors
    ///
    /// Propagates the underlying client error
    pub async fn get(&self, name: &str) -> Result<DynamicObject> {
        self.inner.get(&self.namespace, name).await
    }

    /// # Errors
    ///
    /// Propagates the underlying client error
    pub async fn list(&self) -> Result<Vec<DynamicObject>> {
        self.inner.list(Some(&self.namespace)).await
    }

    /// # Errors
    ///
    /// Propagates the underlying client error
    pub async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        self.inner.create(&self.namespace, obj).await
    }

    /// # Errors
    ///
    /// Propagates the underlying client error
    pub async fn replace(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        self.inner.replace(&self.namespace, obj).await
    }

    /// # Errors
    ///
    /// Propagates the underlying client error
    pub async fn delete(&self, name: &str) -> Result<()> {
        self.inner.delete(&self.namespace, name).await
    }
}

/// `apiVersion/plural`, e.g. `apps/v1/deployments` or `v1/pods`
#[must_use]
pub fn resource_key(resource: &ApiResource) -> String {
    format!("{}/{}", resource.api_version, resource.plural)
}
