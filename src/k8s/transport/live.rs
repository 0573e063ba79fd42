use super::{ClusterTransport, Discovery, EventSource, EventStream, ResourceClient, resource_key};
use crate::error::{Error, Result};
use crate::k8s::client;
use crate::k8s::watch::config::ClusterConnection;
use crate::k8s::watch::selector::LabelSelector;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Client, Config, ResourceExt};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

/// Transport backed by a kube client for one remote or local cluster.
///
/// All resource kinds watched on the cluster share the client's connection
/// pool; impersonated clients are built per call from a copy of the config.
pub struct LiveTransport {
    cluster: String,
    client: Client,
    config: Config,
    discovery: Arc<LiveDiscovery>,
}

impl LiveTransport {
    /// Connect to a cluster described by `connection`
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be loaded or the client
    /// cannot be created
    pub async fn connect(cluster: &str, connection: &ClusterConnection) -> Result<Self> {
        let config = client::config_for(connection).await?;
        Self::from_config(cluster, config)
    }

    /// # Errors
    ///
    /// Returns an error if the client cannot be created from `config`
    pub fn from_config(cluster: &str, config: Config) -> Result<Self> {
        let client = client::new(config.clone())?;
        Ok(Self::from_parts(cluster, client, config))
    }

    /// Use an existing client; `config` is only consulted for impersonation
    #[must_use]
    pub fn from_parts(cluster: &str, client: Client, config: Config) -> Self {
        info!(%cluster, url = %config.cluster_url, "🔧 Created cluster transport");
        Self {
            cluster: cluster.to_string(),
            discovery: Arc::new(LiveDiscovery::new(cluster, client.clone())),
            client,
            config,
        }
    }

    #[must_use]
    pub fn kube_client(&self) -> Client {
        self.client.clone()
    }
}

impl ClusterTransport for LiveTransport {
    fn event_source(
        &self,
        resource: &ApiResource,
        label_selector: Option<&LabelSelector>,
    ) -> Arc<dyn EventSource> {
        let mut config = watcher::Config::default();
        if let Some(selector) = label_selector.filter(|s| !s.is_empty()) {
            config = config.labels(&selector.to_string());
        }
        Arc::new(LiveEventSource {
            api: Api::all_with(self.client.clone(), resource),
            config,
        })
    }

    fn discovery(&self) -> Option<Arc<dyn Discovery>> {
        Some(self.discovery.clone())
    }

    fn client(&self, resource: &ApiResource) -> Arc<dyn ResourceClient> {
        Arc::new(LiveClient {
            client: self.client.clone(),
            resource: resource.clone(),
        })
    }

    fn impersonated_client(
        &self,
        resource: &ApiResource,
        user: &str,
        groups: &[String],
    ) -> Result<Arc<dyn ResourceClient>> {
        debug!(cluster = %self.cluster, %user, ?groups, "Creating impersonated client");
        let config = client::impersonate(&self.config, user, groups)?;
        Ok(Arc::new(LiveClient {
            client: client::new(config)?,
            resource: resource.clone(),
        }))
    }
}

struct LiveEventSource {
    api: Api<DynamicObject>,
    config: watcher::Config,
}

impl EventSource for LiveEventSource {
    fn open(&self) -> EventStream {
        watcher(self.api.clone(), self.config.clone())
            .default_backoff()
            .map_err(Error::from)
            .boxed()
    }
}

/// Discovery with an in-memory cache of the resources served per group
/// version, so each is fetched from the API server at most once.
pub struct LiveDiscovery {
    cluster: String,
    client: Client,
    served: RwLock<HashMap<String, Vec<String>>>,
}

impl LiveDiscovery {
    #[must_use]
    pub fn new(cluster: &str, client: Client) -> Self {
        Self {
            cluster: cluster.to_string(),
            client,
            served: RwLock::new(HashMap::new()),
        }
    }

    fn cached(&self, api_version: &str) -> Option<Vec<String>> {
        self.served
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(api_version)
            .cloned()
    }
}

#[async_trait]
impl Discovery for LiveDiscovery {
    async fn is_served(&self, resource: &ApiResource) -> Result<bool> {
        if let Some(plurals) = self.cached(&resource.api_version) {
            return Ok(plurals.contains(&resource.plural));
        }

        let listed = if resource.group.is_empty() {
            self.client.list_core_api_resources(&resource.version).await
        } else {
            self.client
                .list_api_group_resources(&resource.api_version)
                .await
        };
        let plurals: Vec<String> = match listed {
            Ok(list) => list.resources.into_iter().map(|r| r.name).collect(),
            Err(kube::Error::Api(response)) if response.code == 404 => {
                debug!(cluster = %self.cluster, api_version = %resource.api_version, "Group version not served");
                Vec::new()
            }
            Err(e) => return Err(Error::remote(&self.cluster, "discovering resources", e.into())),
        };

        let served = plurals.contains(&resource.plural);
        debug!(cluster = %self.cluster, resource = %resource_key(resource), served, "Discovery lookup");
        self.served
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(resource.api_version.clone(), plurals);
        Ok(served)
    }
}

struct LiveClient {
    client: Client,
    resource: ApiResource,
}

impl LiveClient {
    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        if namespace.is_empty() {
            Api::all_with(self.client.clone(), &self.resource)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, &self.resource)
        }
    }
}

#[async_trait]
impl ResourceClient for LiveClient {
    async fn get(&self, namespace: &str, name: &str) -> Result<DynamicObject> {
        Ok(self.api(namespace).get(name).await?)
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<DynamicObject>> {
        let list = self
            .api(namespace.unwrap_or_default())
            .list(&ListParams::default())
            .await?;
        Ok(list.items)
    }

    async fn create(&self, namespace: &str, obj: &DynamicObject) -> Result<DynamicObject> {
        Ok(self
            .api(namespace)
            .create(&PostParams::default(), obj)
            .await?)
    }

    async fn replace(&self, namespace: &str, obj: &DynamicObject) -> Result<DynamicObject> {
        let name = obj.name_any();
        Ok(self
            .api(namespace)
            .replace(&name, &PostParams::default(), obj)
            .await?)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.api(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }
}
