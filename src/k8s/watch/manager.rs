/**
 * Multi-cluster manager
 *
 * Owns one ClusterManager per configured cluster and gates readiness on the
 * first sync of every informer a watcher registered.
 */
use super::cluster_manager::ClusterManager;
use super::config::{ClusterConfigMap, DEFAULT_RESERVED_NAMESPACE, FleetConfig};
use crate::error::{Error, Result};
use crate::k8s::identity::{GroupResolver, StaticGroupResolver};
use crate::k8s::transport::{ClusterTransport, LiveTransport, ResourceClient};
use futures::future::join_all;
use kube::api::ApiResource;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Settings shared by every watcher a manager creates
#[derive(Clone)]
pub struct ManagerOptions {
    /// Objects in this namespace are never surfaced
    pub reserved_namespace: String,
    /// Resolves `Impersonate-Group` memberships for mutating calls
    pub group_resolver: Arc<dyn GroupResolver>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            reserved_namespace: DEFAULT_RESERVED_NAMESPACE.to_string(),
            group_resolver: Arc::new(StaticGroupResolver::new()),
        }
    }
}

impl From<&FleetConfig> for ManagerOptions {
    fn from(config: &FleetConfig) -> Self {
        Self::default().with_reserved_namespace(config.reserved_namespace.clone())
    }
}

impl ManagerOptions {
    #[must_use]
    pub fn with_group_resolver(mut self, resolver: Arc<dyn GroupResolver>) -> Self {
        self.group_resolver = resolver;
        self
    }

    #[must_use]
    pub fn with_reserved_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.reserved_namespace = namespace.into();
        self
    }
}

pub struct Manager {
    managers: BTreeMap<String, Arc<ClusterManager>>,
    options: ManagerOptions,
    cache_syncs: Mutex<Vec<watch::Receiver<bool>>>,
    stopped: AtomicBool,
}

impl Manager {
    /// Connect to every cluster in `clusters`
    ///
    /// # Errors
    ///
    /// Returns the first cluster whose client cannot be created
    pub async fn new(clusters: &ClusterConfigMap, options: ManagerOptions) -> Result<Self> {
        let mut transports: BTreeMap<String, Arc<dyn ClusterTransport>> = BTreeMap::new();
        for (cluster, connection) in clusters {
            let transport = LiveTransport::connect(cluster, connection)
                .await
                .map_err(|e| Error::remote(cluster, "creating client", e))?;
            transports.insert(cluster.clone(), Arc::new(transport));
        }
        Ok(Self::with_transports(transports, options))
    }

    /// Build from ready transports, e.g. in-memory ones
    #[must_use]
    pub fn with_transports(
        transports: BTreeMap<String, Arc<dyn ClusterTransport>>,
        options: ManagerOptions,
    ) -> Self {
        let managers = transports
            .into_iter()
            .map(|(cluster, transport)| {
                let manager = Arc::new(ClusterManager::new(&cluster, transport));
                (cluster, manager)
            })
            .collect::<BTreeMap<_, _>>();
        info!(clusters = managers.len(), "🌐 Created cluster manager");

        Self {
            managers,
            options,
            cache_syncs: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn options(&self) -> &ManagerOptions {
        &self.options
    }

    /// Configured cluster names, sorted
    #[must_use]
    pub fn clusters(&self) -> Vec<String> {
        self.managers.keys().cloned().collect()
    }

    /// # Errors
    ///
    /// Returns `Error::UnknownCluster` if `cluster` is not configured
    pub fn cluster_manager(&self, cluster: &str) -> Result<Arc<ClusterManager>> {
        self.managers
            .get(cluster)
            .cloned()
            .ok_or_else(|| Error::UnknownCluster(cluster.to_string()))
    }

    pub(crate) fn cluster_managers(&self) -> impl Iterator<Item = &Arc<ClusterManager>> {
        self.managers.values()
    }

    /// System clients for `resource`, keyed by cluster
    #[must_use]
    pub fn system_clients(&self, resource: &ApiResource) -> BTreeMap<String, Arc<dyn ResourceClient>> {
        self.managers
            .iter()
            .map(|(cluster, manager)| (cluster.clone(), manager.system_client(resource)))
            .collect()
    }

    pub(crate) fn add_cache_sync(&self, synced: watch::Receiver<bool>) {
        self.cache_syncs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(synced);
    }

    /// Wait until every registered informer has synced. Returns `false` if
    /// `cancel` fires first or an informer is dropped before syncing.
    pub async fn wait_for_ready(&self, cancel: &CancellationToken) -> bool {
        let syncs = self
            .cache_syncs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let pending = syncs.len();

        let all_synced = join_all(syncs.into_iter().map(|mut synced| async move {
            let ready = synced.wait_for(|s| *s).await.is_ok();
            ready
        }));

        tokio::select! {
            biased;
            results = all_synced => {
                let ready = results.into_iter().all(|ok| ok);
                if ready {
                    info!(informers = pending, "✅ All informers synced");
                }
                ready
            }
            () = cancel.cancelled() => {
                warn!(informers = pending, "Cancelled while waiting for informers to sync");
                false
            }
        }
    }

    /// Shut down every informer on every cluster; calling again has no effect
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("🛑 Stopping all clusters");
        for manager in self.managers.values() {
            manager.stop();
        }
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}
