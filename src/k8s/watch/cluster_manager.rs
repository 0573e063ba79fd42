use super::informer::{Informer, InformerFactory};
use super::selector::LabelSelector;
use crate::error::{Error, Result};
use crate::k8s::transport::{ClusterTransport, ResourceClient, resource_key};
use kube::api::ApiResource;
use std::sync::Arc;
use tracing::{debug, warn};

/// One cluster's transport and shared informer factory. The only owner of
/// the connection; everything else borrows clients from it.
pub struct ClusterManager {
    name: String,
    transport: Arc<dyn ClusterTransport>,
    factory: InformerFactory,
}

impl ClusterManager {
    #[must_use]
    pub fn new(name: &str, transport: Arc<dyn ClusterTransport>) -> Self {
        Self {
            name: name.to_string(),
            factory: InformerFactory::new(name, transport.clone()),
            transport,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn transport(&self) -> Arc<dyn ClusterTransport> {
        self.transport.clone()
    }

    /// Shared informer for `resource`, after confirming the cluster serves it
    ///
    /// # Errors
    ///
    /// Returns `Error::KindNotServed` when discovery does not list the
    /// resource, or the discovery error itself
    pub async fn create_informer(
        &self,
        resource: &ApiResource,
        selector: Option<&LabelSelector>,
    ) -> Result<Arc<Informer>> {
        if let Some(discovery) = self.transport.discovery() {
            let served = discovery.is_served(resource).await.inspect_err(|e| {
                warn!(cluster = %self.name, resource = %resource_key(resource), error = %e, "Discovery failed");
            })?;
            if !served {
                return Err(Error::KindNotServed {
                    cluster: self.name.clone(),
                    resource: resource_key(resource),
                });
            }
        }

        debug!(cluster = %self.name, resource = %resource_key(resource), "Subscribing to resource");
        Ok(self.factory.for_resource(resource, selector))
    }

    /// Client acting as the process's own identity
    #[must_use]
    pub fn system_client(&self, resource: &ApiResource) -> Arc<dyn ResourceClient> {
        self.transport.client(resource)
    }

    /// Shut down every informer on this cluster; idempotent
    pub fn stop(&self) {
        self.factory.shutdown();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.factory.is_shut_down()
    }
}
