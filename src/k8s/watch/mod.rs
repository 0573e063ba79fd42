//! Multi-cluster watch-and-cache layer.
//!
//! A [`Manager`] connects to every configured cluster. [`watch`] creates a
//! [`Watcher`] for one resource kind, which keeps a cross-cluster cache fed by
//! one shared informer per cluster and routes mutations to the owning cluster
//! as the calling actor.
pub mod cluster_manager;
pub mod cluster_watcher;
pub mod config;
pub mod data_store;
pub mod informer;
pub mod manager;
pub mod object;
pub mod selector;
pub mod watcher;

pub use cluster_manager::ClusterManager;
pub use cluster_watcher::{ClientOptions, ClusterWatcher, Converter};
pub use config::{ClusterConfigMap, ClusterConnection, FleetConfig};
pub use data_store::{DataStore, Filter, in_cluster, with_labels, without_deleted};
pub use informer::{DeletedObject, Informer, InformerFactory, ObjectKey, ResourceEventHandler};
pub use manager::{Manager, ManagerOptions};
pub use object::{EnvironmentWrapper, Object, objects};
pub use selector::{LabelSelector, Requirement};
pub use watcher::{WatchOptions, Watchable, Watcher, WatcherHook, WatcherStats};

/// Create a watcher for `K` on every cluster of `manager`.
///
/// Clusters that do not serve the kind are skipped, so the watcher may end up
/// observing no cluster at all; it then answers every query with nothing.
pub async fn watch<K: Watchable>(manager: &Manager, options: WatchOptions<K>) -> Watcher<K> {
    Watcher::new(manager, options).await
}
