use super::object::{EnvironmentWrapper, Object};
use super::selector::LabelSelector;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Narrows a listing. Filters compose; an empty filter list returns
/// everything in scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Labels(LabelSelector),
    InCluster(String),
    WithoutDeleted,
}

/// Keep objects whose labels match `selector`
#[must_use]
pub const fn with_labels(selector: LabelSelector) -> Filter {
    Filter::Labels(selector)
}

/// Restrict to `cluster`; several `in_cluster` filters form an allow-list
#[must_use]
pub fn in_cluster(cluster: impl Into<String>) -> Filter {
    Filter::InCluster(cluster.into())
}

/// Drop objects that carry a deletion timestamp
#[must_use]
pub const fn without_deleted() -> Filter {
    Filter::WithoutDeleted
}

#[derive(Default)]
struct FilterOptions<'a> {
    selectors: Vec<&'a LabelSelector>,
    clusters: Vec<&'a str>,
    without_deleted: bool,
}

impl<'a> FilterOptions<'a> {
    fn new(filters: &'a [Filter]) -> Self {
        let mut opts = Self::default();
        for filter in filters {
            match filter {
                Filter::Labels(selector) => opts.selectors.push(selector),
                Filter::InCluster(cluster) => opts.clusters.push(cluster),
                Filter::WithoutDeleted => opts.without_deleted = true,
            }
        }
        opts
    }

    fn cluster_allowed(&self, cluster: &str) -> bool {
        self.clusters.is_empty() || self.clusters.contains(&cluster)
    }

    fn admits<K: Object>(&self, obj: &K) -> bool {
        if self.without_deleted && obj.is_deleting() {
            return false;
        }
        let labels = obj.object_labels();
        self.selectors.iter().all(|s| s.matches(labels))
    }
}

type NamespaceIndex<K> = BTreeMap<String, BTreeMap<String, K>>;

/// Concurrent cache of one resource kind across clusters, indexed
/// cluster -> namespace -> name. Mutated only by watch events; every read
/// returns an owned snapshot.
#[derive(Debug)]
pub struct DataStore<K> {
    index: RwLock<BTreeMap<String, NamespaceIndex<K>>>,
}

impl<K> Default for DataStore<K> {
    fn default() -> Self {
        Self {
            index: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<K: Object> DataStore<K> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, NamespaceIndex<K>>> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, NamespaceIndex<K>>> {
        self.index.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, cluster: &str, obj: K) {
        self.upsert(cluster, obj);
    }

    /// Replaces whatever is stored under the object's key
    pub fn update(&self, cluster: &str, obj: K) {
        self.upsert(cluster, obj);
    }

    fn upsert(&self, cluster: &str, obj: K) {
        let namespace = obj.object_namespace();
        let name = obj.object_name();
        self.write()
            .entry(cluster.to_string())
            .or_default()
            .entry(namespace)
            .or_default()
            .insert(name, obj);
    }

    pub fn remove(&self, cluster: &str, obj: &K) -> Option<K> {
        self.remove_key(cluster, &obj.object_namespace(), &obj.object_name())
    }

    #[allow(clippy::significant_drop_tightening)]
    pub fn remove_key(&self, cluster: &str, namespace: &str, name: &str) -> Option<K> {
        let mut index = self.write();
        let namespaces = index.get_mut(cluster)?;
        let names = namespaces.get_mut(namespace)?;
        let removed = names.remove(name);
        if names.is_empty() {
            namespaces.remove(namespace);
        }
        if namespaces.is_empty() {
            index.remove(cluster);
        }
        removed
    }

    /// # Errors
    ///
    /// Returns `Error::NotFound` carrying the key when nothing is stored
    pub fn get(&self, cluster: &str, namespace: &str, name: &str) -> Result<K> {
        self.read()
            .get(cluster)
            .and_then(|namespaces| namespaces.get(namespace))
            .and_then(|names| names.get(name))
            .cloned()
            .ok_or_else(|| Error::not_found(cluster, namespace, name))
    }

    /// Every stored object, ordered by cluster, namespace and name
    #[must_use]
    pub fn all(&self) -> Vec<EnvironmentWrapper<K>> {
        self.read()
            .iter()
            .flat_map(|(cluster, namespaces)| {
                namespaces
                    .values()
                    .flat_map(BTreeMap::values)
                    .map(move |obj| EnvironmentWrapper::new(cluster.clone(), obj.clone()))
            })
            .collect()
    }

    /// Objects in one cluster, ordered by name
    #[must_use]
    pub fn get_by_cluster(&self, cluster: &str, filters: &[Filter]) -> Vec<EnvironmentWrapper<K>> {
        let opts = FilterOptions::new(filters);
        if !opts.cluster_allowed(cluster) {
            return Vec::new();
        }

        let mut ret: Vec<EnvironmentWrapper<K>> = self
            .read()
            .get(cluster)
            .map(|namespaces| {
                namespaces
                    .values()
                    .flat_map(BTreeMap::values)
                    .filter(|obj| opts.admits(*obj))
                    .map(|obj| EnvironmentWrapper::new(cluster, obj.clone()))
                    .collect()
            })
            .unwrap_or_default();

        ret.sort_by(|a, b| (a.name(), a.namespace()).cmp(&(b.name(), b.namespace())));
        ret
    }

    /// Objects in one namespace across every allowed cluster, ordered by name
    /// and then cluster
    #[must_use]
    pub fn get_by_namespace(&self, namespace: &str, filters: &[Filter]) -> Vec<EnvironmentWrapper<K>> {
        let opts = FilterOptions::new(filters);

        let mut ret: Vec<EnvironmentWrapper<K>> = self
            .read()
            .iter()
            .filter(|(cluster, _)| opts.cluster_allowed(cluster))
            .filter_map(|(cluster, namespaces)| namespaces.get(namespace).map(|names| (cluster, names)))
            .flat_map(|(cluster, names)| {
                names
                    .values()
                    .filter(|obj| opts.admits(*obj))
                    .map(move |obj| EnvironmentWrapper::new(cluster.clone(), obj.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();

        ret.sort_by(|a, b| a.name().cmp(&b.name()).then_with(|| a.cluster.cmp(&b.cluster)));
        ret
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read()
            .values()
            .flat_map(BTreeMap::values)
            .map(BTreeMap::len)
            .sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
