use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

/// What the cache needs from a watched type: a stable key and a label map.
pub trait Object: Clone + Send + Sync + 'static {
    fn object_name(&self) -> String;
    fn object_namespace(&self) -> String;
    fn object_labels(&self) -> &BTreeMap<String, String>;
    /// True once the API server has set a deletion timestamp
    fn is_deleting(&self) -> bool;
}

impl<K> Object for K
where
    K: Resource + Clone + Send + Sync + 'static,
{
    fn object_name(&self) -> String {
        self.name_any()
    }

    fn object_namespace(&self) -> String {
        self.namespace().unwrap_or_default()
    }

    fn object_labels(&self) -> &BTreeMap<String, String> {
        self.labels()
    }

    fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }
}

/// An object together with the cluster it was observed in
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentWrapper<K> {
    pub cluster: String,
    pub obj: K,
}

impl<K: Object> EnvironmentWrapper<K> {
    #[must_use]
    pub fn new(cluster: impl Into<String>, obj: K) -> Self {
        Self {
            cluster: cluster.into(),
            obj,
        }
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.obj.object_name()
    }

    #[must_use]
    pub fn namespace(&self) -> String {
        self.obj.object_namespace()
    }
}

/// Strip the cluster from each entry
#[must_use]
pub fn objects<K: Clone>(list: &[EnvironmentWrapper<K>]) -> Vec<K> {
    list.iter().map(|w| w.obj.clone()).collect()
}
