use derive_more::From;
use k8s_openapi::serde_json;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, From)]
pub enum Error {
    #[from]
    Json(serde_json::Error),

    #[from]
    Kube(kube::Error),

    #[from]
    Watch(kube::runtime::watcher::Error),

    #[from]
    Infer(kube::config::InferConfigError),

    #[from]
    Kubeconfig(kube::config::KubeconfigError),

    #[from]
    HttpHeader(hyper::http::header::InvalidHeaderValue),

    #[from]
    Io(std::io::Error),

    /// Object is not present in the local cache
    NotFound {
        cluster: String,
        namespace: String,
        name: String,
    },

    /// No registered watcher serves the requested cluster
    NoWatcher { cluster: String },

    /// Cluster name is absent from the manager's configuration
    UnknownCluster(String),

    /// Discovery reports the resource kind is not served by the cluster
    KindNotServed { cluster: String, resource: String },

    /// Mutation attempted without an actor on the request context
    Unauthenticated,

    /// Group memberships for the actor could not be resolved
    GroupResolution { user: String, reason: String },

    /// A remote call against a cluster failed
    Remote {
        cluster: String,
        action: &'static str,
        source: Box<Error>,
    },

    /// Invalid configuration or label selector
    Config(String),

    /// Custom error message
    Custom(String),
}

impl Error {
    /// True for cache misses and for 404 responses from the API server.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Kube(kube::Error::Api(response)) => response.code == 404,
            Self::Remote { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    pub(crate) fn not_found(cluster: &str, namespace: &str, name: &str) -> Self {
        Self::NotFound {
            cluster: cluster.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub(crate) fn remote(cluster: &str, action: &'static str, source: Self) -> Self {
        Self::Remote {
            cluster: cluster.to_string(),
            action,
            source: Box::new(source),
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::result::Result<(), core::fmt::Error> {
        match self {
            Self::NotFound {
                cluster,
                namespace,
                name,
            } => write!(fmt, "{namespace}/{name} not found in cluster {cluster}"),
            Self::NoWatcher { cluster } => write!(fmt, "no watcher for cluster {cluster}"),
            Self::UnknownCluster(cluster) => write!(fmt, "no config for cluster {cluster}"),
            Self::KindNotServed { cluster, resource } => {
                write!(fmt, "resource {resource} is not served by cluster {cluster}")
            }
            Self::Unauthenticated => write!(fmt, "no authenticated actor on request"),
            Self::GroupResolution { user, reason } => {
                write!(fmt, "listing groups for user {user}: {reason}")
            }
            Self::Remote {
                cluster,
                action,
                source,
            } => write!(fmt, "{action} in cluster {cluster}: {source}"),
            Self::Config(msg) | Self::Custom(msg) => write!(fmt, "{msg}"),
            other => write!(fmt, "{other:?}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Remote { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}
