/**
 * Configuration for the multi-cluster watch layer
 */
use crate::error::{Error, Result};
use k8s_openapi::serde_json;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Namespace owned by the platform itself; objects in it are never surfaced
pub const DEFAULT_RESERVED_NAMESPACE: &str = "nais-system";

/// Maximum backoff time in seconds between event stream restarts
pub const MAX_BACKOFF_SECONDS: u64 = 60;

/// Initial backoff time in seconds
pub const INITIAL_BACKOFF_SECONDS: u64 = 1;

/// Brief delay between restart attempts in milliseconds
pub const RESTART_DELAY_MILLIS: u64 = 500;

/// Environment variable overriding the user agent sent to every cluster
pub const USER_AGENT_ENV: &str = "FLEETWATCH_USER_AGENT";

/// How to reach one cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterConnection {
    /// In-cluster service account or the default kubeconfig
    #[default]
    Ambient,
    /// A context from a kubeconfig file
    Kubeconfig {
        #[serde(default)]
        path: Option<PathBuf>,
        #[serde(default)]
        context: Option<String>,
    },
    /// A remote API server with bearer token auth
    Remote {
        host: String,
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        token_file: Option<PathBuf>,
        #[serde(default)]
        ca_file: Option<PathBuf>,
        #[serde(default)]
        insecure_skip_tls_verify: bool,
    },
}

/// Cluster name to connection parameters
pub type ClusterConfigMap = BTreeMap<String, ClusterConnection>;

/// Top-level configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetConfig {
    pub clusters: ClusterConfigMap,
    #[serde(default = "default_reserved_namespace")]
    pub reserved_namespace: String,
}

fn default_reserved_namespace() -> String {
    DEFAULT_RESERVED_NAMESPACE.to_string()
}

impl Default for FleetConfig {
    fn default() -> Self {
        let mut clusters = ClusterConfigMap::new();
        clusters.insert("management".to_string(), ClusterConnection::Ambient);
        Self {
            clusters,
            reserved_namespace: default_reserved_namespace(),
        }
    }
}

impl FleetConfig {
    /// Load a JSON configuration file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON, or
    /// names no clusters
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&raw)
    }

    /// Parse a JSON configuration document
    ///
    /// # Errors
    ///
    /// Returns an error if the document is invalid or names no clusters
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        if config.clusters.is_empty() {
            return Err(Error::Config("configuration names no clusters".to_string()));
        }
        Ok(config)
    }
}

/// User agent for cluster clients, honouring `FLEETWATCH_USER_AGENT`
#[must_use]
pub fn user_agent() -> String {
    std::env::var(USER_AGENT_ENV)
        .ok()
        .filter(|ua| !ua.trim().is_empty())
        .unwrap_or_else(|| crate::k8s::USER_AGENT.to_string())
}

/// Validate configuration constants at compile time
const _: () = {
    assert!(MAX_BACKOFF_SECONDS > 0, "MAX_BACKOFF_SECONDS must be greater than 0");
    assert!(INITIAL_BACKOFF_SECONDS > 0, "INITIAL_BACKOFF_SECONDS must be greater than 0");
    assert!(INITIAL_BACKOFF_SECONDS <= MAX_BACKOFF_SECONDS, "initial backoff exceeds maximum");
    assert!(RESTART_DELAY_MILLIS > 0, "RESTART_DELAY_MILLIS must be greater than 0");
    assert!(!DEFAULT_RESERVED_NAMESPACE.is_empty(), "reserved namespace must be set");
};
