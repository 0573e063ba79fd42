// Client configuration for every cluster connection mode
use crate::error::{Error, Result};
use crate::k8s::watch::config::{ClusterConnection, user_agent};
use hyper::http::header::{AUTHORIZATION, USER_AGENT};
use hyper::http::{HeaderName, HeaderValue, Uri};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::path::Path;
use tracing::{debug, warn};
use x509_parser::pem::Pem;

const IMPERSONATE_USER: &str = "impersonate-user";
const IMPERSONATE_GROUP: &str = "impersonate-group";

/// Build the kube configuration for one cluster connection, with the
/// fleetwatch user agent attached
///
/// # Errors
///
/// Will return `Err` if the kubeconfig or in-cluster environment cannot be
/// read, the host is not a valid URI, or credential files are unreadable
pub async fn config_for(connection: &ClusterConnection) -> Result<Config> {
    let mut config = match connection {
        ClusterConnection::Ambient => {
            debug!("📄 Loading ambient Kubernetes configuration");
            Config::infer().await?
        }
        ClusterConnection::Kubeconfig { path, context } => {
            let options = KubeConfigOptions {
                context: context.clone(),
                ..KubeConfigOptions::default()
            };
            match path {
                Some(path) => {
                    let kubeconfig = Kubeconfig::read_from(path)?;
                    Config::from_custom_kubeconfig(kubeconfig, &options).await?
                }
                None => Config::from_kubeconfig(&options).await?,
            }
        }
        ClusterConnection::Remote {
            host,
            token,
            token_file,
            ca_file,
            insecure_skip_tls_verify,
        } => {
            let uri: Uri = host
                .parse()
                .map_err(|e| Error::Config(format!("invalid cluster host {host:?}: {e}")))?;
            let mut config = Config::new(uri);
            config.accept_invalid_certs = *insecure_skip_tls_verify;
            if let Some(ca_file) = ca_file {
                config.root_cert = Some(read_pem_certificates(ca_file)?);
            }

            let bearer = match (token, token_file) {
                (Some(token), _) => Some(token.clone()),
                (None, Some(file)) => Some(std::fs::read_to_string(file)?.trim().to_string()),
                (None, None) => None,
            };
            match bearer {
                Some(token) => {
                    let mut value = HeaderValue::from_str(&format!("Bearer {token}"))?;
                    value.set_sensitive(true);
                    config.headers.push((AUTHORIZATION, value));
                }
                None => warn!(%host, "Remote cluster configured without a token"),
            }
            config
        }
    };

    add_user_agent_header(&mut config, &user_agent());
    Ok(config)
}

/// Add a custom user-agent header; an invalid value keeps kube's default
pub fn add_user_agent_header(config: &mut Config, user_agent: &str) {
    match HeaderValue::from_str(user_agent) {
        Ok(value) => config.headers.push((USER_AGENT, value)),
        Err(e) => warn!(%user_agent, error = %e, "Ignoring invalid user agent"),
    }
}

/// Copy of `config` whose requests are authorized as `user` and `groups`
///
/// # Errors
///
/// Will return `Err` if the user or a group is not a valid header value
pub fn impersonate(config: &Config, user: &str, groups: &[String]) -> Result<Config> {
    let mut config = config.clone();
    config.headers.push((
        HeaderName::from_static(IMPERSONATE_USER),
        HeaderValue::from_str(user)?,
    ));
    for group in groups {
        config.headers.push((
            HeaderName::from_static(IMPERSONATE_GROUP),
            HeaderValue::from_str(group)?,
        ));
    }
    Ok(config)
}

/// Create a kube client from a prepared configuration
///
/// # Errors
///
/// Will return `Err` if the client cannot be constructed, e.g. TLS setup fails
pub fn new(config: Config) -> Result<Client> {
    Ok(Client::try_from(config)?)
}

fn read_pem_certificates(path: &Path) -> Result<Vec<Vec<u8>>> {
    let data = std::fs::read(path)?;
    let mut certs = Vec::new();
    for pem in Pem::iter_from_buffer(&data) {
        let pem = pem.map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
        if pem.label == "CERTIFICATE" {
            certs.push(pem.contents);
        }
    }
    if certs.is_empty() {
        return Err(Error::Config(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}
