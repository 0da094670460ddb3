//! Cluster connection configuration.
//!
//! Resolves where the API server is and how to authenticate against it,
//! either from a kubeconfig file (out-of-cluster development) or from the
//! in-cluster service account environment. Only the credential shapes a
//! read-only secret watcher needs are supported: bearer tokens and client
//! certificates.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, trace};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Resolved authentication material for the API server.
#[derive(Debug, Clone)]
pub enum KubeAuth {
    /// Bearer token (service account or kubeconfig `token`)
    Token(String),
    /// mTLS client certificate and key, both PEM
    ClientCert { cert: Vec<u8>, key: Vec<u8> },
    /// No credentials (anonymous or test clusters)
    None,
}

/// Fully resolved cluster connection parameters.
#[derive(Debug, Clone)]
pub struct ResolvedKubeConfig {
    /// API server base URL
    pub server: String,
    /// CA bundle to verify the server with, PEM
    pub ca_cert: Option<Vec<u8>>,
    /// Credentials
    pub auth: KubeAuth,
    /// Disable server certificate verification (kubeconfig
    /// `insecure-skip-tls-verify`)
    pub insecure_skip_tls_verify: bool,
}

/// Errors resolving cluster connection configuration.
#[derive(Debug, Error)]
pub enum KubeConfigError {
    #[error("reading kubeconfig: {0}")]
    Read(#[from] std::io::Error),
    #[error("parsing kubeconfig YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("no current context set in kubeconfig")]
    NoCurrentContext,
    #[error("context {0:?} not found")]
    ContextNotFound(String),
    #[error("cluster {0:?} not found")]
    ClusterNotFound(String),
    #[error("user {0:?} not found")]
    UserNotFound(String),
    #[error("decoding base64 credential data: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("not running in a cluster: {0}")]
    NotInCluster(String),
}

/// Kubeconfig file schema, reduced to the parts the monitor consumes.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Kubeconfig {
    current_context: Option<String>,
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    contexts: Vec<NamedContext>,
    #[serde(default)]
    users: Vec<NamedUser>,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: ClusterConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterConfig {
    server: String,
    certificate_authority_data: Option<String>,
    certificate_authority: Option<String>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Debug, Deserialize)]
struct NamedContext {
    name: String,
    context: ContextConfig,
}

#[derive(Debug, Deserialize)]
struct ContextConfig {
    cluster: String,
    user: String,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    name: String,
    user: UserConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct UserConfig {
    token: Option<String>,
    token_file: Option<String>,
    client_certificate_data: Option<String>,
    client_certificate: Option<String>,
    client_key_data: Option<String>,
    client_key: Option<String>,
}

impl ResolvedKubeConfig {
    /// Resolve connection configuration.
    ///
    /// An explicit kubeconfig path wins. Otherwise the in-cluster service
    /// account environment is tried first, falling back to
    /// `~/.kube/config`.
    pub fn resolve(kubeconfig: Option<&Path>) -> Result<Self, KubeConfigError> {
        if let Some(path) = kubeconfig {
            return Self::from_kubeconfig_file(path);
        }

        match Self::in_cluster() {
            Ok(config) => Ok(config),
            Err(err) => {
                debug!(error = %err, "in-cluster config unavailable, trying default kubeconfig");
                Self::from_kubeconfig_file(default_kubeconfig_path())
            }
        }
    }

    /// Resolve from the in-cluster service account environment.
    pub fn in_cluster() -> Result<Self, KubeConfigError> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| KubeConfigError::NotInCluster("KUBERNETES_SERVICE_HOST not set".into()))?;
        let port =
            std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());

        let sa_dir = Path::new(SERVICE_ACCOUNT_DIR);
        let token = std::fs::read_to_string(sa_dir.join("token"))?;
        let ca_cert = std::fs::read(sa_dir.join("ca.crt")).ok();

        Ok(Self {
            server: format!("https://{host}:{port}"),
            ca_cert,
            auth: KubeAuth::Token(token.trim().to_string()),
            insecure_skip_tls_verify: false,
        })
    }

    /// Resolve the current context of a kubeconfig file.
    pub fn from_kubeconfig_file<P: AsRef<Path>>(path: P) -> Result<Self, KubeConfigError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading kubeconfig");
        let content = std::fs::read_to_string(path)?;
        Self::from_kubeconfig_str(&content)
    }

    /// Resolve the current context of kubeconfig YAML.
    pub fn from_kubeconfig_str(content: &str) -> Result<Self, KubeConfigError> {
        let config: Kubeconfig = serde_yaml::from_str(content)?;
        trace!(
            clusters = config.clusters.len(),
            contexts = config.contexts.len(),
            users = config.users.len(),
            "parsed kubeconfig"
        );

        let context_name = config
            .current_context
            .clone()
            .ok_or(KubeConfigError::NoCurrentContext)?;
        let context = config
            .contexts
            .iter()
            .find(|c| c.name == context_name)
            .map(|c| &c.context)
            .ok_or_else(|| KubeConfigError::ContextNotFound(context_name.clone()))?;
        let cluster = config
            .clusters
            .iter()
            .find(|c| c.name == context.cluster)
            .map(|c| &c.cluster)
            .ok_or_else(|| KubeConfigError::ClusterNotFound(context.cluster.clone()))?;
        let user = config
            .users
            .iter()
            .find(|u| u.name == context.user)
            .map(|u| &u.user)
            .ok_or_else(|| KubeConfigError::UserNotFound(context.user.clone()))?;

        let ca_cert = inline_or_file(
            cluster.certificate_authority_data.as_deref(),
            cluster.certificate_authority.as_deref(),
        )?;

        let auth = resolve_auth(user)?;

        Ok(Self {
            server: cluster.server.clone(),
            ca_cert,
            auth,
            insecure_skip_tls_verify: cluster.insecure_skip_tls_verify,
        })
    }
}

fn resolve_auth(user: &UserConfig) -> Result<KubeAuth, KubeConfigError> {
    if let Some(token) = &user.token {
        return Ok(KubeAuth::Token(token.clone()));
    }
    if let Some(token_file) = &user.token_file {
        let token = std::fs::read_to_string(token_file)?;
        return Ok(KubeAuth::Token(token.trim().to_string()));
    }

    let cert = inline_or_file(
        user.client_certificate_data.as_deref(),
        user.client_certificate.as_deref(),
    )?;
    let key = inline_or_file(user.client_key_data.as_deref(), user.client_key.as_deref())?;

    match (cert, key) {
        (Some(cert), Some(key)) => Ok(KubeAuth::ClientCert { cert, key }),
        _ => Ok(KubeAuth::None),
    }
}

/// Kubeconfig fields come in `*-data` (inline base64) and path flavors;
/// inline data wins when both are present.
fn inline_or_file(
    data: Option<&str>,
    path: Option<&str>,
) -> Result<Option<Vec<u8>>, KubeConfigError> {
    if let Some(data) = data {
        return Ok(Some(BASE64.decode(data)?));
    }
    if let Some(path) = path {
        return Ok(Some(std::fs::read(path)?));
    }
    Ok(None)
}

fn default_kubeconfig_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
    PathBuf::from(home).join(".kube").join("config")
}
