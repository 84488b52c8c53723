//! Building and probing live connections to registered clusters
//!
//! [`ConnectionFactory`] turns stored credentials into a working
//! `kube::Client`, verifies liveness, and gathers best-effort cluster
//! facts (node/pod counts, capacity, installed capabilities). The registry
//! owns caching and invalidation; the factory is stateless.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, ListParams};
use kube::config::{
    AuthInfo, Cluster as KubeconfigCluster, Context as KubeconfigContext, KubeConfigOptions,
    Kubeconfig, NamedAuthInfo, NamedCluster, NamedContext,
};
use kube::{Client, Config};
use secrecy::SecretString;
use tracing::{debug, warn};

use crate::registry::types::{
    Cluster, ClusterConnection, ClusterCredentials, ClusterMetrics, CredentialKind,
};
use crate::{Error, Result};

/// Timeout for establishing a TCP/TLS connection to a spoke API server
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for individual API requests against a spoke
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// API groups whose presence on a spoke marks an installed capability
///
/// Discovery is by group name only; version and resource details are left
/// to the components that consume the feature tags.
const FEATURE_GROUPS: &[(&str, &str)] = &[
    ("monitoring.coreos.com", "prometheus-operator"),
    ("networking.istio.io", "istio"),
    ("linkerd.io", "linkerd"),
    ("cert-manager.io", "cert-manager"),
    ("policy", "pod-security-policy"),
];

/// Builds, probes, and inspects connections to remote clusters
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Build a client from credentials and verify the API server responds
    ///
    /// A connection is only returned after a successful liveness probe;
    /// there is no "connected but unverified" state.
    async fn connect(
        &self,
        cluster: &Cluster,
        credentials: &ClusterCredentials,
    ) -> Result<ClusterConnection>;

    /// Verify an existing connection still reaches its API server
    async fn probe(&self, connection: &ClusterConnection) -> Result<()>;

    /// Refresh `cluster.features` and `cluster.metrics` from the live cluster
    ///
    /// Best-effort: partial results are written for whatever succeeded, and
    /// an error here never invalidates the connection itself.
    async fn gather_info(
        &self,
        cluster: &mut Cluster,
        connection: &ClusterConnection,
    ) -> Result<()>;
}

/// Factory that connects to real clusters via kube-rs
#[derive(Default)]
pub struct KubeConnectionFactory;

impl KubeConnectionFactory {
    /// Create a factory
    pub fn new() -> Self {
        Self
    }

    async fn build_client(
        &self,
        cluster: &Cluster,
        credentials: &ClusterCredentials,
    ) -> Result<Client> {
        let kind = credentials.kind().ok_or_else(|| {
            Error::validation(&cluster.name, "no usable credentials provided")
        })?;

        let kubeconfig = match kind {
            CredentialKind::Kubeconfig => {
                let bytes = credentials.kubeconfig.as_deref().unwrap_or_default();
                let yaml = std::str::from_utf8(bytes).map_err(|_| {
                    Error::validation(&cluster.name, "kubeconfig is not valid UTF-8")
                })?;
                Kubeconfig::from_yaml(yaml).map_err(|e| {
                    Error::validation(&cluster.name, format!("invalid kubeconfig: {}", e))
                })?
            }
            CredentialKind::BearerToken | CredentialKind::ClientCertificate => {
                synthesize_kubeconfig(cluster, credentials, kind)
            }
        };

        let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| {
                Error::validation(&cluster.name, format!("invalid client configuration: {}", e))
            })?;
        config.connect_timeout = Some(CONNECT_TIMEOUT);
        config.read_timeout = Some(READ_TIMEOUT);

        Client::try_from(config)
            .map_err(|e| Error::connection(&cluster.name, format!("failed to build client: {}", e)))
    }
}

#[async_trait]
impl ConnectionFactory for KubeConnectionFactory {
    async fn connect(
        &self,
        cluster: &Cluster,
        credentials: &ClusterCredentials,
    ) -> Result<ClusterConnection> {
        let client = self.build_client(cluster, credentials).await?;

        // Cheap liveness probe: the version endpoint needs no RBAC beyond
        // an authenticated identity.
        client.apiserver_version().await.map_err(|e| {
            Error::connection(
                &cluster.name,
                format!("failed to reach API server at {}: {}", cluster.endpoint, e),
            )
        })?;

        debug!(cluster = %cluster.name, endpoint = %cluster.endpoint, "connected to cluster");

        Ok(ClusterConnection {
            cluster: cluster.clone(),
            client,
            connected: true,
            last_connected: Some(Utc::now()),
            last_error: None,
        })
    }

    async fn probe(&self, connection: &ClusterConnection) -> Result<()> {
        connection.client.apiserver_version().await.map_err(|e| {
            Error::connection(
                &connection.cluster.name,
                format!("liveness probe failed: {}", e),
            )
        })?;
        Ok(())
    }

    async fn gather_info(
        &self,
        cluster: &mut Cluster,
        connection: &ClusterConnection,
    ) -> Result<()> {
        let client = &connection.client;

        match detect_features(client).await {
            Ok(features) => cluster.features = features,
            Err(e) => {
                warn!(cluster = %cluster.name, error = %e, "feature discovery failed");
            }
        }

        let nodes = Api::<Node>::all(client.clone())
            .list(&ListParams::default())
            .await
            .map_err(|e| {
                Error::connection(&cluster.name, format!("failed to list nodes: {}", e))
            })?;

        let mut node_ready = 0;
        let mut cpu_capacity = 0.0;
        let mut memory_capacity = 0i64;
        for node in &nodes.items {
            if node_is_ready(node) {
                node_ready += 1;
            }
            if let Some(capacity) = node.status.as_ref().and_then(|s| s.capacity.as_ref()) {
                cpu_capacity += capacity
                    .get("cpu")
                    .map(|q| parse_cpu_cores(&q.0))
                    .unwrap_or(0.0);
                memory_capacity += capacity
                    .get("memory")
                    .map(|q| parse_memory_bytes(&q.0))
                    .unwrap_or(0);
            }
        }

        // Pod count is the least important fact; don't fail the whole
        // snapshot over it.
        let pod_count = match Api::<Pod>::all(client.clone())
            .list_metadata(&ListParams::default())
            .await
        {
            Ok(pods) => pods.items.len() as i32,
            Err(e) => {
                warn!(cluster = %cluster.name, error = %e, "failed to count pods");
                0
            }
        };

        cluster.metrics = Some(ClusterMetrics {
            node_count: nodes.items.len() as i32,
            node_ready,
            cpu_capacity,
            memory_capacity,
            pod_count,
            last_updated: Utc::now(),
        });

        debug!(
            cluster = %cluster.name,
            nodes = nodes.items.len(),
            ready = node_ready,
            features = ?cluster.features,
            "gathered cluster info"
        );
        Ok(())
    }
}

/// Build an in-memory kubeconfig for token or client-certificate credentials
fn synthesize_kubeconfig(
    cluster: &Cluster,
    credentials: &ClusterCredentials,
    kind: CredentialKind,
) -> Kubeconfig {
    let mut cluster_config = KubeconfigCluster {
        server: Some(cluster.endpoint.clone()),
        ..Default::default()
    };
    match &credentials.ca_bundle {
        Some(ca) => cluster_config.certificate_authority_data = Some(BASE64.encode(ca)),
        None => cluster_config.insecure_skip_tls_verify = Some(true),
    }

    let mut auth_info = AuthInfo::default();
    match kind {
        CredentialKind::BearerToken => {
            auth_info.token = credentials
                .token
                .clone()
                .map(SecretString::from);
        }
        CredentialKind::ClientCertificate => {
            auth_info.client_certificate_data =
                credentials.client_certificate.as_ref().map(|c| BASE64.encode(c));
            auth_info.client_key_data = credentials
                .client_key
                .as_ref()
                .map(|k| SecretString::from(BASE64.encode(k)));
        }
        CredentialKind::Kubeconfig => {}
    }

    Kubeconfig {
        clusters: vec![NamedCluster {
            name: cluster.name.clone(),
            cluster: Some(cluster_config),
        }],
        auth_infos: vec![NamedAuthInfo {
            name: cluster.name.clone(),
            auth_info: Some(auth_info),
        }],
        contexts: vec![NamedContext {
            name: cluster.name.clone(),
            context: Some(KubeconfigContext {
                cluster: cluster.name.clone(),
                user: Some(cluster.name.clone()),
                ..Default::default()
            }),
        }],
        current_context: Some(cluster.name.clone()),
        ..Default::default()
    }
}

/// Discover installed capabilities by listing the cluster's API groups
async fn detect_features(client: &Client) -> Result<Vec<String>> {
    let groups = client
        .list_api_groups()
        .await
        .map_err(|e| Error::internal("feature-discovery", e.to_string()))?;

    let present: BTreeMap<&str, &str> = FEATURE_GROUPS.iter().copied().collect();
    let mut features: Vec<String> = groups
        .groups
        .iter()
        .filter_map(|g| present.get(g.name.as_str()))
        .map(|f| f.to_string())
        .collect();
    features.sort();
    features.dedup();
    Ok(features)
}

fn node_is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Parse a Kubernetes CPU quantity into cores ("2" -> 2.0, "500m" -> 0.5)
fn parse_cpu_cores(quantity: &str) -> f64 {
    if let Some(millis) = quantity.strip_suffix('m') {
        millis.parse::<f64>().map(|m| m / 1000.0).unwrap_or(0.0)
    } else {
        quantity.parse::<f64>().unwrap_or(0.0)
    }
}

/// Parse a Kubernetes memory quantity into bytes ("16Gi" -> 17179869184)
fn parse_memory_bytes(quantity: &str) -> i64 {
    const SUFFIXES: &[(&str, i64)] = &[
        ("Ti", 1 << 40),
        ("Gi", 1 << 30),
        ("Mi", 1 << 20),
        ("Ki", 1 << 10),
        ("T", 1_000_000_000_000),
        ("G", 1_000_000_000),
        ("M", 1_000_000),
        ("K", 1_000),
    ];
    for (suffix, multiplier) in SUFFIXES {
        if let Some(value) = quantity.strip_suffix(suffix) {
            return value
                .parse::<f64>()
                .map(|v| (v * *multiplier as f64) as i64)
                .unwrap_or(0);
        }
    }
    quantity.parse::<i64>().unwrap_or(0)
}
