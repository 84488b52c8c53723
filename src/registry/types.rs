//! Cluster registry data model
//!
//! `Cluster` metadata is persisted as JSON (camelCase keys, matching the
//! wire contract of the metadata ConfigMap blob); credentials and live
//! connections are never serialized.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of a cluster in the hub-and-spoke topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ClusterRole {
    /// The coordinating cluster that runs the registry
    Hub,
    /// A managed remote cluster
    #[default]
    Spoke,
}

/// Current state of a registered cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ClusterStatus {
    /// Registered but not yet confirmed reachable
    #[default]
    Pending,
    /// Healthy and reachable
    Ready,
    /// The API endpoint could not be reached on the last probe
    Unreachable,
    /// Reachable but reporting a failure condition
    Error,
}

/// Best-effort resource snapshot for a cluster
///
/// Refreshed on registration and health probes. Stale data is tolerated;
/// `last_updated` tells consumers how stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMetrics {
    /// Total node count
    pub node_count: i32,
    /// Nodes with a Ready=True condition
    pub node_ready: i32,
    /// Aggregate CPU capacity in cores
    pub cpu_capacity: f64,
    /// Aggregate memory capacity in bytes
    pub memory_capacity: i64,
    /// Pods across all namespaces
    pub pod_count: i32,
    /// When this snapshot was collected
    pub last_updated: DateTime<Utc>,
}

/// A registered remote Kubernetes cluster
///
/// Owned by the metadata store; the registry reads and writes it within
/// request scope only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    /// Unique identifier, immutable after creation
    pub name: String,
    /// Reachable API server address
    pub endpoint: String,
    /// Hub or spoke (defaults to spoke)
    #[serde(default)]
    pub role: ClusterRole,
    /// Current status
    #[serde(default)]
    pub status: ClusterStatus,
    /// Labels for selection and filtering
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    /// When the cluster was registered; set once, never overwritten by updates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<DateTime<Utc>>,
    /// Last time the cluster was confirmed healthy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    /// Capability tags discovered by probing the cluster's API surface
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<String>,
    /// Best-effort resource snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ClusterMetrics>,
}

impl Cluster {
    /// Create a cluster entry with the given name and endpoint
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            role: ClusterRole::default(),
            status: ClusterStatus::default(),
            labels: HashMap::new(),
            registered_at: None,
            last_seen: None,
            features: Vec::new(),
            metrics: None,
        }
    }
}

/// Which credential kind a `ClusterCredentials` resolves to
///
/// When several kinds are present the priority order is
/// kubeconfig > bearer token > client certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    /// Full kubeconfig document
    Kubeconfig,
    /// Bearer token plus CA bundle
    BearerToken,
    /// Client certificate/key pair plus CA bundle
    ClientCertificate,
}

/// Authentication material for a cluster
///
/// Stored separately from `Cluster` metadata in a per-cluster Secret.
/// Write-mostly: only the connection builder reads it back, and it is never
/// included in get/list responses or log output.
#[derive(Clone, Default)]
pub struct ClusterCredentials {
    /// The cluster these credentials belong to
    pub cluster_name: String,
    /// Full kubeconfig bytes
    pub kubeconfig: Option<Vec<u8>>,
    /// Bearer token for token-based auth
    pub token: Option<String>,
    /// PEM client certificate for certificate-based auth
    pub client_certificate: Option<Vec<u8>>,
    /// PEM client key for certificate-based auth
    pub client_key: Option<Vec<u8>>,
    /// PEM CA bundle for verifying the API server
    pub ca_bundle: Option<Vec<u8>>,
}

impl ClusterCredentials {
    /// Credentials carrying a full kubeconfig
    pub fn from_kubeconfig(cluster_name: impl Into<String>, kubeconfig: Vec<u8>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            kubeconfig: Some(kubeconfig),
            ..Default::default()
        }
    }

    /// Credentials carrying a bearer token and CA bundle
    pub fn from_token(
        cluster_name: impl Into<String>,
        token: impl Into<String>,
        ca_bundle: Option<Vec<u8>>,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            token: Some(token.into()),
            ca_bundle,
            ..Default::default()
        }
    }

    /// Credentials carrying a client certificate/key pair and CA bundle
    pub fn from_client_cert(
        cluster_name: impl Into<String>,
        certificate: Vec<u8>,
        key: Vec<u8>,
        ca_bundle: Option<Vec<u8>>,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            client_certificate: Some(certificate),
            client_key: Some(key),
            ca_bundle,
            ..Default::default()
        }
    }

    /// Resolve the credential kind to use, in priority order
    ///
    /// Returns `None` when no usable kind is present (a certificate without
    /// its key is not usable).
    pub fn kind(&self) -> Option<CredentialKind> {
        if self.kubeconfig.as_ref().is_some_and(|k| !k.is_empty()) {
            Some(CredentialKind::Kubeconfig)
        } else if self.token.as_ref().is_some_and(|t| !t.is_empty()) {
            Some(CredentialKind::BearerToken)
        } else if self.client_certificate.as_ref().is_some_and(|c| !c.is_empty())
            && self.client_key.as_ref().is_some_and(|k| !k.is_empty())
        {
            Some(CredentialKind::ClientCertificate)
        } else {
            None
        }
    }
}

// Secret material must never reach log output. Debug prints only which
// kinds are present.
impl fmt::Debug for ClusterCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterCredentials")
            .field("cluster_name", &self.cluster_name)
            .field("kubeconfig", &self.kubeconfig.as_ref().map(|_| "<redacted>"))
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field(
                "client_certificate",
                &self.client_certificate.as_ref().map(|_| "<redacted>"),
            )
            .field("client_key", &self.client_key.as_ref().map(|_| "<redacted>"))
            .field("ca_bundle", &self.ca_bundle.as_ref().map(|_| "<present>"))
            .finish()
    }
}

/// A live connection to a cluster's API server
///
/// Ephemeral and in-memory only: cached by the registry keyed by cluster
/// name, invalidated on staleness or unregister, and rebuildable at any
/// time from stored credentials.
#[derive(Clone)]
pub struct ClusterConnection {
    /// Snapshot of the cluster at connection-build time
    pub cluster: Cluster,
    /// Live client handle to the cluster's API server
    pub client: kube::Client,
    /// Whether the connection passed its last liveness probe
    pub connected: bool,
    /// Last successful probe time
    pub last_connected: Option<DateTime<Utc>>,
    /// Message of the last connection error, if any
    pub last_error: Option<String>,
}

impl fmt::Debug for ClusterConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterConnection")
            .field("cluster", &self.cluster.name)
            .field("connected", &self.connected)
            .field("last_connected", &self.last_connected)
            .field("last_error", &self.last_error)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_defaults() {
        let cluster = Cluster::new("spoke-1", "https://10.0.0.1:6443");
        assert_eq!(cluster.role, ClusterRole::Spoke);
        assert_eq!(cluster.status, ClusterStatus::Pending);
        assert!(cluster.registered_at.is_none());
        assert!(cluster.features.is_empty());
    }

    #[test]
    fn test_cluster_json_wire_contract() {
        // The metadata blob uses camelCase keys; consumers of clusters.json
        // depend on these exact names.
        let mut cluster = Cluster::new("spoke-1", "https://10.0.0.1:6443");
        cluster.status = ClusterStatus::Ready;
        cluster.registered_at = Some(Utc::now());
        cluster.metrics = Some(ClusterMetrics {
            node_count: 3,
            node_ready: 3,
            cpu_capacity: 12.0,
            memory_capacity: 48 * 1024 * 1024 * 1024,
            pod_count: 42,
            last_updated: Utc::now(),
        });

        let json = serde_json::to_value(&cluster).unwrap();
        assert_eq!(json["name"], "spoke-1");
        assert_eq!(json["status"], "Ready");
        assert_eq!(json["role"], "Spoke");
        assert!(json.get("registeredAt").is_some());
        assert!(json["metrics"].get("cpuCapacity").is_some());
        assert!(json["metrics"].get("nodeReady").is_some());

        let back: Cluster = serde_json::from_value(json).unwrap();
        assert_eq!(back, cluster);
    }

    #[test]
    fn test_cluster_deserializes_with_missing_optionals() {
        // Older blobs may lack role/status/metrics entirely.
        let cluster: Cluster = serde_json::from_str(
            r#"{"name":"legacy","endpoint":"https://legacy:6443"}"#,
        )
        .unwrap();
        assert_eq!(cluster.role, ClusterRole::Spoke);
        assert_eq!(cluster.status, ClusterStatus::Pending);
        assert!(cluster.last_seen.is_none());
    }

    #[test]
    fn test_credential_kind_priority() {
        // kubeconfig wins over token, token over client cert
        let creds = ClusterCredentials {
            cluster_name: "c".into(),
            kubeconfig: Some(b"apiVersion: v1".to_vec()),
            token: Some("tok".into()),
            client_certificate: Some(b"CERT".to_vec()),
            client_key: Some(b"KEY".to_vec()),
            ca_bundle: None,
        };
        assert_eq!(creds.kind(), Some(CredentialKind::Kubeconfig));

        let creds = ClusterCredentials::from_token("c", "tok", None);
        assert_eq!(creds.kind(), Some(CredentialKind::BearerToken));

        let creds =
            ClusterCredentials::from_client_cert("c", b"CERT".to_vec(), b"KEY".to_vec(), None);
        assert_eq!(creds.kind(), Some(CredentialKind::ClientCertificate));
    }

    #[test]
    fn test_credential_kind_requires_usable_material() {
        // Empty material doesn't count
        let creds = ClusterCredentials {
            cluster_name: "c".into(),
            kubeconfig: Some(Vec::new()),
            ..Default::default()
        };
        assert_eq!(creds.kind(), None);

        // A certificate without its key is not usable
        let creds = ClusterCredentials {
            cluster_name: "c".into(),
            client_certificate: Some(b"CERT".to_vec()),
            ..Default::default()
        };
        assert_eq!(creds.kind(), None);
    }

    #[test]
    fn test_credentials_debug_redacts_secrets() {
        let creds = ClusterCredentials::from_token("spoke-1", "super-secret-token", None);
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("super-secret-token"));
        assert!(debug.contains("spoke-1"));
        assert!(debug.contains("<redacted>"));
    }
}
