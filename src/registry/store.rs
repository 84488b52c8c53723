//! Credential and metadata storage for the cluster registry
//!
//! Two thin store contracts back the registry:
//!
//! - [`CredentialStore`]: opaque per-cluster secret material, keyed by
//!   cluster name. The reference backend is one Kubernetes Secret per
//!   cluster (`cluster-<name>`) in the stratus system namespace.
//! - [`MetadataStore`]: cluster descriptive state, keyed by cluster name.
//!   The reference backend serializes the whole map into a single
//!   ConfigMap key (`clusters.json`), but the contract is per-key so
//!   single-cluster operations don't depend on full-set round-trips.
//!
//! Neither backend guarantees atomicity across keys; the registry
//! serializes read-modify-write cycles with its own lock.
//!
//! In-memory implementations are provided for tests and for embedding the
//! registry outside a Kubernetes hub.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::Client;
use tokio::sync::RwLock;

use crate::registry::types::{Cluster, ClusterCredentials};
use crate::{Error, Result, FIELD_MANAGER, LABEL_CLUSTER_NAME, LABEL_SECRET_TYPE};

/// Prefix for per-cluster credential Secret names
pub const CLUSTER_SECRET_PREFIX: &str = "cluster-";

/// Name of the ConfigMap holding cluster metadata
pub const CLUSTER_CONFIGMAP_NAME: &str = "cluster-registry";

/// Key inside the metadata ConfigMap holding the serialized cluster map
pub const CLUSTERS_JSON_KEY: &str = "clusters.json";

// Secret data keys, one per credential field. These names are a wire
// contract shared with anything else that provisions cluster secrets.
const KEY_KUBECONFIG: &str = "kubeconfig";
const KEY_TOKEN: &str = "token";
const KEY_CLIENT_CERT: &str = "client-cert";
const KEY_CLIENT_KEY: &str = "client-key";
const KEY_CA_BUNDLE: &str = "ca-bundle";

/// Storage of per-cluster secret material, keyed by cluster name
///
/// Opaque blob semantics: no schema validation beyond "at least one
/// credential kind present", which the registry checks before calling `put`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Store (or overwrite, for rotation) credentials for a cluster
    async fn put(&self, credentials: &ClusterCredentials) -> Result<()>;

    /// Load credentials for a cluster; NotFound when absent
    async fn get(&self, cluster_name: &str) -> Result<ClusterCredentials>;

    /// Delete credentials for a cluster; succeeds when already absent
    async fn delete(&self, cluster_name: &str) -> Result<()>;
}

/// Storage of cluster descriptive state, keyed by cluster name
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Load one cluster; NotFound when absent
    async fn get(&self, cluster_name: &str) -> Result<Cluster>;

    /// Load all registered clusters (order unspecified)
    async fn list(&self) -> Result<Vec<Cluster>>;

    /// Store (or overwrite) one cluster entry
    async fn put(&self, cluster: &Cluster) -> Result<()>;

    /// Remove exactly one cluster entry; succeeds when already absent
    async fn remove(&self, cluster_name: &str) -> Result<()>;
}

fn secret_name(cluster_name: &str) -> String {
    format!("{}{}", CLUSTER_SECRET_PREFIX, cluster_name)
}

fn is_404(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

// =============================================================================
// Kubernetes backends
// =============================================================================

/// Credential store backed by per-cluster Kubernetes Secrets on the hub
pub struct KubeCredentialStore {
    secrets: Api<Secret>,
    namespace: String,
}

impl KubeCredentialStore {
    /// Create a store writing Secrets into the given hub namespace
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            secrets: Api::namespaced(client, &namespace),
            namespace,
        }
    }
}

#[async_trait]
impl CredentialStore for KubeCredentialStore {
    async fn put(&self, credentials: &ClusterCredentials) -> Result<()> {
        let name = secret_name(&credentials.cluster_name);

        let mut data = serde_json::Map::new();
        if let Some(kubeconfig) = &credentials.kubeconfig {
            data.insert(KEY_KUBECONFIG.into(), BASE64.encode(kubeconfig).into());
        }
        if let Some(token) = &credentials.token {
            data.insert(KEY_TOKEN.into(), BASE64.encode(token.as_bytes()).into());
        }
        if let Some(cert) = &credentials.client_certificate {
            data.insert(KEY_CLIENT_CERT.into(), BASE64.encode(cert).into());
        }
        if let Some(key) = &credentials.client_key {
            data.insert(KEY_CLIENT_KEY.into(), BASE64.encode(key).into());
        }
        if let Some(ca) = &credentials.ca_bundle {
            data.insert(KEY_CA_BUNDLE.into(), BASE64.encode(ca).into());
        }

        let secret = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {
                "name": name,
                "namespace": self.namespace,
                "labels": {
                    LABEL_CLUSTER_NAME: credentials.cluster_name,
                    LABEL_SECRET_TYPE: "cluster-credentials",
                },
            },
            "type": "Opaque",
            "data": data,
        });

        // Server-side apply: create-or-update in one call, no race with
        // concurrent writers.
        self.secrets
            .patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&secret),
            )
            .await
            .map_err(|e| Error::credential_store(&credentials.cluster_name, e.to_string()))?;
        Ok(())
    }

    async fn get(&self, cluster_name: &str) -> Result<ClusterCredentials> {
        let secret = match self.secrets.get(&secret_name(cluster_name)).await {
            Ok(secret) => secret,
            Err(e) if is_404(&e) => return Err(Error::not_found(cluster_name)),
            Err(e) => return Err(Error::credential_store(cluster_name, e.to_string())),
        };

        let mut credentials = ClusterCredentials {
            cluster_name: cluster_name.to_string(),
            ..Default::default()
        };
        if let Some(data) = secret.data {
            for (key, value) in data {
                match key.as_str() {
                    KEY_KUBECONFIG => credentials.kubeconfig = Some(value.0),
                    KEY_TOKEN => {
                        credentials.token = Some(String::from_utf8(value.0).map_err(|_| {
                            Error::credential_store(cluster_name, "token is not valid UTF-8")
                        })?)
                    }
                    KEY_CLIENT_CERT => credentials.client_certificate = Some(value.0),
                    KEY_CLIENT_KEY => credentials.client_key = Some(value.0),
                    KEY_CA_BUNDLE => credentials.ca_bundle = Some(value.0),
                    _ => {}
                }
            }
        }
        Ok(credentials)
    }

    async fn delete(&self, cluster_name: &str) -> Result<()> {
        match self
            .secrets
            .delete(&secret_name(cluster_name), &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_404(&e) => Ok(()),
            Err(e) => Err(Error::credential_store(cluster_name, e.to_string())),
        }
    }
}

/// Metadata store backed by a single ConfigMap on the hub
///
/// The per-key contract is implemented over one JSON blob: each mutation
/// loads the full map, changes one entry, and writes the map back. The
/// registry serializes these cycles; the store itself makes no atomicity
/// guarantee across keys.
pub struct KubeMetadataStore {
    configmaps: Api<ConfigMap>,
    namespace: String,
}

impl KubeMetadataStore {
    /// Create a store writing the metadata ConfigMap into the given namespace
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            configmaps: Api::namespaced(client, &namespace),
            namespace,
        }
    }

    async fn load_all(&self) -> Result<HashMap<String, Cluster>> {
        let cm = match self.configmaps.get(CLUSTER_CONFIGMAP_NAME).await {
            Ok(cm) => cm,
            Err(e) if is_404(&e) => return Ok(HashMap::new()),
            Err(e) => return Err(Error::metadata_store("get", e.to_string())),
        };

        let Some(json) = cm.data.as_ref().and_then(|d| d.get(CLUSTERS_JSON_KEY)) else {
            return Ok(HashMap::new());
        };
        serde_json::from_str(json)
            .map_err(|e| Error::serialization(format!("clusters.json: {}", e)))
    }

    async fn store_all(&self, clusters: &HashMap<String, Cluster>) -> Result<()> {
        let json = serde_json::to_string(clusters)
            .map_err(|e| Error::serialization(format!("clusters.json: {}", e)))?;

        let cm = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": CLUSTER_CONFIGMAP_NAME,
                "namespace": self.namespace,
                "labels": { "stratus.io/component": "cluster-registry" },
            },
            "data": { CLUSTERS_JSON_KEY: json },
        });

        self.configmaps
            .patch(
                CLUSTER_CONFIGMAP_NAME,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&cm),
            )
            .await
            .map_err(|e| Error::metadata_store("put", e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for KubeMetadataStore {
    async fn get(&self, cluster_name: &str) -> Result<Cluster> {
        self.load_all()
            .await?
            .remove(cluster_name)
            .ok_or_else(|| Error::not_found(cluster_name))
    }

    async fn list(&self) -> Result<Vec<Cluster>> {
        Ok(self.load_all().await?.into_values().collect())
    }

    async fn put(&self, cluster: &Cluster) -> Result<()> {
        let mut clusters = self.load_all().await?;
        clusters.insert(cluster.name.clone(), cluster.clone());
        self.store_all(&clusters).await
    }

    async fn remove(&self, cluster_name: &str) -> Result<()> {
        let mut clusters = self.load_all().await?;
        if clusters.remove(cluster_name).is_none() {
            return Ok(());
        }
        self.store_all(&clusters).await
    }
}

// =============================================================================
// In-memory backends
// =============================================================================

/// In-memory credential store for tests and non-Kubernetes embedding
#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: RwLock<HashMap<String, ClusterCredentials>>,
}

impl MemoryCredentialStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn put(&self, credentials: &ClusterCredentials) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(credentials.cluster_name.clone(), credentials.clone());
        Ok(())
    }

    async fn get(&self, cluster_name: &str) -> Result<ClusterCredentials> {
        self.entries
            .read()
            .await
            .get(cluster_name)
            .cloned()
            .ok_or_else(|| Error::not_found(cluster_name))
    }

    async fn delete(&self, cluster_name: &str) -> Result<()> {
        self.entries.write().await.remove(cluster_name);
        Ok(())
    }
}

/// In-memory metadata store for tests and non-Kubernetes embedding
#[derive(Default)]
pub struct MemoryMetadataStore {
    entries: RwLock<HashMap<String, Cluster>>,
}

impl MemoryMetadataStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn get(&self, cluster_name: &str) -> Result<Cluster> {
        self.entries
            .read()
            .await
            .get(cluster_name)
            .cloned()
            .ok_or_else(|| Error::not_found(cluster_name))
    }

    async fn list(&self) -> Result<Vec<Cluster>> {
        Ok(self.entries.read().await.values().cloned().collect())
    }

    async fn put(&self, cluster: &Cluster) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(cluster.name.clone(), cluster.clone());
        Ok(())
    }

    async fn remove(&self, cluster_name: &str) -> Result<()> {
        self.entries.write().await.remove(cluster_name);
        Ok(())
    }
}
