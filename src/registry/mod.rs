//! Cluster registry: credentials, metadata, and live connections
//!
//! The registry is the single authority for which remote clusters exist
//! and how to reach them. It composes three collaborators behind trait
//! seams (credential store, metadata store, connection factory) and owns
//! the only piece of in-process shared mutable state in the control
//! plane: the connection cache.
//!
//! Constructed explicitly and injected where needed; there is no global
//! registry instance. `close` tears down the cache when the embedding
//! process shuts down.

pub mod connection;
pub mod health;
pub mod store;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{Error, Result};

pub use connection::{ConnectionFactory, KubeConnectionFactory};
pub use health::{ClusterHealth, HealthChecker, NodeSummary};
pub use store::{
    CredentialStore, KubeCredentialStore, KubeMetadataStore, MemoryCredentialStore,
    MemoryMetadataStore, MetadataStore,
};
pub use types::{
    Cluster, ClusterConnection, ClusterCredentials, ClusterMetrics, ClusterRole, ClusterStatus,
    CredentialKind,
};

/// The cluster registry
///
/// Operations that rewrite metadata (`register`, `update`, `update_status`,
/// `unregister`) are serialized by an internal lock because the metadata
/// store makes no atomicity guarantee across keys. Connection building and
/// probing run outside that lock; `register` and `get_connection` callers
/// should expect multi-second latencies.
pub struct ClusterRegistry {
    credentials: Arc<dyn CredentialStore>,
    metadata: Arc<dyn MetadataStore>,
    factory: Arc<dyn ConnectionFactory>,
    connections: RwLock<HashMap<String, Arc<ClusterConnection>>>,
    // Serializes metadata read-modify-write cycles. Never held across
    // connection building or probing.
    write_lock: Mutex<()>,
}

impl ClusterRegistry {
    /// Create a registry over the given collaborators
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        metadata: Arc<dyn MetadataStore>,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        Self {
            credentials,
            metadata,
            factory,
            connections: RwLock::new(HashMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Create a registry backed by hub-cluster Kubernetes storage
    ///
    /// Credentials land in per-cluster Secrets and metadata in the
    /// `cluster-registry` ConfigMap, both in `namespace`.
    pub fn for_hub(client: kube::Client, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self::new(
            Arc::new(KubeCredentialStore::new(client.clone(), namespace.clone())),
            Arc::new(KubeMetadataStore::new(client, namespace)),
            Arc::new(KubeConnectionFactory::new()),
        )
    }

    /// Register a cluster: persist credentials, connect, persist metadata
    ///
    /// On success the cluster is stored with `Status=Ready`, stamped
    /// `registered_at`/`last_seen`, a best-effort info snapshot, and a
    /// cached live connection. On connection failure the just-stored
    /// credentials are rolled back so no orphaned credential record
    /// remains, and a later `get` returns NotFound.
    pub async fn register(
        &self,
        mut cluster: Cluster,
        credentials: ClusterCredentials,
    ) -> Result<Cluster> {
        validate_registration(&cluster, &credentials)?;

        info!(cluster = %cluster.name, endpoint = %cluster.endpoint, "registering cluster");

        self.credentials.put(&credentials).await?;

        let connection = match self.factory.connect(&cluster, &credentials).await {
            Ok(conn) => conn,
            Err(e) => {
                // Roll back so a failed register leaves no trace. Best
                // effort: a failed delete leaves the orphan it would have
                // anyway.
                if let Err(del) = self.credentials.delete(&cluster.name).await {
                    warn!(
                        cluster = %cluster.name,
                        error = %del,
                        "failed to roll back credentials after connection failure"
                    );
                }
                return Err(e);
            }
        };

        let now = Utc::now();
        cluster.status = ClusterStatus::Ready;
        cluster.registered_at = Some(now);
        cluster.last_seen = Some(now);

        // Best-effort: a spoke that rejects node listing still registers,
        // just without a snapshot.
        if let Err(e) = self.factory.gather_info(&mut cluster, &connection).await {
            warn!(cluster = %cluster.name, error = %e, "failed to gather cluster info");
        }

        {
            let _guard = self.write_lock.lock().await;
            self.metadata.put(&cluster).await?;
        }

        self.connections
            .write()
            .await
            .insert(cluster.name.clone(), Arc::new(connection));

        info!(
            cluster = %cluster.name,
            features = ?cluster.features,
            "cluster registered"
        );
        Ok(cluster)
    }

    /// Unregister a cluster, dropping its connection, credentials, and
    /// metadata. Idempotent: unregistering an unknown name succeeds.
    pub async fn unregister(&self, name: &str) -> Result<()> {
        self.connections.write().await.remove(name);
        self.credentials.delete(name).await?;
        {
            let _guard = self.write_lock.lock().await;
            self.metadata.remove(name).await?;
        }
        info!(cluster = %name, "cluster unregistered");
        Ok(())
    }

    /// Get a cluster by name; NotFound when absent
    pub async fn get(&self, name: &str) -> Result<Cluster> {
        self.metadata.get(name).await
    }

    /// List all registered clusters (order unspecified)
    pub async fn list(&self) -> Result<Vec<Cluster>> {
        self.metadata.list().await
    }

    /// Overwrite a cluster's metadata
    ///
    /// The cluster must already exist. `registered_at` is always preserved
    /// from the existing record; `last_seen` is preserved when the caller
    /// left it unset. Everything else is a full overwrite.
    pub async fn update(&self, cluster: Cluster) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.update_locked(cluster).await
    }

    /// Set a cluster's status, refreshing `last_seen` when it becomes Ready
    pub async fn update_status(&self, name: &str, status: ClusterStatus) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut cluster = self.metadata.get(name).await?;
        cluster.status = status;
        if status == ClusterStatus::Ready {
            cluster.last_seen = Some(Utc::now());
        }
        self.update_locked(cluster).await
    }

    async fn update_locked(&self, mut cluster: Cluster) -> Result<()> {
        let existing = self.metadata.get(&cluster.name).await?;
        cluster.registered_at = existing.registered_at;
        if cluster.last_seen.is_none() {
            cluster.last_seen = existing.last_seen;
        }
        self.metadata.put(&cluster).await
    }

    /// Get a live connection to a cluster, cache-first
    ///
    /// A cached connection that passes its liveness probe is returned
    /// unchanged (callers observing the same `Arc` across calls can rely
    /// on it being the same connection). A miss or a failed probe funnels
    /// into one rebuild path: reload metadata and credentials, connect,
    /// probe, replace the cache entry. Failures leave the cache untouched.
    pub async fn get_connection(&self, name: &str) -> Result<Arc<ClusterConnection>> {
        if let Some(cached) = self.connections.read().await.get(name).cloned() {
            match self.factory.probe(&cached).await {
                Ok(()) => return Ok(cached),
                Err(e) => {
                    debug!(cluster = %name, error = %e, "cached connection stale, rebuilding");
                }
            }
        }

        let cluster = self.metadata.get(name).await?;
        let credentials = self.credentials.get(name).await?;
        let connection = Arc::new(self.factory.connect(&cluster, &credentials).await?);

        self.connections
            .write()
            .await
            .insert(name.to_string(), Arc::clone(&connection));

        debug!(cluster = %name, "connection established");
        Ok(connection)
    }

    /// Refresh a cluster's info snapshot from the live cluster
    ///
    /// Used by periodic health probes: reconnects (or reuses the cached
    /// connection), regathers node counts, capacity, and features, and
    /// persists the updated record. Returns the refreshed cluster.
    pub async fn refresh_cluster_info(&self, name: &str) -> Result<Cluster> {
        let connection = self.get_connection(name).await?;
        let mut cluster = self.metadata.get(name).await?;
        self.factory.gather_info(&mut cluster, &connection).await?;
        {
            let _guard = self.write_lock.lock().await;
            self.metadata.put(&cluster).await?;
        }
        Ok(cluster)
    }

    /// Drop all cached connections
    ///
    /// Called on shutdown. Stored credentials and metadata are untouched;
    /// a later `get_connection` rebuilds from them.
    pub async fn close(&self) {
        let mut connections = self.connections.write().await;
        let count = connections.len();
        connections.clear();
        info!(connections = count, "registry closed");
    }
}

fn validate_registration(cluster: &Cluster, credentials: &ClusterCredentials) -> Result<()> {
    if cluster.name.is_empty() {
        return Err(Error::validation("<unnamed>", "cluster name is required"));
    }
    if cluster.endpoint.is_empty() {
        return Err(Error::validation(
            &cluster.name,
            "cluster endpoint is required",
        ));
    }
    if credentials.cluster_name != cluster.name {
        return Err(Error::validation(
            &cluster.name,
            format!(
                "credentials are for cluster {}",
                credentials.cluster_name
            ),
        ));
    }
    if credentials.kind().is_none() {
        return Err(Error::validation(
            &cluster.name,
            "at least one credential kind is required (kubeconfig, token, or client certificate)",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::connection::MockConnectionFactory;
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};

    fn fake_client() -> kube::Client {
        let config = kube::Config::new("http://127.0.0.1:8080".parse::<http::Uri>().unwrap());
        kube::Client::try_from(config).unwrap()
    }

    fn live_connection(cluster: &Cluster) -> ClusterConnection {
        ClusterConnection {
            cluster: cluster.clone(),
            client: fake_client(),
            connected: true,
            last_connected: Some(Utc::now()),
            last_error: None,
        }
    }

    fn registry_with(factory: MockConnectionFactory) -> ClusterRegistry {
        ClusterRegistry::new(
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(MemoryMetadataStore::new()),
            Arc::new(factory),
        )
    }

    fn spoke(name: &str) -> (Cluster, ClusterCredentials) {
        (
            Cluster::new(name, "https://10.0.0.1:6443"),
            ClusterCredentials::from_token(name, "tok", None),
        )
    }

    /// Story: a successful registration leaves a Ready cluster behind
    ///
    /// Register spoke-1 with a bearer token; the stored cluster has
    /// Status=Ready and registered_at set, and a subsequent get_connection
    /// serves the connection built during registration.
    #[tokio::test]
    async fn story_register_yields_ready_cluster() {
        let mut factory = MockConnectionFactory::new();
        factory
            .expect_connect()
            .times(1)
            .returning(|cluster, _| Ok(live_connection(cluster)));
        factory
            .expect_gather_info()
            .times(1)
            .returning(|cluster, _| {
                cluster.features = vec!["prometheus-operator".to_string()];
                Ok(())
            });
        factory.expect_probe().returning(|_| Ok(()));

        let registry = registry_with(factory);
        let (cluster, creds) = spoke("spoke-1");
        let registered = registry.register(cluster, creds).await.unwrap();

        assert_eq!(registered.status, ClusterStatus::Ready);
        assert!(registered.registered_at.is_some());
        assert!(registered.last_seen.is_some());
        assert_eq!(registered.features, vec!["prometheus-operator"]);

        let stored = registry.get("spoke-1").await.unwrap();
        assert_eq!(stored, registered);

        // Cache hit: the connection from registration, not a rebuild.
        let conn = registry.get_connection("spoke-1").await.unwrap();
        assert!(conn.connected);
    }

    /// Story: bad payloads are rejected before any side effect
    #[tokio::test]
    async fn story_register_validates_before_side_effects() {
        let mut factory = MockConnectionFactory::new();
        factory.expect_connect().never();

        let credentials = Arc::new(MemoryCredentialStore::new());
        let registry = ClusterRegistry::new(
            credentials.clone(),
            Arc::new(MemoryMetadataStore::new()),
            Arc::new(factory),
        );

        // Missing endpoint
        let cluster = Cluster::new("spoke-1", "");
        let creds = ClusterCredentials::from_token("spoke-1", "tok", None);
        let err = registry.register(cluster, creds).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));

        // No usable credentials
        let cluster = Cluster::new("spoke-1", "https://10.0.0.1:6443");
        let creds = ClusterCredentials {
            cluster_name: "spoke-1".into(),
            ..Default::default()
        };
        let err = registry.register(cluster, creds).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));

        // Mismatched credential owner
        let cluster = Cluster::new("spoke-1", "https://10.0.0.1:6443");
        let creds = ClusterCredentials::from_token("spoke-2", "tok", None);
        let err = registry.register(cluster, creds).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));

        assert!(credentials.get("spoke-1").await.unwrap_err().is_not_found());
    }

    /// Story: a cluster that refuses connections never becomes registered
    ///
    /// The connection error surfaces to the caller, the just-stored
    /// credentials are rolled back, and get afterwards returns NotFound.
    #[tokio::test]
    async fn story_register_rolls_back_on_connection_failure() {
        let mut factory = MockConnectionFactory::new();
        factory.expect_connect().times(1).returning(|cluster, _| {
            Err(Error::connection(&cluster.name, "connection refused"))
        });

        let credentials = Arc::new(MemoryCredentialStore::new());
        let registry = ClusterRegistry::new(
            credentials.clone(),
            Arc::new(MemoryMetadataStore::new()),
            Arc::new(factory),
        );

        let (cluster, creds) = spoke("spoke-1");
        let err = registry.register(cluster, creds).await.unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));

        assert!(registry.get("spoke-1").await.unwrap_err().is_not_found());
        assert!(credentials.get("spoke-1").await.unwrap_err().is_not_found());
    }

    /// Story: unregister forgets a cluster completely, and twice is fine
    #[tokio::test]
    async fn story_unregister_is_idempotent() {
        let mut factory = MockConnectionFactory::new();
        factory
            .expect_connect()
            .returning(|cluster, _| Ok(live_connection(cluster)));
        factory.expect_gather_info().returning(|_, _| Ok(()));

        let registry = registry_with(factory);
        let (cluster, creds) = spoke("spoke-1");
        registry.register(cluster, creds).await.unwrap();

        registry.unregister("spoke-1").await.unwrap();
        assert!(registry.get("spoke-1").await.unwrap_err().is_not_found());

        // Second call succeeds despite absence
        registry.unregister("spoke-1").await.unwrap();

        // And the cached connection is gone
        assert!(registry.get_connection("spoke-1").await.is_err());
    }

    /// Story: update cannot rewrite history
    ///
    /// Whatever a caller sends, registered_at stays as stamped at
    /// registration, and last_seen survives unless explicitly supplied.
    #[tokio::test]
    async fn story_update_preserves_registration_timestamps() {
        let mut factory = MockConnectionFactory::new();
        factory
            .expect_connect()
            .returning(|cluster, _| Ok(live_connection(cluster)));
        factory.expect_gather_info().returning(|_, _| Ok(()));

        let registry = registry_with(factory);
        let (cluster, creds) = spoke("spoke-1");
        let registered = registry.register(cluster, creds).await.unwrap();
        let original_registered_at = registered.registered_at;
        let original_last_seen = registered.last_seen;

        let mut updated = registered.clone();
        updated.labels.insert("region".into(), "eu-west".into());
        updated.registered_at = Some(Utc::now() + ChronoDuration::days(30));
        updated.last_seen = None;
        registry.update(updated).await.unwrap();

        let stored = registry.get("spoke-1").await.unwrap();
        assert_eq!(stored.registered_at, original_registered_at);
        assert_eq!(stored.last_seen, original_last_seen);
        assert_eq!(stored.labels.get("region").map(String::as_str), Some("eu-west"));
    }

    #[tokio::test]
    async fn test_update_unknown_cluster_is_not_found() {
        let registry = registry_with(MockConnectionFactory::new());
        let err = registry
            .update(Cluster::new("ghost", "https://ghost:6443"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    /// Story: marking a cluster Ready refreshes its heartbeat
    #[tokio::test]
    async fn story_update_status_refreshes_last_seen_on_ready() {
        let mut factory = MockConnectionFactory::new();
        factory
            .expect_connect()
            .returning(|cluster, _| Ok(live_connection(cluster)));
        factory.expect_gather_info().returning(|_, _| Ok(()));

        let registry = registry_with(factory);
        let (cluster, creds) = spoke("spoke-1");
        let registered = registry.register(cluster, creds).await.unwrap();
        let seen_at_register = registered.last_seen.unwrap();

        registry
            .update_status("spoke-1", ClusterStatus::Unreachable)
            .await
            .unwrap();
        let stored = registry.get("spoke-1").await.unwrap();
        assert_eq!(stored.status, ClusterStatus::Unreachable);
        // Unreachable does not refresh the heartbeat
        assert_eq!(stored.last_seen.unwrap(), seen_at_register);

        registry
            .update_status("spoke-1", ClusterStatus::Ready)
            .await
            .unwrap();
        let stored = registry.get("spoke-1").await.unwrap();
        assert_eq!(stored.status, ClusterStatus::Ready);
        assert!(stored.last_seen.unwrap() >= seen_at_register);
    }

    /// Story: a healthy cached connection is stable across calls
    ///
    /// Two get_connection calls return the same Arc; nothing reconnects.
    #[tokio::test]
    async fn story_connection_identity_stable_while_healthy() {
        let mut factory = MockConnectionFactory::new();
        factory
            .expect_connect()
            .times(1)
            .returning(|cluster, _| Ok(live_connection(cluster)));
        factory.expect_gather_info().returning(|_, _| Ok(()));
        factory.expect_probe().returning(|_| Ok(()));

        let registry = registry_with(factory);
        let (cluster, creds) = spoke("spoke-1");
        registry.register(cluster, creds).await.unwrap();

        let first = registry.get_connection("spoke-1").await.unwrap();
        let second = registry.get_connection("spoke-1").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    /// Story: a stale connection is rebuilt through the single rebuild path
    #[tokio::test]
    async fn story_stale_connection_is_rebuilt() {
        let mut factory = MockConnectionFactory::new();
        // Registration connect plus one rebuild connect
        factory
            .expect_connect()
            .times(2)
            .returning(|cluster, _| Ok(live_connection(cluster)));
        factory.expect_gather_info().returning(|_, _| Ok(()));
        // The cached connection fails its probe once, then the rebuilt one
        // stays healthy.
        let mut probes = 0u32;
        factory.expect_probe().returning(move |_| {
            probes += 1;
            if probes == 1 {
                Err(Error::connection("spoke-1", "liveness probe failed"))
            } else {
                Ok(())
            }
        });

        let registry = registry_with(factory);
        let (cluster, creds) = spoke("spoke-1");
        registry.register(cluster, creds).await.unwrap();

        let rebuilt = registry.get_connection("spoke-1").await.unwrap();
        let again = registry.get_connection("spoke-1").await.unwrap();
        assert!(Arc::ptr_eq(&rebuilt, &again));
    }

    #[tokio::test]
    async fn test_get_connection_unknown_cluster_is_not_found() {
        let registry = registry_with(MockConnectionFactory::new());
        let err = registry.get_connection("ghost").await.unwrap_err();
        assert!(err.is_not_found());
    }

    /// Story: close drops connections but not the fleet
    #[tokio::test]
    async fn story_close_clears_cache_but_keeps_state() {
        let mut factory = MockConnectionFactory::new();
        // One connect at registration, one after close
        factory
            .expect_connect()
            .times(2)
            .returning(|cluster, _| Ok(live_connection(cluster)));
        factory.expect_gather_info().returning(|_, _| Ok(()));
        factory.expect_probe().returning(|_| Ok(()));

        let registry = registry_with(factory);
        let (cluster, creds) = spoke("spoke-1");
        registry.register(cluster, creds).await.unwrap();

        registry.close().await;

        // Metadata and credentials survive; the connection is rebuilt.
        assert!(registry.get("spoke-1").await.is_ok());
        let conn = registry.get_connection("spoke-1").await.unwrap();
        assert!(conn.connected);
    }

    #[tokio::test]
    async fn test_list_returns_all_clusters() {
        let mut factory = MockConnectionFactory::new();
        factory
            .expect_connect()
            .returning(|cluster, _| Ok(live_connection(cluster)));
        factory.expect_gather_info().returning(|_, _| Ok(()));

        let registry = registry_with(factory);
        for name in ["spoke-1", "spoke-2", "spoke-3"] {
            let cluster = Cluster::new(name, format!("https://{}:6443", name));
            let creds = ClusterCredentials::from_token(name, "tok", None);
            registry.register(cluster, creds).await.unwrap();
        }

        let mut names: Vec<String> = registry
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        names.sort();
        assert_eq!(names, ["spoke-1", "spoke-2", "spoke-3"]);
    }
}
