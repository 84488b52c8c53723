//! Periodic health probing for registered clusters
//!
//! The health checker sweeps the fleet on an interval: each cluster gets a
//! connection probe (via the registry's cache-first path), a refreshed info
//! snapshot, and a status write-back. Results are reported as
//! [`ClusterHealth`] records for consumers such as the API server and
//! metrics collector.
//!
//! A cluster that cannot be reached is recorded as Unreachable and the
//! sweep moves on; a single bad spoke never aborts the sweep.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::types::ClusterStatus;
use crate::registry::ClusterRegistry;
use crate::Result;

/// Node readiness summary for one cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeSummary {
    /// Total nodes
    pub total: i32,
    /// Nodes with a Ready=True condition
    pub ready: i32,
    /// Nodes without one
    pub not_ready: i32,
}

/// Outcome of one health check against one cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterHealth {
    /// The probed cluster
    pub cluster_name: String,
    /// Status derived from this check
    pub status: ClusterStatus,
    /// Whether the API server answered the liveness probe
    pub api_reachable: bool,
    /// Round-trip time of the probe and refresh, when reachable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    /// Node readiness at check time
    pub nodes: NodeSummary,
    /// When the check ran
    pub checked_at: DateTime<Utc>,
}

/// Sweeps registered clusters and writes health status back to the registry
pub struct HealthChecker {
    registry: Arc<ClusterRegistry>,
}

impl HealthChecker {
    /// Create a checker over the given registry
    pub fn new(registry: Arc<ClusterRegistry>) -> Self {
        Self { registry }
    }

    /// Check one cluster: probe, refresh its snapshot, write status back
    ///
    /// An unreachable cluster yields an Unreachable health record (and
    /// status write-back) rather than an error; errors are reserved for an
    /// unknown cluster name or a failing metadata store.
    pub async fn check_cluster(&self, name: &str) -> Result<ClusterHealth> {
        // Fail fast on unknown names before any network traffic.
        self.registry.get(name).await?;

        let started = Instant::now();
        let refreshed = match self.registry.refresh_cluster_info(name).await {
            Ok(cluster) => cluster,
            Err(e) if e.is_retryable() => {
                debug!(cluster = %name, error = %e, "health probe failed");
                self.write_status(name, ClusterStatus::Unreachable).await;
                return Ok(ClusterHealth {
                    cluster_name: name.to_string(),
                    status: ClusterStatus::Unreachable,
                    api_reachable: false,
                    latency_ms: None,
                    nodes: NodeSummary::default(),
                    checked_at: Utc::now(),
                });
            }
            Err(e) => return Err(e),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        let nodes = refreshed
            .metrics
            .as_ref()
            .map(|m| NodeSummary {
                total: m.node_count,
                ready: m.node_ready,
                not_ready: m.node_count - m.node_ready,
            })
            .unwrap_or_default();

        // Reachable with unhealthy nodes is a failure condition, not an
        // outage.
        let status = if nodes.not_ready > 0 {
            ClusterStatus::Error
        } else {
            ClusterStatus::Ready
        };
        self.write_status(name, status).await;

        Ok(ClusterHealth {
            cluster_name: name.to_string(),
            status,
            api_reachable: true,
            latency_ms: Some(latency_ms),
            nodes,
            checked_at: Utc::now(),
        })
    }

    /// Check every registered cluster, continuing past individual failures
    pub async fn check_all(&self) -> Result<Vec<ClusterHealth>> {
        let clusters = self.registry.list().await?;
        let mut results = Vec::with_capacity(clusters.len());
        for cluster in clusters {
            match self.check_cluster(&cluster.name).await {
                Ok(health) => results.push(health),
                Err(e) => {
                    warn!(cluster = %cluster.name, error = %e, "health check failed");
                }
            }
        }
        Ok(results)
    }

    /// Run periodic sweeps until cancelled
    pub async fn run(&self, interval: Duration, shutdown: CancellationToken) {
        info!(interval_secs = interval.as_secs(), "health checker started");
        let mut ticker = tokio::time::interval(interval);
        // Ticker fires immediately; the first sweep runs at startup.
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("health checker stopped");
                    return;
                }
                _ = ticker.tick() => {
                    match self.check_all().await {
                        Ok(results) => {
                            let unhealthy = results
                                .iter()
                                .filter(|h| h.status != ClusterStatus::Ready)
                                .count();
                            debug!(
                                checked = results.len(),
                                unhealthy = unhealthy,
                                "health sweep complete"
                            );
                        }
                        Err(e) => warn!(error = %e, "health sweep failed"),
                    }
                }
            }
        }
    }

    async fn write_status(&self, name: &str, status: ClusterStatus) {
        if let Err(e) = self.registry.update_status(name, status).await {
            warn!(cluster = %name, error = %e, "failed to record health status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::connection::MockConnectionFactory;
    use crate::registry::types::{Cluster, ClusterConnection, ClusterCredentials, ClusterMetrics};
    use crate::registry::{MemoryCredentialStore, MemoryMetadataStore};
    use crate::Error;

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

    fn metrics(total: i32, ready: i32) -> ClusterMetrics {
        ClusterMetrics {
            node_count: total,
            node_ready: ready,
            cpu_capacity: 8.0,
            memory_capacity: 32 * (1 << 30),
            pod_count: 10,
            last_updated: Utc::now(),
        }
    }

    async fn registered_registry(factory: MockConnectionFactory) -> Arc<ClusterRegistry> {
        let registry = Arc::new(ClusterRegistry::new(
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(MemoryMetadataStore::new()),
            Arc::new(factory),
        ));
        let cluster = Cluster::new("spoke-1", "https://10.0.0.1:6443");
        let creds = ClusterCredentials::from_token("spoke-1", "tok", None);
        registry.register(cluster, creds).await.unwrap();
        registry
    }

    /// Story: a healthy cluster stays Ready with a node summary attached
    #[tokio::test]
    async fn story_healthy_cluster_reports_ready() {
        let mut factory = MockConnectionFactory::new();
        factory
            .expect_connect()
            .returning(|cluster, _| Ok(live_connection(cluster)));
        factory.expect_probe().returning(|_| Ok(()));
        factory.expect_gather_info().returning(|cluster, _| {
            cluster.metrics = Some(metrics(3, 3));
            Ok(())
        });

        let registry = registered_registry(factory).await;
        let checker = HealthChecker::new(registry.clone());

        let health = checker.check_cluster("spoke-1").await.unwrap();
        assert_eq!(health.status, ClusterStatus::Ready);
        assert!(health.api_reachable);
        assert!(health.latency_ms.is_some());
        assert_eq!(health.nodes, NodeSummary { total: 3, ready: 3, not_ready: 0 });

        let stored = registry.get("spoke-1").await.unwrap();
        assert_eq!(stored.status, ClusterStatus::Ready);
    }

    /// Story: not-ready nodes surface as a failure condition, not an outage
    #[tokio::test]
    async fn story_unhealthy_nodes_report_error_status() {
        let mut factory = MockConnectionFactory::new();
        factory
            .expect_connect()
            .returning(|cluster, _| Ok(live_connection(cluster)));
        factory.expect_probe().returning(|_| Ok(()));
        let mut sweeps = 0u32;
        factory.expect_gather_info().returning(move |cluster, _| {
            sweeps += 1;
            // Registration sees a healthy fleet; the sweep sees one node down.
            cluster.metrics = Some(if sweeps == 1 {
                metrics(3, 3)
            } else {
                metrics(3, 2)
            });
            Ok(())
        });

        let registry = registered_registry(factory).await;
        let checker = HealthChecker::new(registry.clone());

        let health = checker.check_cluster("spoke-1").await.unwrap();
        assert_eq!(health.status, ClusterStatus::Error);
        assert!(health.api_reachable);
        assert_eq!(health.nodes.not_ready, 1);

        let stored = registry.get("spoke-1").await.unwrap();
        assert_eq!(stored.status, ClusterStatus::Error);
    }

    /// Story: an unreachable cluster is recorded, and the check never panics
    #[tokio::test]
    async fn story_unreachable_cluster_recorded_not_raised() {
        let mut factory = MockConnectionFactory::new();
        let mut connects = 0u32;
        factory.expect_connect().returning(move |cluster, _| {
            connects += 1;
            if connects == 1 {
                Ok(live_connection(cluster))
            } else {
                Err(Error::connection(&cluster.name, "connection refused"))
            }
        });
        // Cached connection has gone stale by sweep time
        factory
            .expect_probe()
            .returning(|_| Err(Error::connection("spoke-1", "liveness probe failed")));
        factory.expect_gather_info().returning(|cluster, _| {
            cluster.metrics = Some(metrics(3, 3));
            Ok(())
        });

        let registry = registered_registry(factory).await;
        let checker = HealthChecker::new(registry.clone());

        let health = checker.check_cluster("spoke-1").await.unwrap();
        assert_eq!(health.status, ClusterStatus::Unreachable);
        assert!(!health.api_reachable);
        assert_eq!(health.latency_ms, None);

        let stored = registry.get("spoke-1").await.unwrap();
        assert_eq!(stored.status, ClusterStatus::Unreachable);
    }

    #[tokio::test]
    async fn test_check_unknown_cluster_is_not_found() {
        let registry = Arc::new(ClusterRegistry::new(
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(MemoryMetadataStore::new()),
            Arc::new(MockConnectionFactory::new()),
        ));
        let checker = HealthChecker::new(registry);
        let err = checker.check_cluster("ghost").await.unwrap_err();
        assert!(err.is_not_found());
    }

    /// Story: one bad spoke never aborts the sweep
    ///
    /// Both clusters register while healthy; spoke-down then goes dark.
    /// The sweep records it Unreachable and still checks spoke-up.
    #[tokio::test]
    async fn story_check_all_continues_past_failures() {
        let mut factory = MockConnectionFactory::new();
        let mut down_connects = 0u32;
        factory.expect_connect().returning(move |cluster, _| {
            if cluster.name == "spoke-down" {
                down_connects += 1;
                if down_connects > 1 {
                    return Err(Error::connection(&cluster.name, "connection refused"));
                }
            }
            Ok(live_connection(cluster))
        });
        factory.expect_probe().returning(|conn| {
            if conn.cluster.name == "spoke-down" {
                Err(Error::connection(&conn.cluster.name, "probe failed"))
            } else {
                Ok(())
            }
        });
        factory.expect_gather_info().returning(|cluster, _| {
            cluster.metrics = Some(metrics(2, 2));
            Ok(())
        });

        let registry = Arc::new(ClusterRegistry::new(
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(MemoryMetadataStore::new()),
            Arc::new(factory),
        ));
        for name in ["spoke-up", "spoke-down"] {
            let cluster = Cluster::new(name, format!("https://{}:6443", name));
            let creds = ClusterCredentials::from_token(name, "tok", None);
            registry.register(cluster, creds).await.unwrap();
        }

        let checker = HealthChecker::new(registry.clone());
        let mut results = checker.check_all().await.unwrap();
        results.sort_by(|a, b| a.cluster_name.cmp(&b.cluster_name));
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].cluster_name, "spoke-down");
        assert_eq!(results[0].status, ClusterStatus::Unreachable);
        assert_eq!(results[1].cluster_name, "spoke-up");
        assert_eq!(results[1].status, ClusterStatus::Ready);

        let down = registry.get("spoke-down").await.unwrap();
        assert_eq!(down.status, ClusterStatus::Unreachable);
    }

    /// Story: the run loop sweeps immediately and stops on cancellation
    #[tokio::test]
    async fn story_run_loop_stops_on_cancellation() {
        let mut factory = MockConnectionFactory::new();
        factory
            .expect_connect()
            .returning(|cluster, _| Ok(live_connection(cluster)));
        factory.expect_probe().returning(|_| Ok(()));
        factory.expect_gather_info().returning(|cluster, _| {
            cluster.metrics = Some(metrics(1, 1));
            Ok(())
        });

        let registry = registered_registry(factory).await;
        let checker = HealthChecker::new(registry.clone());

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            checker.run(Duration::from_secs(3600), token).await;
        });

        // Give the immediate first sweep a chance to run, then cancel.
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        handle.await.unwrap();

        let stored = registry.get("spoke-1").await.unwrap();
        assert_eq!(stored.status, ClusterStatus::Ready);
    }
}
