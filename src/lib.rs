//! Stratus - control plane core for a multi-cluster observability platform
//!
//! Stratus tracks a fleet of remote Kubernetes clusters in a hub-and-spoke
//! topology and coordinates cross-component state changes through a durable
//! event bus.
//!
//! # Architecture
//!
//! The hub cluster runs the registry: spoke clusters are registered with
//! credentials, connected to on demand, and probed for health and installed
//! capabilities. Reconciliation controllers and sync jobs announce state
//! changes and schedule background work over NATS/JetStream; downstream
//! consumers (API server, UI relay, metrics collector, webhook dispatcher,
//! audit logger) each hold an independent durable subscription.
//!
//! # Modules
//!
//! - [`registry`] - Cluster registry: credentials, metadata, live connections
//! - [`eventbus`] - Typed event model, event bus contract, JetStream adapter
//! - [`error`] - Error types shared across the crate
//! - [`retry`] - Exponential backoff with jitter for transient failures
//! - [`telemetry`] - Structured logging initialization

#![deny(missing_docs)]

pub mod error;
pub mod eventbus;
pub mod registry;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace on the hub cluster where registry state lives
/// (per-cluster credential Secrets and the metadata ConfigMap)
pub const STRATUS_SYSTEM_NAMESPACE: &str = "stratus-system";

/// Field manager name used for server-side apply of registry state
pub const FIELD_MANAGER: &str = "stratus-registry";

/// Label key identifying which cluster a credential Secret belongs to
pub const LABEL_CLUSTER_NAME: &str = "stratus.io/cluster-name";

/// Label key marking Secrets that hold cluster credentials
pub const LABEL_SECRET_TYPE: &str = "stratus.io/secret-type";
