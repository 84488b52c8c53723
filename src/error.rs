//! Error types for the Stratus control plane
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the context a calling controller needs to decide
//! between retrying, alerting, and failing permanently: cluster names,
//! operation names, subjects, and underlying causes.

use thiserror::Error;

/// Main error type for Stratus operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error on the hub cluster
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for a cluster or credential payload
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Name of the cluster with invalid configuration
        cluster: String,
        /// Description of what's invalid
        message: String,
    },

    /// Credential store failure (put/get/delete of secret material)
    #[error("credential store error for {cluster}: {message}")]
    CredentialStore {
        /// Cluster whose credentials were being accessed
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// Metadata store failure (cluster descriptive state)
    #[error("metadata store error [{operation}]: {message}")]
    MetadataStore {
        /// The store operation that failed (get, list, put, remove)
        operation: String,
        /// Description of what failed
        message: String,
    },

    /// Connectivity error: a spoke cluster could not be reached or probed
    #[error("connection error for {cluster}: {message}")]
    Connection {
        /// Name of the unreachable cluster
        cluster: String,
        /// Description of what failed (wraps the liveness-probe failure)
        message: String,
    },

    /// A cluster name that is not present in the registry
    #[error("cluster {cluster} not found")]
    NotFound {
        /// The unknown cluster name
        cluster: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Messaging transport failure (publish, subscribe, stream provisioning)
    #[error("transport error [{subject}]: {message}")]
    Transport {
        /// The subject or stream involved
        subject: String,
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Context where the error occurred (e.g., "health-checker")
        context: String,
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a validation error for a cluster
    pub fn validation(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a credential store error for a cluster
    pub fn credential_store(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::CredentialStore {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a metadata store error with the failing operation name
    pub fn metadata_store(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::MetadataStore {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a connection error for a cluster
    pub fn connection(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Connection {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a not-found error for a cluster name
    pub fn not_found(cluster: impl Into<String>) -> Self {
        Self::NotFound {
            cluster: cluster.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a transport error with the subject or stream involved
    pub fn transport(subject: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transport {
            subject: subject.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Check whether this error is a distinguishable not-found condition
    ///
    /// `Get`/`Update`/`UpdateStatus` on an unknown cluster return NotFound
    /// rather than a generic error, so controllers can treat "gone" and
    /// "broken" differently.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors are not retryable (require a
    /// config or code fix). Store, connection, and transport errors may
    /// recover. Kubernetes errors depend on the response code.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Retry on transient K8s errors (connection, timeout).
                // Don't retry on 4xx errors (validation, not found, conflict).
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::Validation { .. } => false,
            Error::CredentialStore { .. } => true,
            Error::MetadataStore { .. } => true,
            Error::Connection { .. } => true,
            Error::NotFound { .. } => false,
            Error::Serialization { .. } => false,
            Error::Transport { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// Get the cluster name if this error is associated with one
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::Validation { cluster, .. } => Some(cluster),
            Error::CredentialStore { cluster, .. } => Some(cluster),
            Error::Connection { cluster, .. } => Some(cluster),
            Error::NotFound { cluster } => Some(cluster),
            _ => None,
        }
    }
}
