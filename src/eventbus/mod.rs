//! Event-driven coordination layer
//!
//! Controllers and sync jobs announce platform/component state changes and
//! schedule background work through the [`EventBus`] contract; downstream
//! consumers (API server, UI relay, metrics collector, webhook dispatcher,
//! audit logger) each hold an independent durable subscription with its own
//! cursor.
//!
//! The contract is transport-agnostic; [`nats`] provides the JetStream
//! implementation used in production.

pub mod nats;
pub mod types;

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::Result;

pub use nats::{NatsConfig, NatsEventBus};
pub use types::{
    AsyncJob, ComponentEvent, Event, EventFilter, EventType, JobType, PlatformEvent,
};

/// Wildcard subject covering per-cluster sync traffic
pub const CLUSTER_SYNC_SUBJECTS: &str = "cluster.*.sync";

/// Wildcard subject covering webhook notifications
pub const WEBHOOK_SUBJECTS: &str = "webhooks.*.notify";

/// Wildcard subject covering metrics export traffic
pub const METRICS_SUBJECTS: &str = "metrics.*.export";

/// Durable consumer names for the downstream systems
///
/// Each name owns an independent cursor on the main stream; renaming one
/// abandons its delivery state.
pub mod consumers {
    /// REST/gRPC API server
    pub const API_SERVER: &str = "api-server";
    /// WebSocket relay feeding the UI
    pub const UI_RELAY: &str = "ui-relay";
    /// Metrics collector
    pub const METRICS_COLLECTOR: &str = "metrics-collector";
    /// Outbound webhook dispatcher
    pub const WEBHOOK_DISPATCHER: &str = "webhook-dispatcher";
    /// Audit trail writer
    pub const AUDIT_LOGGER: &str = "audit-logger";
}

/// Handler invoked per delivered message on a raw subscription
///
/// Receives the subject and payload. Returning an error leaves the message
/// unacknowledged; the broker redelivers it after the ack deadline.
pub type EventHandler =
    Arc<dyn Fn(String, Vec<u8>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Handler invoked per delivered job by a worker
pub type JobHandler = Arc<dyn Fn(AsyncJob) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A running consumer task
///
/// Dropping a `Subscription` detaches it (the task keeps consuming);
/// call [`Subscription::unsubscribe`] to stop it and wait for the
/// in-flight message to finish.
pub struct Subscription {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn new(token: CancellationToken, handle: JoinHandle<()>) -> Self {
        Self { token, handle }
    }

    /// Stop the consumer task and wait for it to drain
    pub async fn unsubscribe(self) {
        self.token.cancel();
        // The task only aborts on panic; a join error here is not
        // actionable by the caller.
        let _ = self.handle.await;
    }
}

/// The coordination-layer contract
///
/// Publishing waits for the broker's durable-write acknowledgment; there is
/// no fire-and-forget path. No internal retry: callers own their backoff
/// policy, and the broker owns redelivery of already-enqueued messages.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a platform lifecycle event to its subject
    async fn publish_platform_event(&self, event: &PlatformEvent) -> Result<()>;

    /// Publish a component state event to its subject
    async fn publish_component_event(&self, event: &ComponentEvent) -> Result<()>;

    /// Subscribe to a subject (wildcards `*`/`>` allowed)
    ///
    /// Every subscription gets its own consumer; two subscriptions to the
    /// same subject each receive every message.
    async fn subscribe(&self, subject: &str, handler: EventHandler) -> Result<Subscription>;

    /// Enqueue a background job
    ///
    /// A successful return means the job is durably recorded, not that it
    /// has been (or ever will be) executed.
    async fn enqueue_job(&self, job: &AsyncJob) -> Result<()>;

    /// Join the worker pool for the job queue
    ///
    /// Work-queue semantics: each job goes to exactly one active worker at
    /// a time; a worker crash before acknowledgment causes redelivery, so
    /// handlers must be safe to re-run.
    async fn process_jobs(&self, handler: JobHandler) -> Result<Subscription>;

    /// Stream decoded events matching a filter over a channel
    ///
    /// The channel closes when the bus closes or the receiver is dropped.
    async fn stream_events(&self, filter: EventFilter) -> Result<mpsc::Receiver<Event>>;

    /// Close the bus: cancel all consumer tasks and drain pending publishes
    ///
    /// Idempotent; subsequent operations fail with a transport error.
    async fn close(&self) -> Result<()>;
}

/// Whether a NATS subject pattern matches a concrete subject
///
/// `*` matches exactly one token, `>` matches one or more trailing tokens.
/// Disjoint subjects never match, which is what keeps per-platform
/// subscriptions from seeing each other's traffic.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
