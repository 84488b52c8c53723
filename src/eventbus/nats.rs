//! NATS/JetStream implementation of the event bus
//!
//! Two streams back the coordination layer:
//!
//! - The main stream captures all platform, component, cluster-sync,
//!   webhook, and metrics subjects under limits retention: every durable
//!   consumer reads the full history at its own cursor.
//! - The job stream holds `jobs.queue` under work-queue retention: a
//!   message is removed once any worker acknowledges it, which is what
//!   gives each job exactly one active worker at a time.
//!
//! Both streams are provisioned on startup (create-if-absent,
//! update-if-exists) so topology changes roll out with the binary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_nats::jetstream::consumer::{pull, AckPolicy, DeliverPolicy};
use async_nats::jetstream::stream::{Config as StreamConfig, DiscardPolicy, RetentionPolicy, StorageType};
use async_nats::jetstream::{self, AckKind};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::eventbus::types::{
    AsyncJob, ComponentEvent, Event, EventFilter, PlatformEvent, JOBS_SUBJECT,
};
use crate::eventbus::{EventBus, EventHandler, JobHandler, Subscription};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{Error, Result};

/// Durable consumer name for the job worker pool
///
/// All workers share this name; that shared cursor is what makes them
/// compete for jobs instead of each receiving every job.
pub const JOB_WORKERS_CONSUMER: &str = "job-workers";

/// Configuration for the JetStream event bus
#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// Server URL (`nats://` or `tls://`)
    pub url: String,
    /// Connection name shown in server monitoring
    pub client_name: String,
    /// Reconnect attempts before the client gives up (None = unbounded)
    pub max_reconnects: Option<usize>,
    /// Base delay between reconnect attempts
    pub reconnect_delay: Duration,
    /// Refuse to connect without TLS
    pub require_tls: bool,
    /// Name of the main event stream
    pub event_stream: String,
    /// Name of the job-queue stream
    pub job_stream: String,
    /// Byte cap per stream before old messages are discarded
    pub max_stream_bytes: i64,
    /// Message cap on the main stream
    pub max_stream_messages: i64,
    /// Stream replication factor
    pub replicas: usize,
    /// How long a delivered message may stay unacknowledged before
    /// redelivery
    pub ack_wait: Duration,
    /// Buffer size of the channel returned by `stream_events`
    pub stream_buffer: usize,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            client_name: "stratus-operator".to_string(),
            max_reconnects: Some(10),
            reconnect_delay: Duration::from_secs(2),
            require_tls: false,
            event_stream: "STRATUS_EVENTS".to_string(),
            job_stream: "STRATUS_JOBS".to_string(),
            max_stream_bytes: 1024 * 1024 * 1024,
            max_stream_messages: 1_000_000,
            replicas: 3,
            ack_wait: Duration::from_secs(30),
            stream_buffer: 256,
        }
    }
}

/// Desired configuration of the main event stream
pub(crate) fn event_stream_config(config: &NatsConfig) -> StreamConfig {
    StreamConfig {
        name: config.event_stream.clone(),
        subjects: vec![
            "platform.>".into(),
            "component.>".into(),
            "cluster.>".into(),
            "webhooks.>".into(),
            "metrics.>".into(),
        ],
        retention: RetentionPolicy::Limits,
        max_age: Duration::from_secs(7 * 24 * 60 * 60),
        max_messages: config.max_stream_messages,
        max_bytes: config.max_stream_bytes,
        max_consumers: 100,
        discard: DiscardPolicy::Old,
        storage: StorageType::File,
        num_replicas: config.replicas,
        ..Default::default()
    }
}

/// Desired configuration of the job-queue stream
///
/// Work-queue retention removes each job on first acknowledgment; the
/// 24-hour age cap is a safety net against jobs nobody consumes.
pub(crate) fn job_stream_config(config: &NatsConfig) -> StreamConfig {
    StreamConfig {
        name: config.job_stream.clone(),
        subjects: vec![JOBS_SUBJECT.into()],
        retention: RetentionPolicy::WorkQueue,
        max_age: Duration::from_secs(24 * 60 * 60),
        max_messages: 10_000,
        max_bytes: config.max_stream_bytes,
        discard: DiscardPolicy::Old,
        storage: StorageType::File,
        num_replicas: config.replicas,
        ..Default::default()
    }
}

/// Event bus backed by NATS/JetStream
pub struct NatsEventBus {
    jetstream: jetstream::Context,
    client: async_nats::Client,
    config: NatsConfig,
    root: CancellationToken,
    closed: AtomicBool,
}

impl NatsEventBus {
    /// Connect to the broker and provision both streams
    ///
    /// Connection attempts are retried with backoff; stream provisioning
    /// failures are terminal (a bus without its streams delivers nothing).
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let client = retry_with_backoff(&RetryConfig::default(), "nats-connect", || {
            connect_once(&config)
        })
        .await
        .map_err(|e| Error::transport(&config.url, format!("failed to connect: {}", e)))?;

        info!(url = %config.url, name = %config.client_name, "connected to nats");

        let jetstream = jetstream::new(client.clone());
        let bus = Self {
            jetstream,
            client,
            config,
            root: CancellationToken::new(),
            closed: AtomicBool::new(false),
        };

        bus.ensure_stream(event_stream_config(&bus.config)).await?;
        bus.ensure_stream(job_stream_config(&bus.config)).await?;
        Ok(bus)
    }

    async fn ensure_stream(&self, desired: StreamConfig) -> Result<()> {
        let name = desired.name.clone();
        match self.jetstream.create_stream(desired.clone()).await {
            Ok(_) => {
                info!(stream = %name, "stream created");
                Ok(())
            }
            // Already exists (possibly with an older shape): converge it.
            Err(create_err) => match self.jetstream.update_stream(&desired).await {
                Ok(_) => {
                    debug!(stream = %name, "stream updated");
                    Ok(())
                }
                Err(update_err) => Err(Error::transport(
                    &name,
                    format!(
                        "stream provisioning failed: create: {}; update: {}",
                        create_err, update_err
                    ),
                )),
            },
        }
    }

    fn check_open(&self, subject: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::transport(subject, "event bus is closed"));
        }
        Ok(())
    }

    async fn publish(&self, subject: String, payload: Vec<u8>) -> Result<()> {
        self.check_open(&subject)?;
        let ack = self
            .jetstream
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|e| Error::transport(&subject, format!("publish failed: {}", e)))?;
        // The first await sends; this one waits for the durable-write ack.
        ack.await
            .map_err(|e| Error::transport(&subject, format!("publish not acknowledged: {}", e)))?;
        Ok(())
    }

    /// Subscribe with a named durable cursor on the main stream
    ///
    /// Downstream systems (see [`crate::eventbus::consumers`]) use this to
    /// resume where they left off across restarts. Two processes sharing a
    /// durable name compete for messages; distinct names each see all of
    /// them.
    pub async fn subscribe_durable(
        &self,
        subject: &str,
        durable_name: &str,
        handler: EventHandler,
    ) -> Result<Subscription> {
        self.check_open(subject)?;
        let consumer_config = pull::Config {
            durable_name: Some(durable_name.to_string()),
            filter_subject: subject.to_string(),
            ack_policy: AckPolicy::Explicit,
            ack_wait: self.config.ack_wait,
            deliver_policy: DeliverPolicy::All,
            ..Default::default()
        };
        self.spawn_consumer(&self.config.event_stream, consumer_config, handler)
            .await
    }

    async fn spawn_consumer(
        &self,
        stream_name: &str,
        consumer_config: pull::Config,
        handler: EventHandler,
    ) -> Result<Subscription> {
        let stream = self
            .jetstream
            .get_stream(stream_name)
            .await
            .map_err(|e| Error::transport(stream_name, format!("stream lookup failed: {}", e)))?;

        let subject = consumer_config.filter_subject.clone();
        let consumer = stream
            .create_consumer(consumer_config)
            .await
            .map_err(|e| Error::transport(&subject, format!("consumer creation failed: {}", e)))?;

        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| Error::transport(&subject, format!("consumer stream failed: {}", e)))?;

        let token = self.root.child_token();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => {
                        debug!(subject = %subject, "subscription cancelled");
                        return;
                    }
                    next = messages.next() => {
                        let message = match next {
                            Some(Ok(message)) => message,
                            Some(Err(e)) => {
                                warn!(subject = %subject, error = %e, "message delivery error");
                                continue;
                            }
                            None => {
                                debug!(subject = %subject, "consumer stream ended");
                                return;
                            }
                        };

                        let msg_subject = message.subject.to_string();
                        let payload = message.payload.to_vec();
                        match handler(msg_subject.clone(), payload).await {
                            Ok(()) => {
                                if let Err(e) = message.ack().await {
                                    warn!(subject = %msg_subject, error = %e, "ack failed");
                                }
                            }
                            // Leave unacked: the broker redelivers after
                            // ack_wait.
                            Err(e) => {
                                warn!(
                                    subject = %msg_subject,
                                    error = %e,
                                    "handler failed, message left for redelivery"
                                );
                            }
                        }
                    }
                }
            }
        });

        Ok(Subscription::new(token, handle))
    }
}

#[async_trait]
impl EventBus for NatsEventBus {
    async fn publish_platform_event(&self, event: &PlatformEvent) -> Result<()> {
        let subject = event.subject();
        let payload =
            serde_json::to_vec(event).map_err(|e| Error::serialization(e.to_string()))?;
        debug!(subject = %subject, event_type = ?event.event_type, "publishing platform event");
        self.publish(subject, payload).await
    }

    async fn publish_component_event(&self, event: &ComponentEvent) -> Result<()> {
        let subject = event.subject();
        let payload =
            serde_json::to_vec(event).map_err(|e| Error::serialization(e.to_string()))?;
        debug!(subject = %subject, component = %event.component, "publishing component event");
        self.publish(subject, payload).await
    }

    async fn subscribe(&self, subject: &str, handler: EventHandler) -> Result<Subscription> {
        self.check_open(subject)?;
        // Ephemeral consumer: this subscription's cursor dies with it.
        let consumer_config = pull::Config {
            durable_name: None,
            filter_subject: subject.to_string(),
            ack_policy: AckPolicy::Explicit,
            ack_wait: self.config.ack_wait,
            deliver_policy: DeliverPolicy::All,
            ..Default::default()
        };
        self.spawn_consumer(&self.config.event_stream, consumer_config, handler)
            .await
    }

    async fn enqueue_job(&self, job: &AsyncJob) -> Result<()> {
        let payload = serde_json::to_vec(job).map_err(|e| Error::serialization(e.to_string()))?;
        debug!(job_id = %job.id, job_type = ?job.job_type, "enqueueing job");
        self.publish(JOBS_SUBJECT.to_string(), payload).await
    }

    async fn process_jobs(&self, handler: JobHandler) -> Result<Subscription> {
        self.check_open(JOBS_SUBJECT)?;
        let wrapped: EventHandler = std::sync::Arc::new(move |subject, payload| {
            let handler = handler.clone();
            Box::pin(async move {
                let job: AsyncJob = serde_json::from_slice(&payload)
                    .map_err(|e| Error::serialization(format!("{}: {}", subject, e)))?;
                handler(job).await
            })
        });

        // A malformed payload will never deserialize on any redelivery;
        // terminate it instead of letting it poison the queue. Handler
        // failures stay unacked for redelivery to another worker.
        let stream = self
            .jetstream
            .get_stream(&self.config.job_stream)
            .await
            .map_err(|e| {
                Error::transport(&self.config.job_stream, format!("stream lookup failed: {}", e))
            })?;
        let consumer = stream
            .create_consumer(pull::Config {
                durable_name: Some(JOB_WORKERS_CONSUMER.to_string()),
                filter_subject: JOBS_SUBJECT.to_string(),
                ack_policy: AckPolicy::Explicit,
                ack_wait: self.config.ack_wait,
                deliver_policy: DeliverPolicy::All,
                ..Default::default()
            })
            .await
            .map_err(|e| Error::transport(JOBS_SUBJECT, format!("consumer creation failed: {}", e)))?;

        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| Error::transport(JOBS_SUBJECT, format!("consumer stream failed: {}", e)))?;

        let token = self.root.child_token();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => {
                        debug!("job worker cancelled");
                        return;
                    }
                    next = messages.next() => {
                        let message = match next {
                            Some(Ok(message)) => message,
                            Some(Err(e)) => {
                                warn!(error = %e, "job delivery error");
                                continue;
                            }
                            None => {
                                debug!("job consumer stream ended");
                                return;
                            }
                        };

                        let subject = message.subject.to_string();
                        let payload = message.payload.to_vec();
                        match wrapped(subject, payload).await {
                            Ok(()) => {
                                if let Err(e) = message.ack().await {
                                    warn!(error = %e, "job ack failed");
                                }
                            }
                            Err(e) if !e.is_retryable() => {
                                warn!(error = %e, "terminally rejecting malformed job");
                                if let Err(e) = message.ack_with(AckKind::Term).await {
                                    warn!(error = %e, "job term-ack failed");
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "job handler failed, left for redelivery");
                            }
                        }
                    }
                }
            }
        });

        Ok(Subscription::new(token, handle))
    }

    async fn stream_events(&self, filter: EventFilter) -> Result<mpsc::Receiver<Event>> {
        self.check_open(&self.config.event_stream)?;
        let stream = self
            .jetstream
            .get_stream(&self.config.event_stream)
            .await
            .map_err(|e| {
                Error::transport(&self.config.event_stream, format!("stream lookup failed: {}", e))
            })?;

        // Live tail: no acks, start from new messages only. A dropped
        // receiver ends the task.
        let consumer = stream
            .create_consumer(pull::Config {
                durable_name: None,
                filter_subjects: vec!["platform.>".to_string(), "component.>".to_string()],
                ack_policy: AckPolicy::None,
                deliver_policy: DeliverPolicy::New,
                ..Default::default()
            })
            .await
            .map_err(|e| {
                Error::transport(&self.config.event_stream, format!("consumer creation failed: {}", e))
            })?;

        let mut messages = consumer.messages().await.map_err(|e| {
            Error::transport(&self.config.event_stream, format!("consumer stream failed: {}", e))
        })?;

        let (tx, rx) = mpsc::channel(self.config.stream_buffer);
        let token = self.root.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tx.closed() => return,
                    next = messages.next() => {
                        let message = match next {
                            Some(Ok(message)) => message,
                            Some(Err(e)) => {
                                warn!(error = %e, "event stream delivery error");
                                continue;
                            }
                            None => return,
                        };
                        let event = match Event::decode(&message.subject, &message.payload) {
                            Ok(event) => event,
                            Err(e) => {
                                warn!(subject = %message.subject, error = %e, "undecodable event skipped");
                                continue;
                            }
                        };
                        if event.matches(&filter) {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.root.cancel();
        self.client
            .flush()
            .await
            .map_err(|e| Error::transport(&self.config.url, format!("flush failed: {}", e)))?;
        info!("event bus closed");
        Ok(())
    }
}

async fn connect_once(config: &NatsConfig) -> std::result::Result<async_nats::Client, async_nats::ConnectError> {
    let delay = config.reconnect_delay;
    let mut options = async_nats::ConnectOptions::new()
        .name(&config.client_name)
        .max_reconnects(config.max_reconnects)
        .reconnect_delay_callback(move |attempts| delay.saturating_mul(attempts as u32))
        .event_callback(|event| async move {
            match event {
                async_nats::Event::Connected => info!("nats connection restored"),
                async_nats::Event::Disconnected => warn!("nats connection lost"),
                other => debug!(event = %other, "nats connection event"),
            }
        });
    if config.require_tls {
        options = options.require_tls(true);
    }
    options.connect(&config.url).await
}
