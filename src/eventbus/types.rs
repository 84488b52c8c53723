//! Typed event model for the coordination layer
//!
//! Everything crossing the bus is JSON with stable field names; the
//! subject encodes the routing dimensions (namespace, platform, component)
//! so consumers can filter server-side with wildcards before deserializing
//! anything.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Subject prefix for platform lifecycle events
pub const PLATFORM_SUBJECT_PREFIX: &str = "platform.";

/// Subject prefix for component state events
pub const COMPONENT_SUBJECT_PREFIX: &str = "component.";

/// Subject for the background job queue
pub const JOBS_SUBJECT: &str = "jobs.queue";

/// What happened to a platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Platform created
    Created,
    /// Platform spec updated
    Updated,
    /// Platform deleted
    Deleted,
    /// Platform scaled up or down
    Scaled,
    /// Backup taken
    Backup,
    /// Restore performed
    Restore,
}

/// Kind of background work carried by an [`AsyncJob`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Back up a platform's data stores
    Backup,
    /// Restore a platform from a backup
    Restore,
    /// Probe a platform's components
    HealthCheck,
    /// Remove expired data and orphaned resources
    Cleanup,
    /// Upgrade component versions
    Upgrade,
}

/// A platform lifecycle event
///
/// Published to `platform.<namespace>.<name>.events`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformEvent {
    /// What happened
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Platform name
    pub name: String,
    /// Platform namespace
    pub namespace: String,
    /// Phase the platform is in after the event
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phase: String,
    /// Human-readable description
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Free-form context for consumers
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    /// When the event occurred
    #[serde(rename = "timestamp")]
    pub event_time: DateTime<Utc>,
}

impl PlatformEvent {
    /// Create an event for a platform, stamped now
    pub fn new(
        event_type: EventType,
        name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            name: name.into(),
            namespace: namespace.into(),
            phase: String::new(),
            message: String::new(),
            metadata: HashMap::new(),
            event_time: Utc::now(),
        }
    }

    /// The subject this event publishes to
    pub fn subject(&self) -> String {
        format!(
            "{}{}.{}.events",
            PLATFORM_SUBJECT_PREFIX, self.namespace, self.name
        )
    }
}

/// A component state-change event
///
/// Published to `component.<namespace>.<platform>.<component>.state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentEvent {
    /// Owning platform
    pub platform: String,
    /// Platform namespace
    pub namespace: String,
    /// Component name (e.g., "prometheus", "grafana")
    pub component: String,
    /// Component state (e.g., "Running", "Degraded")
    pub state: String,
    /// Whether the component is serving
    pub ready: bool,
    /// Human-readable description
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// When the state change occurred
    #[serde(rename = "timestamp")]
    pub event_time: DateTime<Utc>,
}

impl ComponentEvent {
    /// Create a state event for a component, stamped now
    pub fn new(
        platform: impl Into<String>,
        namespace: impl Into<String>,
        component: impl Into<String>,
        state: impl Into<String>,
        ready: bool,
    ) -> Self {
        Self {
            platform: platform.into(),
            namespace: namespace.into(),
            component: component.into(),
            state: state.into(),
            ready,
            message: String::new(),
            event_time: Utc::now(),
        }
    }

    /// The subject this event publishes to
    pub fn subject(&self) -> String {
        format!(
            "{}{}.{}.{}.state",
            COMPONENT_SUBJECT_PREFIX, self.namespace, self.platform, self.component
        )
    }
}

/// Any event the coordination layer carries
///
/// Closed sum: new event kinds are added here, not discovered at runtime.
/// Consumers match exhaustively and the compiler flags every site a new
/// variant must handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Event {
    /// A platform lifecycle event
    Platform(PlatformEvent),
    /// A component state-change event
    Component(ComponentEvent),
}

impl Event {
    /// The subject this event publishes to
    pub fn subject(&self) -> String {
        match self {
            Event::Platform(e) => e.subject(),
            Event::Component(e) => e.subject(),
        }
    }

    /// When the event occurred
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::Platform(e) => e.event_time,
            Event::Component(e) => e.event_time,
        }
    }

    /// Serialize to the JSON wire form
    pub fn serialize(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::serialization(e.to_string()))
    }

    /// Decode a message from its subject and payload
    ///
    /// The subject prefix selects the variant; the payload shapes overlap
    /// enough that subject-driven dispatch is the only reliable decode.
    pub fn decode(subject: &str, payload: &[u8]) -> Result<Self> {
        if subject.starts_with(PLATFORM_SUBJECT_PREFIX) {
            let event: PlatformEvent = serde_json::from_slice(payload)
                .map_err(|e| Error::serialization(format!("{}: {}", subject, e)))?;
            Ok(Event::Platform(event))
        } else if subject.starts_with(COMPONENT_SUBJECT_PREFIX) {
            let event: ComponentEvent = serde_json::from_slice(payload)
                .map_err(|e| Error::serialization(format!("{}: {}", subject, e)))?;
            Ok(Event::Component(event))
        } else {
            Err(Error::serialization(format!(
                "subject {} carries no known event kind",
                subject
            )))
        }
    }

    /// Whether this event passes the given filter
    pub fn matches(&self, filter: &EventFilter) -> bool {
        match self {
            Event::Platform(e) => {
                filter.matches_namespace(&e.namespace)
                    && filter.matches_platform(&e.name)
                    && filter.matches_event_type(e.event_type)
            }
            Event::Component(e) => {
                filter.matches_namespace(&e.namespace)
                    && filter.matches_platform(&e.platform)
                    && filter.matches_component(&e.component)
            }
        }
    }
}

/// A background job scheduled through the work queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncJob {
    /// Unique job identifier
    pub id: String,
    /// Kind of work
    #[serde(rename = "type")]
    pub job_type: JobType,
    /// Platform the job operates on
    pub platform: String,
    /// Platform namespace
    pub namespace: String,
    /// Job-specific parameters
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub payload: HashMap<String, serde_json::Value>,
    /// When the job was enqueued
    pub created_at: DateTime<Utc>,
    /// How many delivery attempts a worker should tolerate before
    /// terminally rejecting the job
    pub max_retries: u32,
}

impl AsyncJob {
    /// Create a job with a fresh id, stamped now
    pub fn new(
        job_type: JobType,
        platform: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job_type,
            platform: platform.into(),
            namespace: namespace.into(),
            payload: HashMap::new(),
            created_at: Utc::now(),
            max_retries: 3,
        }
    }

    /// Attach a payload parameter
    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }
}

/// Selects which events a streaming consumer wants
///
/// Each empty field matches everything on that dimension; an empty filter
/// matches all events. `event_types` applies to platform events only
/// (component events have no event type).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    /// Namespaces to include (empty = all)
    pub namespaces: Vec<String>,
    /// Platform names to include (empty = all)
    pub platforms: Vec<String>,
    /// Component names to include (empty = all)
    pub components: Vec<String>,
    /// Platform event types to include (empty = all)
    pub event_types: Vec<EventType>,
}

impl EventFilter {
    fn matches_namespace(&self, namespace: &str) -> bool {
        self.namespaces.is_empty() || self.namespaces.iter().any(|n| n == namespace)
    }

    fn matches_platform(&self, platform: &str) -> bool {
        self.platforms.is_empty() || self.platforms.iter().any(|p| p == platform)
    }

    fn matches_component(&self, component: &str) -> bool {
        self.components.is_empty() || self.components.iter().any(|c| c == component)
    }

    fn matches_event_type(&self, event_type: EventType) -> bool {
        self.event_types.is_empty() || self.event_types.contains(&event_type)
    }
}
