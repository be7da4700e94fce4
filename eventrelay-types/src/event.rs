use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::{EventId, EventType, LeaseOwner, PartitionKey, SchemaVersion, Timestamp};

/// Trait implemented by business events that are recorded in the outbox.
///
/// The payload is the `serde` representation of the implementing type. The
/// partition key decides ordering: two events with the same key are always
/// published in the order they were appended.
///
/// # Example
///
/// ```ignore
/// #[derive(Serialize)]
/// struct OrderPlaced { order_id: String, tenant: String }
///
/// impl DomainEvent for OrderPlaced {
///     fn event_type(&self) -> EventType {
///         EventType::try_new("OrderPlaced").expect("valid event type")
///     }
///
///     fn partition_key(&self) -> PartitionKey {
///         PartitionKey::try_new(self.order_id.clone()).expect("order ids are non-empty")
///     }
/// }
/// ```
pub trait DomainEvent: Serialize + Send + Sync {
    /// Name identifying the payload shape.
    fn event_type(&self) -> EventType;

    /// Payload schema version. Defaults to `"1"`.
    fn schema_version(&self) -> SchemaVersion {
        SchemaVersion::initial()
    }

    /// Key used for per-partition ordering and broker partition routing.
    fn partition_key(&self) -> PartitionKey;
}

/// String headers travelling with an event (correlation id, tenant id, ...).
///
/// Backed by a `BTreeMap` so iteration and serialization order are stable
/// regardless of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    /// Header correlating every event produced by one logical request.
    pub const CORRELATION_ID: &'static str = "correlation-id";
    /// Header naming the message that caused this event.
    pub const CAUSATION_ID: &'static str = "causation-id";
    /// Header naming the tenant that owns the event.
    pub const TENANT_ID: &'static str = "tenant-id";
    /// Header declaring the payload content type.
    pub const CONTENT_TYPE: &'static str = "content-type";

    /// Creates an empty header set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a header.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Sets the correlation id header.
    #[must_use]
    pub fn with_correlation_id(self, correlation_id: impl Into<String>) -> Self {
        self.with(Self::CORRELATION_ID, correlation_id)
    }

    /// Sets the causation id header.
    #[must_use]
    pub fn with_causation_id(self, causation_id: impl Into<String>) -> Self {
        self.with(Self::CAUSATION_ID, causation_id)
    }

    /// Sets the tenant id header.
    #[must_use]
    pub fn with_tenant_id(self, tenant_id: impl Into<String>) -> Self {
        self.with(Self::TENANT_ID, tenant_id)
    }

    /// Adds or replaces a header in place.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let _ = self.0.insert(key.into(), value.into());
    }

    /// Copies every header of `other` into `self`, overwriting duplicates.
    pub fn merge(&mut self, other: &Self) {
        for (key, value) in other.iter() {
            self.insert(key, value);
        }
    }

    /// Looks up a header value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Iterates headers in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of headers.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true when no headers are set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the headers without `key`.
    #[must_use]
    pub fn without(&self, key: &str) -> Self {
        Self(
            self.0
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Delivery state of an outbox row.
///
/// Transitions: `Pending → Leased → {Published | Pending | DeadLettered}`.
/// `Published` and `DeadLettered` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventStatus {
    /// Waiting to be claimed (possibly gated by `next_attempt_at`).
    Pending,
    /// Claimed by a dispatcher instance until `lease_expires_at`.
    Leased,
    /// Acknowledged by the broker.
    Published,
    /// Removed from the retry cycle for operational handling.
    DeadLettered,
}

impl EventStatus {
    /// Stable lowercase name used in persisted rows.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Leased => "leased",
            Self::Published => "published",
            Self::DeadLettered => "dead_lettered",
        }
    }

    /// Terminal rows are never claimed again.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Published | Self::DeadLettered)
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a persisted status string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown outbox status `{0}`")]
pub struct UnknownStatus(pub String);

impl FromStr for EventStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "leased" => Ok(Self::Leased),
            "published" => Ok(Self::Published),
            "dead_lettered" => Ok(Self::DeadLettered),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Why an event was moved to `DeadLettered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeadLetterCause {
    /// The broker classified the failure as permanent.
    Rejected,
    /// Transient failures reached the configured attempt ceiling.
    AttemptsExhausted,
    /// The event could not be sent at all (malformed payload, no topic route).
    Undeliverable,
}

impl DeadLetterCause {
    /// Whether the final attempt reached the broker adapter, and so counts
    /// towards `attempt_count`.
    pub const fn reached_broker(self) -> bool {
        matches!(self, Self::Rejected | Self::AttemptsExhausted)
    }
}

/// One row of the outbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Time-sortable unique id, immutable.
    pub id: EventId,
    /// Ordering and routing key.
    pub partition_key: PartitionKey,
    /// Payload shape name.
    pub event_type: EventType,
    /// Payload shape version.
    pub schema_version: SchemaVersion,
    /// Serialized event body, opaque to the outbox.
    pub payload: Vec<u8>,
    /// Correlation, causation, tenant and content-type headers.
    pub headers: Headers,
    /// Insert time; defines per-partition order (ties broken by `id`).
    pub created_at: Timestamp,
    /// Delivery state.
    pub status: EventStatus,
    /// Dispatcher currently holding the lease.
    pub lease_owner: Option<LeaseOwner>,
    /// Moment the current lease lapses.
    pub lease_expires_at: Option<Timestamp>,
    /// Publish attempts that reached the broker adapter.
    pub attempt_count: u32,
    /// Earliest moment the row may be claimed again.
    pub next_attempt_at: Timestamp,
    /// Diagnostic from the last failed attempt.
    pub last_error: Option<String>,
    /// Moment the broker acknowledged the event.
    pub published_at: Option<Timestamp>,
}

impl OutboxEvent {
    /// Creates a `Pending` row, eligible for claiming from `created_at` on.
    pub fn new(
        id: EventId,
        partition_key: PartitionKey,
        event_type: EventType,
        schema_version: SchemaVersion,
        payload: Vec<u8>,
        headers: Headers,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id,
            partition_key,
            event_type,
            schema_version,
            payload,
            headers,
            created_at,
            status: EventStatus::Pending,
            lease_owner: None,
            lease_expires_at: None,
            attempt_count: 0,
            next_attempt_at: created_at,
            last_error: None,
            published_at: None,
        }
    }

    /// Sort key giving the per-partition publish order.
    pub const fn order_key(&self) -> (Timestamp, EventId) {
        (self.created_at, self.id)
    }

    /// Whether the row holds a lease owned by `owner`.
    pub fn is_leased_by(&self, owner: &LeaseOwner) -> bool {
        self.status == EventStatus::Leased && self.lease_owner.as_ref() == Some(owner)
    }
}

/// Row counts per status, used as operational depth gauges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    /// Rows waiting to be claimed.
    pub pending: u64,
    /// Rows currently leased.
    pub leased: u64,
    /// Rows acknowledged by the broker.
    pub published: u64,
    /// Depth of the dead-letter queue.
    pub dead_lettered: u64,
}

impl StatusCounts {
    /// Increments the counter for `status`.
    pub fn record(&mut self, status: EventStatus) {
        match status {
            EventStatus::Pending => self.pending += 1,
            EventStatus::Leased => self.leased += 1,
            EventStatus::Published => self.published += 1,
            EventStatus::DeadLettered => self.dead_lettered += 1,
        }
    }
}
