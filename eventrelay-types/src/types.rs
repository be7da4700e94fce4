//! Identifier and scalar domain types.
//!
//! All string identifiers use nutype smart constructors so a value that exists
//! is always valid: trimmed, non-empty and at most 255 characters.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally unique, time-sortable identifier of an outbox event.
///
/// `EventId` values are guaranteed to be UUIDv7, so ids generated in sequence
/// sort in creation order and can break ties between equal `created_at` values.
#[nutype(
    validate(predicate = |id: &Uuid| id.get_version() == Some(uuid::Version::SortRand)),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new `EventId` stamped with the current time.
    pub fn new() -> Self {
        // Uuid::now_v7() always produces a version 7 UUID
        Self::try_new(Uuid::now_v7()).expect("Uuid::now_v7() should always return a valid v7 UUID")
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordering and broker routing key.
///
/// Events sharing a partition key are published strictly in `created_at`
/// order. The key must stay stable for the lifetime of the emitting aggregate.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct PartitionKey(String);

/// Name identifying the shape of an event payload (e.g. `OrderPlaced`).
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct EventType(String);

/// Version of an event payload schema, paired with [`EventType`].
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct SchemaVersion(String);

impl SchemaVersion {
    /// The version assumed for events that do not declare one (`"1"`).
    pub fn initial() -> Self {
        Self::try_new("1").expect("\"1\" is always a valid schema version")
    }
}

/// Identity of a dispatcher instance holding leases.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct LeaseOwner(String);

/// Broker destination an envelope is published to.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct Topic(String);

/// A UTC point in time.
///
/// Wraps `chrono` so the clock used by stores and dispatchers is uniform and
/// arithmetic with `std::time::Duration` saturates instead of panicking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a new timestamp from a UTC `DateTime`.
    pub const fn new(datetime: DateTime<Utc>) -> Self {
        Self(datetime)
    }

    /// Creates a timestamp representing the current moment.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Returns the underlying `DateTime`.
    pub const fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Converts the timestamp into the underlying `DateTime`.
    pub const fn into_datetime(self) -> DateTime<Utc> {
        self.0
    }

    /// Returns this timestamp advanced by `duration`, saturating at the
    /// maximum representable instant.
    #[must_use]
    pub fn plus(self, duration: Duration) -> Self {
        let delta = TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX);
        Self(
            self.0
                .checked_add_signed(delta)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        )
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(datetime: DateTime<Utc>) -> Self {
        Self::new(datetime)
    }
}

impl From<Timestamp> for DateTime<Utc> {
    fn from(timestamp: Timestamp) -> Self {
        timestamp.into_datetime()
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn partition_key_accepts_valid_strings(s in "[a-zA-Z0-9_:-]{1,255}") {
            let key = PartitionKey::try_new(s.clone());
            prop_assert!(key.is_ok());
            let key = key.unwrap();
            prop_assert_eq!(key.as_ref(), &s);
        }

        #[test]
        fn partition_key_trims_whitespace(s in " {0,10}[a-zA-Z0-9_-]{1,240} {0,10}") {
            let key = PartitionKey::try_new(s.clone()).unwrap();
            prop_assert_eq!(key.as_ref(), s.trim());
        }

        #[test]
        fn partition_key_rejects_blank_strings(s in " {0,50}") {
            prop_assert!(PartitionKey::try_new(s).is_err());
        }

        #[test]
        fn timestamp_plus_never_moves_backwards(millis in 0u64..10_000_000_000) {
            let start = Timestamp::now();
            prop_assert!(start.plus(Duration::from_millis(millis)) >= start);
        }
    }

    #[test]
    fn event_id_rejects_non_v7_uuids() {
        let v4 = Uuid::from_u128(0x0191_0000_0000_4000_8000_0000_0000_0000);
        assert!(EventId::try_new(v4).is_err());
    }

    #[test]
    fn event_ids_generated_in_sequence_sort_in_order() {
        let first = EventId::new();
        let second = EventId::new();

        assert!(first < second);
    }

    #[test]
    fn timestamp_plus_saturates_instead_of_overflowing() {
        let far_future = Timestamp::new(DateTime::<Utc>::MAX_UTC);

        assert_eq!(far_future.plus(Duration::from_secs(60)), far_future);
    }

    #[test]
    fn schema_version_initial_is_one() {
        assert_eq!(SchemaVersion::initial().as_ref(), "1");
    }
}
