//! Recording events inside a business transaction.
//!
//! Command handlers call [`OutboxAppender::append_events`] with the same
//! transaction that carries their state change. The rows only become visible
//! to dispatchers when that transaction commits, and vanish with it on
//! rollback.

use tracing::{debug, instrument};

use crate::clock::{Clock, SystemClock};
use crate::envelope::JSON_CONTENT_TYPE;
use eventrelay_types::{
    DomainEvent, EventId, EventType, Headers, OutboxEvent, OutboxStore, OutboxStoreError,
};

/// Errors raised while appending events.
///
/// Any error means nothing was staged by this call and the caller should roll
/// back its transaction.
#[derive(thiserror::Error, Debug)]
pub enum AppendError {
    /// A domain event could not be serialized to JSON.
    #[error("failed to serialize {event_type}: {detail}")]
    Serialization {
        /// Type of the event that failed.
        event_type: EventType,
        /// Serializer message.
        detail: String,
    },

    /// The store refused the rows.
    #[error(transparent)]
    Store(#[from] OutboxStoreError),
}

/// Turns domain events into outbox rows and stages them on a transaction.
#[derive(Debug, Clone)]
pub struct OutboxAppender<S, C = SystemClock> {
    store: S,
    clock: C,
}

impl<S: OutboxStore> OutboxAppender<S> {
    /// Creates an appender stamping rows with the system time.
    pub fn new(store: S) -> Self {
        Self {
            store,
            clock: SystemClock,
        }
    }
}

impl<S: OutboxStore, C: Clock> OutboxAppender<S, C> {
    /// Replaces the clock used for `created_at`.
    pub fn with_clock<C2: Clock>(self, clock: C2) -> OutboxAppender<S, C2> {
        OutboxAppender {
            store: self.store,
            clock,
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Stages `events` on `tx`, in order, and returns their ids.
    ///
    /// Every row carries `headers` plus a JSON content type, and all rows of
    /// one call share a `created_at`; their UUIDv7 ids keep them in call
    /// order within a partition.
    #[instrument(name = "outbox.append_events", skip_all, fields(event_count = events.len()))]
    pub async fn append_events<E: DomainEvent>(
        &self,
        tx: &mut S::Transaction<'_>,
        events: &[E],
        headers: &Headers,
    ) -> Result<Vec<EventId>, AppendError> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let created_at = self.clock.now();
        let headers = headers.clone().with(Headers::CONTENT_TYPE, JSON_CONTENT_TYPE);

        let rows = events
            .iter()
            .map(|event| {
                let event_type = event.event_type();
                let payload =
                    serde_json::to_vec(event).map_err(|error| AppendError::Serialization {
                        event_type: event_type.clone(),
                        detail: error.to_string(),
                    })?;
                Ok(OutboxEvent::new(
                    EventId::new(),
                    event.partition_key(),
                    event_type,
                    event.schema_version(),
                    payload,
                    headers.clone(),
                    created_at,
                ))
            })
            .collect::<Result<Vec<_>, AppendError>>()?;

        let ids: Vec<EventId> = rows.iter().map(|row| row.id).collect();
        self.store.append(tx, rows).await?;

        debug!(event_count = ids.len(), "[outbox.append_events] events staged");
        Ok(ids)
    }
}
