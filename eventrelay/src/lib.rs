//! `EventRelay` - transactional outbox and reliable event delivery
//!
//! Domain events are written to an outbox table in the same transaction as
//! the state change that produced them. A [`Dispatcher`] later leases those
//! rows, publishes them to a message broker through a [`BrokerPublisher`],
//! and records the outcome. Delivery is at-least-once with strict ordering
//! per partition key; consumers deduplicate on [`Envelope::event_id`].
//!
//! # Crates
//!
//! - `eventrelay-types`: shared vocabulary and the [`OutboxStore`] trait
//! - `eventrelay-memory`: in-memory store for tests and development
//! - `eventrelay-postgres`: PostgreSQL store using `FOR UPDATE SKIP LOCKED`
//! - `eventrelay-testing`: contract tests, chaos store and a scripted publisher
//!
//! # Example
//!
//! ```ignore
//! let mut tx = pool.begin().await?;
//! // ... business writes on `tx` ...
//! appender.append_events(&mut tx, &[order_placed], &headers).await?;
//! tx.commit().await?;
//!
//! let dispatcher = Dispatcher::new(store, publisher, router, DispatcherConfig::default())?;
//! dispatcher.run(shutdown_token).await;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod appender;
mod clock;
mod config;
mod dispatcher;
mod envelope;
mod publisher;
mod registry;
mod retry;
mod routing;

pub use appender::{AppendError, OutboxAppender};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BatchSize, BatchSizeError, ConfigError, DispatcherConfig};
pub use dispatcher::{CycleError, CycleReport, Dispatcher, DispatcherStats};
pub use envelope::{
    CodecError, Envelope, EnvelopeCodec, ENVELOPE_FORMAT, JSON_CONTENT_TYPE,
    OCTET_STREAM_CONTENT_TYPE,
};
pub use publisher::{BrokerPublisher, ErrorClass, PublishError, TracingPublisher};
pub use registry::{EventTypeRegistry, RegistryError};
pub use retry::{
    BackoffMultiplier, BackoffMultiplierError, MaxAttempts, MaxAttemptsError, RetryConfig,
    RetryDecision, RetryPolicy,
};
pub use routing::TopicRouter;

// Re-export the shared vocabulary so most users depend on this crate only.
pub use eventrelay_types::{
    DeadLetterCause, DomainEvent, EventId, EventIdError, EventStatus, EventType, EventTypeError,
    Headers, LeaseOwner, LeaseOwnerError, Operation, OutboxEvent, OutboxStore, OutboxStoreError,
    PartitionKey, PartitionKeyError, SchemaVersion, SchemaVersionError, StatusCounts, Timestamp,
    Topic, TopicError, TransactionalStore, Transition, UnknownStatus,
};
