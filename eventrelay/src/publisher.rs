//! The broker seam.
//!
//! A [`BrokerPublisher`] sends one envelope to one topic and reports how a
//! failure should be treated. Adapters for real brokers (Kafka, NATS, SNS...)
//! live outside this crate; the dispatcher only depends on this trait.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::envelope::Envelope;
use eventrelay_types::{PartitionKey, Topic};

/// How the dispatcher should react to a failed publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Worth retrying later (timeouts, broker unavailable, throttling).
    Transient,
    /// Retrying cannot help (authorization denied, message too large,
    /// unknown topic).
    Permanent,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Permanent => write!(f, "permanent"),
        }
    }
}

/// A classified publish failure.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{class} publish failure: {detail}")]
pub struct PublishError {
    /// Retry classification.
    pub class: ErrorClass,
    /// Broker diagnostic, persisted as the row's `last_error`.
    pub detail: String,
}

impl PublishError {
    /// A failure that should be retried.
    pub fn transient(detail: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            detail: detail.into(),
        }
    }

    /// A failure that should go straight to the dead-letter queue.
    pub fn permanent(detail: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Permanent,
            detail: detail.into(),
        }
    }

    /// The acknowledgement did not arrive within `timeout`.
    pub fn timed_out(timeout: Duration) -> Self {
        Self::transient(format!(
            "no broker acknowledgement within {}ms",
            timeout.as_millis()
        ))
    }

    /// Whether the failure is worth retrying.
    pub const fn is_transient(&self) -> bool {
        matches!(self.class, ErrorClass::Transient)
    }
}

/// Sends envelopes to a message broker.
///
/// `Ok(())` means the broker durably acknowledged the envelope. The publisher
/// must honour `timeout`; the dispatcher also enforces it from outside and
/// treats an elapsed deadline as [`ErrorClass::Transient`].
///
/// Delivery is at-least-once: the same envelope may be published more than
/// once after a crash or lost lease, so consumers deduplicate on
/// `Envelope::event_id`.
pub trait BrokerPublisher {
    /// Publish `envelope` to `topic`, using `partition_key` as the broker
    /// partition or ordering key.
    fn publish(
        &self,
        topic: &Topic,
        partition_key: &PartitionKey,
        envelope: &Envelope,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), PublishError>> + Send;
}

impl<T: BrokerPublisher + Send + Sync> BrokerPublisher for &T {
    fn publish(
        &self,
        topic: &Topic,
        partition_key: &PartitionKey,
        envelope: &Envelope,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), PublishError>> + Send {
        (**self).publish(topic, partition_key, envelope, timeout)
    }
}

impl<T: BrokerPublisher + Send + Sync> BrokerPublisher for Arc<T> {
    fn publish(
        &self,
        topic: &Topic,
        partition_key: &PartitionKey,
        envelope: &Envelope,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), PublishError>> + Send {
        (**self).publish(topic, partition_key, envelope, timeout)
    }
}

/// Publisher that acknowledges every envelope after logging it.
///
/// Handy for local development and smoke tests where no broker runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingPublisher;

impl BrokerPublisher for TracingPublisher {
    async fn publish(
        &self,
        topic: &Topic,
        partition_key: &PartitionKey,
        envelope: &Envelope,
        _timeout: Duration,
    ) -> Result<(), PublishError> {
        info!(
            topic = %topic,
            partition_key = %partition_key,
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            payload_bytes = envelope.payload.len(),
            "[publisher.tracing] envelope acknowledged"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_transient() {
        let error = PublishError::timed_out(Duration::from_millis(250));

        assert!(error.is_transient());
        assert_eq!(
            error.to_string(),
            "transient publish failure: no broker acknowledgement within 250ms"
        );
    }

    #[test]
    fn permanent_errors_are_not_transient() {
        assert!(!PublishError::permanent("unknown topic").is_transient());
    }
}
