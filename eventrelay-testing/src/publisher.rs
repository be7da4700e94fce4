//! A broker test double.
//!
//! [`RecordingPublisher`] acknowledges by default, replays scripted outcomes
//! per event id, and records every call in order so tests can assert on
//! delivery order and attempt counts.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use eventrelay::{BrokerPublisher, Envelope, PublishError};
use eventrelay_types::{EventId, PartitionKey, Topic};
use tracing::debug;

/// What the publisher does with one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedOutcome {
    /// Acknowledge the envelope.
    Ack,
    /// Fail with the given error.
    Fail(PublishError),
}

/// One observed `publish` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishCall {
    /// Destination topic.
    pub topic: Topic,
    /// Broker partition key.
    pub partition_key: PartitionKey,
    /// The envelope as handed over.
    pub envelope: Envelope,
    /// Outcome the script chose for this call.
    pub outcome: ScriptedOutcome,
}

#[derive(Debug)]
struct RecorderState {
    scripts: HashMap<EventId, VecDeque<ScriptedOutcome>>,
    fallback: ScriptedOutcome,
    calls: Vec<PublishCall>,
    acknowledged: Vec<EventId>,
}

/// Scripted, recording [`BrokerPublisher`].
#[derive(Debug)]
pub struct RecordingPublisher {
    state: Mutex<RecorderState>,
    latency: Option<Duration>,
}

impl Default for RecordingPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingPublisher {
    /// A publisher that acknowledges everything immediately.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RecorderState {
                scripts: HashMap::new(),
                fallback: ScriptedOutcome::Ack,
                calls: Vec::new(),
                acknowledged: Vec::new(),
            }),
            latency: None,
        }
    }

    /// Delays every call by `latency` before its outcome takes effect.
    ///
    /// A latency longer than the dispatcher's publish timeout makes every
    /// call time out, and a timed out call is never acknowledged.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Outcome used for calls without a scripted entry.
    #[must_use]
    pub fn with_fallback(self, outcome: ScriptedOutcome) -> Self {
        self.lock().fallback = outcome;
        self
    }

    /// Queues outcomes for the next calls carrying `event_id`.
    ///
    /// Once the queue is drained the fallback applies again.
    pub fn script(&self, event_id: EventId, outcomes: impl IntoIterator<Item = ScriptedOutcome>) {
        self.lock()
            .scripts
            .entry(event_id)
            .or_default()
            .extend(outcomes);
    }

    /// Every call so far, in call order.
    pub fn calls(&self) -> Vec<PublishCall> {
        self.lock().calls.clone()
    }

    /// Ids of acknowledged envelopes, in acknowledgement order.
    pub fn acknowledged(&self) -> Vec<EventId> {
        self.lock().acknowledged.clone()
    }

    /// How many times `event_id` was handed to the publisher.
    pub fn attempts(&self, event_id: EventId) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.envelope.event_id == event_id)
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, RecorderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_outcome(
        &self,
        topic: &Topic,
        partition_key: &PartitionKey,
        envelope: &Envelope,
    ) -> ScriptedOutcome {
        let mut state = self.lock();
        let scripted = state
            .scripts
            .get_mut(&envelope.event_id)
            .and_then(VecDeque::pop_front);
        let outcome = scripted.unwrap_or_else(|| state.fallback.clone());
        state.calls.push(PublishCall {
            topic: topic.clone(),
            partition_key: partition_key.clone(),
            envelope: envelope.clone(),
            outcome: outcome.clone(),
        });
        outcome
    }
}

impl BrokerPublisher for RecordingPublisher {
    async fn publish(
        &self,
        topic: &Topic,
        partition_key: &PartitionKey,
        envelope: &Envelope,
        _timeout: Duration,
    ) -> Result<(), PublishError> {
        let outcome = self.next_outcome(topic, partition_key, envelope);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        match outcome {
            ScriptedOutcome::Ack => {
                self.lock().acknowledged.push(envelope.event_id);
                debug!(event_id = %envelope.event_id, "[recording_publisher.ack] envelope acknowledged");
                Ok(())
            }
            ScriptedOutcome::Fail(error) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventrelay::EnvelopeCodec;
    use eventrelay_types::{EventType, Headers, OutboxEvent, SchemaVersion, Timestamp};

    fn envelope() -> Envelope {
        let event = OutboxEvent::new(
            EventId::new(),
            PartitionKey::try_new("order-1").unwrap(),
            EventType::try_new("OrderPlaced").unwrap(),
            SchemaVersion::initial(),
            b"{}".to_vec(),
            Headers::new(),
            Timestamp::now(),
        );
        EnvelopeCodec::encode(&event).unwrap()
    }

    #[tokio::test]
    async fn scripted_outcomes_replay_then_fall_back_to_ack() {
        // Given: one transient failure scripted for an envelope
        let publisher = RecordingPublisher::new();
        let envelope = envelope();
        let topic = Topic::try_new("orders").unwrap();
        publisher.script(
            envelope.event_id,
            [ScriptedOutcome::Fail(PublishError::transient("broker busy"))],
        );

        // When: the envelope is published twice
        let first = publisher
            .publish(&topic, &envelope.partition_key, &envelope, Duration::from_secs(1))
            .await;
        let second = publisher
            .publish(&topic, &envelope.partition_key, &envelope, Duration::from_secs(1))
            .await;

        // Then: the script fires once and the second call is acknowledged
        assert!(first.is_err_and(|error| error.is_transient()));
        assert!(second.is_ok());
        assert_eq!(publisher.attempts(envelope.event_id), 2);
        assert_eq!(publisher.acknowledged(), vec![envelope.event_id]);
    }

    #[tokio::test]
    async fn fallback_applies_to_unscripted_events() {
        let publisher = RecordingPublisher::new()
            .with_fallback(ScriptedOutcome::Fail(PublishError::permanent("rejected")));
        let envelope = envelope();
        let topic = Topic::try_new("orders").unwrap();

        let result = publisher
            .publish(&topic, &envelope.partition_key, &envelope, Duration::from_secs(1))
            .await;

        assert!(result.is_err());
        assert!(publisher.acknowledged().is_empty());
        assert_eq!(publisher.calls()[0].topic, topic);
    }
}
