//! The relay loop: claim, publish, record.
//!
//! One [`Dispatcher::run_cycle`] call:
//!
//! 1. returns rows with lapsed leases to `Pending`,
//! 2. leases up to `batch_size` eligible rows,
//! 3. groups them by partition key and publishes each group sequentially
//!    (groups run concurrently),
//! 4. records every outcome in the store.
//!
//! When an event fails, the rest of its group is handed back without an
//! attempt so nothing overtakes it. Several dispatcher instances may run
//! against one store; the store's claim guarantees keep them apart.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use futures::future::join_all;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, DispatcherConfig};
use crate::envelope::EnvelopeCodec;
use crate::publisher::{BrokerPublisher, ErrorClass, PublishError};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::routing::TopicRouter;
use eventrelay_types::{
    DeadLetterCause, EventId, LeaseOwner, OutboxEvent, OutboxStore, OutboxStoreError,
    PartitionKey, Transition,
};

/// Error aborting a whole cycle before any event was attempted.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CycleError {
    /// Lease housekeeping or claiming failed.
    #[error("dispatcher cycle aborted: {0}")]
    Store(#[from] OutboxStoreError),
}

/// Outcome counters of one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Rows leased by this cycle.
    pub claimed: usize,
    /// Rows acknowledged by the broker and marked `Published`.
    pub published: usize,
    /// Rows returned to `Pending` after a failed attempt.
    pub retried: usize,
    /// Rows moved to the dead-letter queue.
    pub dead_lettered: usize,
    /// Rows handed back unattempted because an earlier event in their
    /// partition failed.
    pub released: usize,
    /// Rows whose lapsed lease was recovered before claiming.
    pub expired_leases_recovered: u64,
    /// Transitions skipped because the lease was no longer ours.
    pub lease_lost: usize,
    /// Outcomes that could not be recorded; those rows stay leased until
    /// their lease lapses.
    pub store_errors: usize,
}

impl CycleReport {
    fn merge(&mut self, other: &Self) {
        self.claimed += other.claimed;
        self.published += other.published;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.released += other.released;
        self.expired_leases_recovered += other.expired_leases_recovered;
        self.lease_lost += other.lease_lost;
        self.store_errors += other.store_errors;
    }

    /// Whether the cycle found nothing to do.
    pub const fn is_idle(&self) -> bool {
        self.claimed == 0 && self.expired_leases_recovered == 0
    }
}

/// Totals accumulated by [`Dispatcher::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Cycles that completed.
    pub cycles: u64,
    /// Cycles aborted by a store failure.
    pub failed_cycles: u64,
    /// Sum of all completed cycle reports.
    pub totals: CycleReport,
}

impl DispatcherStats {
    fn record(&mut self, report: &CycleReport) {
        self.cycles += 1;
        self.totals.merge(report);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventOutcome {
    Published,
    Retried,
    DeadLettered,
    LeaseLost,
    StoreError,
}

/// Relays outbox rows to a broker.
pub struct Dispatcher<S, P, C = SystemClock> {
    store: S,
    publisher: P,
    clock: C,
    router: TopicRouter,
    config: DispatcherConfig,
    policy: RetryPolicy,
    owner: LeaseOwner,
    rng: Mutex<StdRng>,
}

impl<S, P> Dispatcher<S, P, SystemClock> {
    /// Creates a dispatcher with a unique lease owner and the system clock.
    pub fn new(
        store: S,
        publisher: P,
        router: TopicRouter,
        config: DispatcherConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            store,
            publisher,
            clock: SystemClock,
            router,
            policy: RetryPolicy::new(config.retry.clone()),
            config,
            owner: default_owner()?,
            rng: Mutex::new(StdRng::from_os_rng()),
        })
    }
}

impl<S, P, C> Dispatcher<S, P, C> {
    /// Replaces the clock used for leases and backoff.
    pub fn with_clock<C2: Clock>(self, clock: C2) -> Dispatcher<S, P, C2> {
        Dispatcher {
            store: self.store,
            publisher: self.publisher,
            clock,
            router: self.router,
            config: self.config,
            policy: self.policy,
            owner: self.owner,
            rng: self.rng,
        }
    }

    /// Overrides the generated lease owner.
    #[must_use]
    pub fn with_owner(mut self, owner: LeaseOwner) -> Self {
        self.owner = owner;
        self
    }

    /// Seeds the jitter generator so retry delays are reproducible.
    #[must_use]
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Identity under which this dispatcher holds leases.
    pub const fn owner(&self) -> &LeaseOwner {
        &self.owner
    }

    /// The validated configuration.
    pub const fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// The backing store.
    pub const fn store(&self) -> &S {
        &self.store
    }
}

impl<S, P, C> Dispatcher<S, P, C>
where
    S: OutboxStore + Sync,
    P: BrokerPublisher + Sync,
    C: Clock,
{
    /// Runs one claim, publish, record pass.
    ///
    /// Only failures before any event was attempted abort the cycle;
    /// per-event store failures are counted in the report instead.
    #[instrument(name = "dispatcher.cycle", skip(self), fields(owner = %self.owner))]
    pub async fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        let mut report = CycleReport::default();
        let now = self.clock.now();

        report.expired_leases_recovered = self.store.release_expired_leases(now).await?;
        if report.expired_leases_recovered > 0 {
            info!(
                recovered = report.expired_leases_recovered,
                "[dispatcher.recover] lapsed leases returned to pending"
            );
        }

        let batch = self
            .store
            .claim_batch(
                &self.owner,
                self.config.lease_duration,
                self.config.batch_size.into_inner(),
                now,
            )
            .await?;
        report.claimed = batch.len();
        if batch.is_empty() {
            return Ok(report);
        }

        let groups = group_by_partition(batch);
        debug!(
            claimed = report.claimed,
            partitions = groups.len(),
            "[dispatcher.claim] batch leased"
        );

        let outcomes = join_all(groups.into_iter().map(|group| self.dispatch_group(group))).await;
        for outcome in &outcomes {
            report.merge(outcome);
        }

        info!(
            claimed = report.claimed,
            published = report.published,
            retried = report.retried,
            dead_lettered = report.dead_lettered,
            released = report.released,
            "[dispatcher.cycle] cycle complete"
        );
        Ok(report)
    }

    /// Cycles every `poll_interval` until `shutdown` is cancelled.
    ///
    /// Cancellation is observed between cycles, so an in-flight batch is
    /// always finished and recorded before the loop exits.
    pub async fn run(&self, shutdown: CancellationToken) -> DispatcherStats {
        let mut stats = DispatcherStats::default();
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(owner = %self.owner, "[dispatcher.start] dispatcher running");
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.run_cycle().await {
                Ok(report) => stats.record(&report),
                Err(failure) => {
                    stats.failed_cycles += 1;
                    error!(error = %failure, "[dispatcher.cycle] cycle aborted");
                }
            }
        }

        info!(
            owner = %self.owner,
            cycles = stats.cycles,
            published = stats.totals.published,
            "[dispatcher.stop] dispatcher stopped"
        );
        stats
    }

    async fn dispatch_group(&self, group: Vec<OutboxEvent>) -> CycleReport {
        let mut report = CycleReport::default();
        let mut events = group.into_iter();
        let mut halted: Option<PartitionKey> = None;

        for event in events.by_ref() {
            match self.dispatch_event(&event).await {
                EventOutcome::Published => {
                    report.published += 1;
                    continue;
                }
                EventOutcome::Retried => report.retried += 1,
                EventOutcome::DeadLettered => report.dead_lettered += 1,
                EventOutcome::LeaseLost => report.lease_lost += 1,
                EventOutcome::StoreError => report.store_errors += 1,
            }
            halted = Some(event.partition_key);
            break;
        }

        if let Some(partition_key) = halted {
            let tail: Vec<EventId> = events.map(|event| event.id).collect();
            if !tail.is_empty() {
                report.released += self.release_tail(&partition_key, &tail).await;
            }
        }

        report
    }

    async fn release_tail(&self, partition_key: &PartitionKey, tail: &[EventId]) -> usize {
        match self.store.release_leases(tail, &self.owner).await {
            Ok(released) => {
                debug!(
                    partition_key = %partition_key,
                    released,
                    "[dispatcher.release] unattempted events handed back"
                );
                usize::try_from(released).unwrap_or(usize::MAX)
            }
            Err(failure) => {
                // The rows stay leased and come back once the lease lapses.
                warn!(
                    partition_key = %partition_key,
                    error = %failure,
                    "[dispatcher.release] could not hand back unattempted events"
                );
                0
            }
        }
    }

    async fn dispatch_event(&self, event: &OutboxEvent) -> EventOutcome {
        let Some(topic) = self.router.resolve(&event.event_type) else {
            let reason = format!("no topic route for event type {}", event.event_type);
            return self
                .dead_letter(event, DeadLetterCause::Undeliverable, &reason)
                .await;
        };

        let envelope = match EnvelopeCodec::encode(event) {
            Ok(envelope) => envelope,
            Err(failure) => {
                return self
                    .dead_letter(event, DeadLetterCause::Undeliverable, &failure.to_string())
                    .await;
            }
        };

        let deadline = self.config.publish_timeout;
        let published = timeout(
            deadline,
            self.publisher
                .publish(topic, &event.partition_key, &envelope, deadline),
        )
        .await
        .unwrap_or_else(|_elapsed| Err(PublishError::timed_out(deadline)));

        match published {
            Ok(()) => self.record_published(event).await,
            Err(failure) => self.record_failure(event, &failure).await,
        }
    }

    async fn record_published(&self, event: &OutboxEvent) -> EventOutcome {
        let result = self
            .store
            .mark_published(event.id, &self.owner, self.clock.now())
            .await;
        let outcome = self.transition_outcome(event, result, EventOutcome::Published);
        if outcome == EventOutcome::Published {
            debug!(
                event_id = %event.id,
                partition_key = %event.partition_key,
                "[dispatcher.publish] event published"
            );
        }
        outcome
    }

    async fn record_failure(&self, event: &OutboxEvent, failure: &PublishError) -> EventOutcome {
        let attempts = event.attempt_count.saturating_add(1);
        let decision = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            self.policy.decide(attempts, failure.class, &mut *rng)
        };

        match decision {
            RetryDecision::RetryAfter(delay) => {
                let next_attempt_at = self.clock.now().plus(delay);
                let result = self
                    .store
                    .mark_retry(event.id, &self.owner, next_attempt_at, &failure.detail)
                    .await;
                let outcome = self.transition_outcome(event, result, EventOutcome::Retried);
                if outcome == EventOutcome::Retried {
                    warn!(
                        event_id = %event.id,
                        partition_key = %event.partition_key,
                        attempts,
                        retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %failure,
                        "[dispatcher.retry] publish failed, retry scheduled"
                    );
                }
                outcome
            }
            RetryDecision::DeadLetter => {
                let cause = match failure.class {
                    ErrorClass::Permanent => DeadLetterCause::Rejected,
                    ErrorClass::Transient => DeadLetterCause::AttemptsExhausted,
                };
                self.dead_letter(event, cause, &failure.detail).await
            }
        }
    }

    async fn dead_letter(
        &self,
        event: &OutboxEvent,
        cause: DeadLetterCause,
        reason: &str,
    ) -> EventOutcome {
        let result = self
            .store
            .mark_dead_lettered(event.id, Some(&self.owner), cause, reason)
            .await;
        let outcome = self.transition_outcome(event, result, EventOutcome::DeadLettered);
        if outcome == EventOutcome::DeadLettered {
            warn!(
                event_id = %event.id,
                partition_key = %event.partition_key,
                event_type = %event.event_type,
                cause = ?cause,
                reason,
                "[dispatcher.dead_letter] event moved to dead-letter queue"
            );
        }
        outcome
    }

    fn transition_outcome(
        &self,
        event: &OutboxEvent,
        result: Result<Transition, OutboxStoreError>,
        applied: EventOutcome,
    ) -> EventOutcome {
        match result {
            Ok(Transition::Applied) => applied,
            Ok(Transition::LeaseLost) => {
                debug!(
                    event_id = %event.id,
                    owner = %self.owner,
                    "[dispatcher.lease_lost] lease no longer held, outcome discarded"
                );
                EventOutcome::LeaseLost
            }
            Err(failure) => {
                error!(
                    event_id = %event.id,
                    error = %failure,
                    "[dispatcher.store_error] could not record outcome"
                );
                EventOutcome::StoreError
            }
        }
    }
}

/// Splits a claimed batch into per-partition groups, each in publish order.
///
/// Groups appear in the order of their oldest event.
fn group_by_partition(batch: Vec<OutboxEvent>) -> Vec<Vec<OutboxEvent>> {
    let mut index: HashMap<PartitionKey, usize> = HashMap::new();
    let mut groups: Vec<Vec<OutboxEvent>> = Vec::new();

    for event in batch {
        match index.get(&event.partition_key) {
            Some(&position) => groups[position].push(event),
            None => {
                let _ = index.insert(event.partition_key.clone(), groups.len());
                groups.push(vec![event]);
            }
        }
    }

    for group in &mut groups {
        group.sort_by_key(OutboxEvent::order_key);
    }
    groups
}

/// `relay-<pid>-<uuid suffix>`, unique per dispatcher instance.
fn default_owner() -> Result<LeaseOwner, ConfigError> {
    let id = Uuid::now_v7().simple().to_string();
    let suffix = id.get(id.len().saturating_sub(12)..).unwrap_or(&id);
    LeaseOwner::try_new(format!("relay-{}-{suffix}", std::process::id())).map_err(|error| {
        ConfigError::InvalidLeaseOwner {
            detail: error.to_string(),
        }
    })
}

impl<S, P, C> std::fmt::Debug for Dispatcher<S, P, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("owner", &self.owner)
            .field("config", &self.config)
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::envelope::{Envelope, JSON_CONTENT_TYPE};
    use eventrelay_memory::InMemoryOutboxStore;
    use eventrelay_types::{EventStatus, EventType, Headers, SchemaVersion, Timestamp, Topic};
    use std::time::Duration;
    use tracing_test::traced_test;

    /// Accepts everything except events whose payload is `"fail"`.
    #[derive(Default)]
    struct PickyPublisher {
        seen: Mutex<Vec<EventId>>,
    }

    impl BrokerPublisher for PickyPublisher {
        async fn publish(
            &self,
            _topic: &Topic,
            _partition_key: &PartitionKey,
            envelope: &Envelope,
            _timeout: Duration,
        ) -> Result<(), PublishError> {
            self.seen
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(envelope.event_id);
            if envelope.payload == br#""fail""# {
                Err(PublishError::transient("broker unavailable"))
            } else {
                Ok(())
            }
        }
    }

    fn row(partition: &str, payload: &str, created_at: Timestamp) -> OutboxEvent {
        OutboxEvent::new(
            EventId::new(),
            PartitionKey::try_new(partition).unwrap(),
            EventType::try_new("OrderPlaced").unwrap(),
            SchemaVersion::initial(),
            payload.as_bytes().to_vec(),
            Headers::new().with(Headers::CONTENT_TYPE, JSON_CONTENT_TYPE),
            created_at,
        )
    }

    async fn seeded(rows: Vec<OutboxEvent>) -> InMemoryOutboxStore {
        let store = InMemoryOutboxStore::new();
        let mut tx = store.begin();
        store.append(&mut tx, rows).await.unwrap();
        store.commit(tx).unwrap();
        store
    }

    fn router() -> TopicRouter {
        TopicRouter::new(Topic::try_new("orders").unwrap())
    }

    #[test]
    fn grouping_keeps_per_partition_order() {
        let start = Timestamp::now();
        let a1 = row("a", "1", start);
        let b1 = row("b", "1", start.plus(Duration::from_millis(1)));
        let a2 = row("a", "2", start.plus(Duration::from_millis(2)));

        let groups = group_by_partition(vec![a1.clone(), b1.clone(), a2.clone()]);

        assert_eq!(groups, vec![vec![a1, a2], vec![b1]]);
    }

    #[test]
    fn invalid_configuration_is_rejected_up_front() {
        let config = DispatcherConfig::default().with_poll_interval(Duration::ZERO);

        let result = Dispatcher::new(
            InMemoryOutboxStore::new(),
            PickyPublisher::default(),
            router(),
            config,
        );

        assert!(matches!(result, Err(ConfigError::ZeroPollInterval)));
    }

    #[tokio::test]
    async fn failure_hands_back_the_rest_of_the_partition() {
        // Given: partition "a" holds a failing head followed by two events
        let clock = ManualClock::default();
        let start = clock.now();
        let head = row("a", r#""fail""#, start);
        let second = row("a", "2", start.plus(Duration::from_millis(1)));
        let third = row("a", "3", start.plus(Duration::from_millis(2)));
        let other = row("b", "1", start.plus(Duration::from_millis(3)));
        let store = seeded(vec![head.clone(), second.clone(), third.clone(), other.clone()]).await;
        let publisher = PickyPublisher::default();
        let dispatcher = Dispatcher::new(&store, &publisher, router(), DispatcherConfig::default())
            .unwrap()
            .with_clock(clock.clone())
            .with_rng_seed(3);

        // When: one cycle runs
        clock.advance(Duration::from_millis(10));
        let report = dispatcher.run_cycle().await.unwrap();

        // Then: the head is retried, its successors are released unattempted,
        // and the unrelated partition is published
        assert_eq!(report.claimed, 4);
        assert_eq!(report.retried, 1);
        assert_eq!(report.released, 2);
        assert_eq!(report.published, 1);

        let seen = publisher.seen.lock().unwrap().clone();
        assert!(seen.contains(&head.id));
        assert!(seen.contains(&other.id));
        assert!(!seen.contains(&second.id));

        let retried = store.get(head.id).unwrap();
        assert_eq!(retried.status, EventStatus::Pending);
        assert_eq!(retried.attempt_count, 1);
        assert_eq!(retried.last_error.as_deref(), Some("broker unavailable"));
        for id in [second.id, third.id] {
            let released = store.get(id).unwrap();
            assert_eq!(released.status, EventStatus::Pending);
            assert_eq!(released.attempt_count, 0);
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn unroutable_events_are_dead_lettered_without_publishing() {
        let clock = ManualClock::default();
        let event = row("a", "1", clock.now());
        let store = seeded(vec![event.clone()]).await;
        let publisher = PickyPublisher::default();
        let router = TopicRouter::explicit().route(
            EventType::try_new("SomethingElse").unwrap(),
            Topic::try_new("elsewhere").unwrap(),
        );
        let dispatcher = Dispatcher::new(&store, &publisher, router, DispatcherConfig::default())
            .unwrap()
            .with_clock(clock.clone());

        let report = dispatcher.run_cycle().await.unwrap();

        assert_eq!(report.dead_lettered, 1);
        assert!(publisher.seen.lock().unwrap().is_empty());
        let dead = store.get(event.id).unwrap();
        assert_eq!(dead.status, EventStatus::DeadLettered);
        assert_eq!(dead.attempt_count, 0);
        assert!(logs_contain("[dispatcher.dead_letter]"));
    }

    #[test]
    fn each_dispatcher_gets_its_own_lease_owner() {
        let store = InMemoryOutboxStore::new();
        let publisher = PickyPublisher::default();

        let first =
            Dispatcher::new(&store, &publisher, router(), DispatcherConfig::default()).unwrap();
        let second =
            Dispatcher::new(&store, &publisher, router(), DispatcherConfig::default()).unwrap();

        assert!(first.owner.starts_with(&format!("relay-{}-", std::process::id())));
        assert_ne!(first.owner, second.owner);
    }

    #[tokio::test]
    async fn idle_cycles_report_nothing() {
        let store = InMemoryOutboxStore::new();
        let publisher = PickyPublisher::default();
        let dispatcher =
            Dispatcher::new(&store, &publisher, router(), DispatcherConfig::default()).unwrap();

        let report = dispatcher.run_cycle().await.unwrap();

        assert!(report.is_idle());
    }

    #[tokio::test]
    async fn run_stops_when_cancelled() {
        let store = seeded(vec![row("a", "1", Timestamp::now())]).await;
        let publisher = PickyPublisher::default();
        let config = DispatcherConfig::default().with_poll_interval(Duration::from_millis(5));
        let dispatcher = Dispatcher::new(&store, &publisher, router(), config).unwrap();
        let shutdown = CancellationToken::new();

        let stop = shutdown.clone();
        let (stats, ()) = tokio::join!(dispatcher.run(shutdown), async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stop.cancel();
        });

        assert!(stats.cycles >= 1);
        assert_eq!(stats.totals.published, 1);
        assert_eq!(store.status_counts().await.unwrap().published, 1);
    }
}
