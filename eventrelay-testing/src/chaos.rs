//! Failure injection for outbox stores.
//!
//! [`ChaosOutboxStore`] wraps any [`TransactionalStore`] and, at configured
//! rates, fails operations with `StoreFailure` or reports guarded transitions
//! as `LeaseLost` without touching the row.

use std::future::{ready, Future};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use eventrelay_types::{
    DeadLetterCause, EventId, LeaseOwner, Operation, OutboxEvent, OutboxStore, OutboxStoreError,
    StatusCounts, Timestamp, TransactionalStore, Transition,
};
use futures::future::Either;
use nutype::nutype;
use rand::{random, rngs::StdRng, Rng, SeedableRng};
use tracing::debug;

/// Probability value for chaos engineering injection rates.
///
/// Probability represents a value in the range [0.0, 1.0] where 0.0 means
/// never inject failures and 1.0 means always inject failures.
///
/// # Examples
///
/// ```ignore
/// use eventrelay_testing::chaos::Probability;
///
/// let sometimes = Probability::try_new(0.5).unwrap();
///
/// // Values outside [0.0, 1.0] are rejected, and so is NaN
/// assert!(Probability::try_new(1.5).is_err());
/// assert!(Probability::try_new(f32::NAN).is_err());
/// ```
#[nutype(
    validate(finite, greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Display, Into)
)]
pub struct Probability(f32);

impl Probability {
    /// Never inject.
    pub fn never() -> Self {
        Self::try_new(0.0).expect("0.0 is a valid probability")
    }

    /// Clamps `value` into range; NaN means never.
    fn clamped(value: f32) -> Self {
        if value.is_nan() {
            return Self::never();
        }
        Self::try_new(value.clamp(0.0, 1.0)).unwrap_or_else(|_| Self::never())
    }
}

/// Injection rates of a [`ChaosOutboxStore`].
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    deterministic_seed: Option<u64>,
    failure_probability: Probability,
    lease_loss_probability: Probability,
}

impl ChaosConfig {
    /// Seeded configuration, so a failing run can be replayed.
    pub fn deterministic() -> Self {
        Self {
            deterministic_seed: Some(0),
            ..Self::default()
        }
    }

    /// Chance that any operation fails with `StoreFailure` before reaching
    /// the wrapped store.
    #[must_use]
    pub fn with_failure_probability(mut self, probability: f32) -> Self {
        self.failure_probability = Probability::clamped(probability);
        self
    }

    /// Chance that an owner-guarded transition reports `LeaseLost` without
    /// touching the row, as if another instance had reclaimed it.
    #[must_use]
    pub fn with_lease_loss_probability(mut self, probability: f32) -> Self {
        self.lease_loss_probability = Probability::clamped(probability);
        self
    }
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            deterministic_seed: None,
            failure_probability: Probability::never(),
            lease_loss_probability: Probability::never(),
        }
    }
}

/// Wraps a store with [`ChaosOutboxStore`].
pub trait ChaosOutboxStoreExt: Sized {
    /// Wraps `self` with the given injection rates.
    fn with_chaos(self, config: ChaosConfig) -> ChaosOutboxStore<Self>;
}

/// An `OutboxStore` that randomly fails or loses leases.
pub struct ChaosOutboxStore<S> {
    store: S,
    config: ChaosConfig,
    rng: Mutex<StdRng>,
}

impl<S> ChaosOutboxStore<S> {
    /// Wraps `store`.
    pub fn new(store: S, config: ChaosConfig) -> Self {
        let rng = match config.deterministic_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(random()),
        };

        Self {
            store,
            config,
            rng: Mutex::new(rng),
        }
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.store
    }

    fn should_inject(&self, probability: Probability) -> bool {
        let probability: f32 = probability.into();

        if probability <= 0.0 {
            return false;
        }

        if probability >= 1.0 {
            return true;
        }

        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        rng.random_bool(f64::from(probability))
    }

    fn inject_failure<T>(&self, operation: Operation) -> Option<Result<T, OutboxStoreError>> {
        self.should_inject(self.config.failure_probability).then(|| {
            debug!(operation = %operation, "[chaos.failure] injected store failure");
            Err(OutboxStoreError::StoreFailure { operation })
        })
    }

    fn inject_lease_loss(&self, operation: Operation) -> Option<Result<Transition, OutboxStoreError>> {
        if let Some(failure) = self.inject_failure(operation) {
            return Some(failure);
        }
        self.should_inject(self.config.lease_loss_probability).then(|| {
            debug!(operation = %operation, "[chaos.lease_lost] injected lost lease");
            Ok(Transition::LeaseLost)
        })
    }
}

fn injected<T, F>(
    injection: Option<Result<T, OutboxStoreError>>,
    call: impl FnOnce() -> F,
) -> Either<std::future::Ready<Result<T, OutboxStoreError>>, F>
where
    F: Future<Output = Result<T, OutboxStoreError>>,
{
    match injection {
        Some(result) => Either::Left(ready(result)),
        None => Either::Right(call()),
    }
}

impl<S> OutboxStore for ChaosOutboxStore<S>
where
    S: OutboxStore + Sync,
{
    type Transaction<'t> = S::Transaction<'t>;

    fn append(
        &self,
        tx: &mut Self::Transaction<'_>,
        events: Vec<OutboxEvent>,
    ) -> impl Future<Output = Result<(), OutboxStoreError>> + Send {
        injected(self.inject_failure(Operation::AppendEvents), || {
            self.store.append(tx, events)
        })
    }

    fn claim_batch(
        &self,
        owner: &LeaseOwner,
        lease_duration: Duration,
        batch_size: usize,
        now: Timestamp,
    ) -> impl Future<Output = Result<Vec<OutboxEvent>, OutboxStoreError>> + Send {
        injected(self.inject_failure(Operation::ClaimBatch), || {
            self.store
                .claim_batch(owner, lease_duration, batch_size, now)
        })
    }

    fn mark_published(
        &self,
        id: EventId,
        owner: &LeaseOwner,
        now: Timestamp,
    ) -> impl Future<Output = Result<Transition, OutboxStoreError>> + Send {
        injected(self.inject_lease_loss(Operation::MarkPublished), || {
            self.store.mark_published(id, owner, now)
        })
    }

    fn mark_retry(
        &self,
        id: EventId,
        owner: &LeaseOwner,
        next_attempt_at: Timestamp,
        error: &str,
    ) -> impl Future<Output = Result<Transition, OutboxStoreError>> + Send {
        injected(self.inject_lease_loss(Operation::MarkRetry), || {
            self.store.mark_retry(id, owner, next_attempt_at, error)
        })
    }

    fn mark_dead_lettered(
        &self,
        id: EventId,
        owner: Option<&LeaseOwner>,
        cause: DeadLetterCause,
        error: &str,
    ) -> impl Future<Output = Result<Transition, OutboxStoreError>> + Send {
        // Operator dead-letters hold no lease, so only failures apply to them.
        let injection = if owner.is_some() {
            self.inject_lease_loss(Operation::MarkDeadLettered)
        } else {
            self.inject_failure(Operation::MarkDeadLettered)
        };
        injected(injection, || {
            self.store.mark_dead_lettered(id, owner, cause, error)
        })
    }

    fn release_leases(
        &self,
        ids: &[EventId],
        owner: &LeaseOwner,
    ) -> impl Future<Output = Result<u64, OutboxStoreError>> + Send {
        injected(self.inject_failure(Operation::ReleaseLeases), || {
            self.store.release_leases(ids, owner)
        })
    }

    fn release_expired_leases(
        &self,
        now: Timestamp,
    ) -> impl Future<Output = Result<u64, OutboxStoreError>> + Send {
        injected(self.inject_failure(Operation::ReleaseExpiredLeases), || {
            self.store.release_expired_leases(now)
        })
    }

    fn status_counts(&self) -> impl Future<Output = Result<StatusCounts, OutboxStoreError>> + Send {
        injected(self.inject_failure(Operation::StatusCounts), || {
            self.store.status_counts()
        })
    }
}

impl<S> TransactionalStore for ChaosOutboxStore<S>
where
    S: TransactionalStore + Sync,
{
    fn begin_transaction(
        &self,
    ) -> impl Future<Output = Result<Self::Transaction<'_>, OutboxStoreError>> + Send {
        let failure = self.inject_failure::<()>(Operation::BeginTransaction);
        let store = &self.store;
        async move {
            if let Some(Err(failure)) = failure {
                return Err(failure);
            }
            store.begin_transaction().await
        }
    }

    fn commit_transaction<'t>(
        &'t self,
        tx: Self::Transaction<'t>,
    ) -> impl Future<Output = Result<(), OutboxStoreError>> + Send + 't {
        // A failed commit drops `tx`, which rolls it back.
        injected(self.inject_failure(Operation::CommitTransaction), || {
            self.store.commit_transaction(tx)
        })
    }

    fn rollback_transaction<'t>(
        &'t self,
        tx: Self::Transaction<'t>,
    ) -> impl Future<Output = Result<(), OutboxStoreError>> + Send + 't {
        self.store.rollback_transaction(tx)
    }
}

impl<S> ChaosOutboxStoreExt for S
where
    S: OutboxStore + Sync,
{
    fn with_chaos(self, config: ChaosConfig) -> ChaosOutboxStore<Self> {
        ChaosOutboxStore::new(self, config)
    }
}

impl<S: std::fmt::Debug> std::fmt::Debug for ChaosOutboxStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosOutboxStore")
            .field("store", &self.store)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use eventrelay_memory::InMemoryOutboxStore;
    use eventrelay_types::{EventType, Headers, PartitionKey, SchemaVersion};
    use tracing_test::traced_test;

    #[test]
    fn deterministic_config_sets_seed() {
        let default_is_none = ChaosConfig::default().deterministic_seed.is_none();
        let deterministic_is_some = ChaosConfig::deterministic().deterministic_seed.is_some();

        assert!(default_is_none && deterministic_is_some);
    }

    #[test]
    fn out_of_range_probabilities_are_clamped() {
        let config = ChaosConfig::default()
            .with_failure_probability(3.0)
            .with_lease_loss_probability(f32::NAN);

        assert_eq!(f32::from(config.failure_probability), 1.0);
        assert_eq!(f32::from(config.lease_loss_probability), 0.0);
    }

    #[test]
    fn nan_probability_is_rejected() {
        assert!(Probability::try_new(f32::NAN).is_err());
    }

    #[tokio::test]
    async fn nan_probabilities_never_inject() {
        // Given: a leasable row behind a store configured with NaN rates
        let inner = Arc::new(InMemoryOutboxStore::new());
        let now = Timestamp::now();
        let row = OutboxEvent::new(
            EventId::new(),
            PartitionKey::try_new("chaos-partition").unwrap(),
            EventType::try_new("ChaosEvent").unwrap(),
            SchemaVersion::initial(),
            b"{}".to_vec(),
            Headers::new(),
            now,
        );
        let id = row.id;
        let mut tx = inner.begin();
        inner.append(&mut tx, vec![row]).await.unwrap();
        inner.commit(tx).unwrap();
        let store = Arc::clone(&inner).with_chaos(
            ChaosConfig::deterministic()
                .with_failure_probability(f32::NAN)
                .with_lease_loss_probability(f32::NAN),
        );
        let owner = LeaseOwner::try_new("chaos-owner").unwrap();

        // When: the row is claimed and published through it
        let claimed = store
            .claim_batch(&owner, Duration::from_secs(30), 1, now)
            .await;
        let transition = store.mark_published(id, &owner, now).await;

        // Then: both calls reach the wrapped store
        assert_eq!(claimed.map(|rows| rows.len()), Ok(1));
        assert_eq!(transition, Ok(Transition::Applied));
    }

    #[tokio::test]
    async fn zero_probability_passes_through() {
        let store = InMemoryOutboxStore::new().with_chaos(ChaosConfig::default());

        let counts = store.status_counts().await;

        assert_eq!(counts, Ok(StatusCounts::default()));
    }

    #[tokio::test]
    async fn certain_failure_names_the_operation() {
        let store = InMemoryOutboxStore::new()
            .with_chaos(ChaosConfig::deterministic().with_failure_probability(1.0));

        let result = store.release_expired_leases(Timestamp::now()).await;

        assert_eq!(
            result,
            Err(OutboxStoreError::StoreFailure {
                operation: Operation::ReleaseExpiredLeases
            })
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn injected_lease_loss_is_logged() {
        let store = InMemoryOutboxStore::new()
            .with_chaos(ChaosConfig::deterministic().with_lease_loss_probability(1.0));
        let owner = LeaseOwner::try_new("chaos-owner").unwrap();

        let transition = store
            .mark_published(EventId::new(), &owner, Timestamp::now())
            .await;

        assert_eq!(transition, Ok(Transition::LeaseLost));
        assert!(logs_contain("[chaos.lease_lost] injected lost lease"));
    }
}
