//! In-memory outbox store for `EventRelay`
//!
//! This crate provides an implementation of the `OutboxStore` trait backed by
//! a mutex-guarded ordered map. It honours the same guarantees as the
//! PostgreSQL backend (staged appends, exclusive leases, per-partition
//! head-of-line claiming) and is meant for tests and development.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use eventrelay_types::{
    DeadLetterCause, EventId, EventStatus, LeaseOwner, Operation, OutboxEvent, OutboxStore,
    OutboxStoreError, PartitionKey, StatusCounts, Timestamp, TransactionalStore, Transition,
};
use tracing::{debug, instrument};

type OrderKey = (Timestamp, EventId);

#[derive(Default)]
struct OutboxState {
    rows: BTreeMap<OrderKey, OutboxEvent>,
    index: HashMap<EventId, OrderKey>,
}

impl OutboxState {
    fn row_mut(&mut self, id: EventId) -> Option<&mut OutboxEvent> {
        let key = self.index.get(&id)?;
        self.rows.get_mut(key)
    }
}

/// Rows appended but not yet committed.
///
/// Dropping the transaction without [`InMemoryOutboxStore::commit`] rolls it
/// back.
#[derive(Debug, Default)]
pub struct InMemoryTransaction {
    staged: Vec<OutboxEvent>,
}

impl InMemoryTransaction {
    /// Rows staged so far.
    pub fn staged(&self) -> &[OutboxEvent] {
        &self.staged
    }
}

/// Thread-safe in-memory outbox store.
#[derive(Default)]
pub struct InMemoryOutboxStore {
    state: Mutex<OutboxState>,
}

impl InMemoryOutboxStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a transaction for [`OutboxStore::append`].
    pub fn begin(&self) -> InMemoryTransaction {
        InMemoryTransaction::default()
    }

    /// Makes every row staged on `tx` visible at once, or none of them.
    pub fn commit(&self, tx: InMemoryTransaction) -> Result<(), OutboxStoreError> {
        let mut state = self.lock(Operation::CommitTransaction)?;

        for event in &tx.staged {
            if state.index.contains_key(&event.id) {
                return Err(OutboxStoreError::DuplicateEventId { event_id: event.id });
            }
        }

        let committed = tx.staged.len();
        for event in tx.staged {
            let key = event.order_key();
            let _ = state.index.insert(event.id, key);
            let _ = state.rows.insert(key, event);
        }
        debug!(committed, "[memory.commit] transaction committed");
        Ok(())
    }

    /// Snapshot of every row in `(created_at, id)` order.
    pub fn rows(&self) -> Vec<OutboxEvent> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .rows
            .values()
            .cloned()
            .collect()
    }

    /// Snapshot of one row.
    pub fn get(&self, id: EventId) -> Option<OutboxEvent> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .index
            .get(&id)
            .and_then(|key| state.rows.get(key))
            .cloned()
    }

    fn lock(&self, operation: Operation) -> Result<MutexGuard<'_, OutboxState>, OutboxStoreError> {
        self.state
            .lock()
            .map_err(|_| OutboxStoreError::StoreFailure { operation })
    }

    fn transition(
        &self,
        operation: Operation,
        id: EventId,
        apply: impl FnOnce(&mut OutboxEvent) -> Transition,
    ) -> Result<Transition, OutboxStoreError> {
        let mut state = self.lock(operation)?;
        Ok(state.row_mut(id).map_or(Transition::LeaseLost, apply))
    }
}

fn clear_lease(row: &mut OutboxEvent) {
    row.lease_owner = None;
    row.lease_expires_at = None;
}

impl OutboxStore for InMemoryOutboxStore {
    type Transaction<'t> = InMemoryTransaction;

    async fn append(
        &self,
        tx: &mut Self::Transaction<'_>,
        events: Vec<OutboxEvent>,
    ) -> Result<(), OutboxStoreError> {
        let state = self.lock(Operation::AppendEvents)?;
        let mut seen: HashSet<EventId> = tx.staged.iter().map(|event| event.id).collect();
        for event in &events {
            if state.index.contains_key(&event.id) || !seen.insert(event.id) {
                return Err(OutboxStoreError::DuplicateEventId { event_id: event.id });
            }
        }
        drop(state);

        // Rows keep their `created_at`; commit order never reorders a partition.
        tx.staged.extend(events);
        Ok(())
    }

    #[instrument(name = "memory.claim_batch", skip(self))]
    async fn claim_batch(
        &self,
        owner: &LeaseOwner,
        lease_duration: Duration,
        batch_size: usize,
        now: Timestamp,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let mut state = self.lock(Operation::ClaimBatch)?;
        let mut blocked: HashSet<PartitionKey> = HashSet::new();
        let mut chosen: Vec<OrderKey> = Vec::new();

        for (key, row) in &state.rows {
            if chosen.len() >= batch_size {
                break;
            }
            if row.status.is_terminal() || blocked.contains(&row.partition_key) {
                continue;
            }
            if row.status == EventStatus::Pending && row.next_attempt_at <= now {
                chosen.push(*key);
            } else {
                // A leased row or one in backoff holds back its whole partition.
                let _ = blocked.insert(row.partition_key.clone());
            }
        }

        let lease_expires_at = now.plus(lease_duration);
        let mut claimed = Vec::with_capacity(chosen.len());
        for key in chosen {
            if let Some(row) = state.rows.get_mut(&key) {
                row.status = EventStatus::Leased;
                row.lease_owner = Some(owner.clone());
                row.lease_expires_at = Some(lease_expires_at);
                claimed.push(row.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_published(
        &self,
        id: EventId,
        owner: &LeaseOwner,
        now: Timestamp,
    ) -> Result<Transition, OutboxStoreError> {
        self.transition(Operation::MarkPublished, id, |row| {
            if !row.is_leased_by(owner) {
                return Transition::LeaseLost;
            }
            row.status = EventStatus::Published;
            row.attempt_count = row.attempt_count.saturating_add(1);
            row.published_at = Some(now);
            clear_lease(row);
            Transition::Applied
        })
    }

    async fn mark_retry(
        &self,
        id: EventId,
        owner: &LeaseOwner,
        next_attempt_at: Timestamp,
        error: &str,
    ) -> Result<Transition, OutboxStoreError> {
        self.transition(Operation::MarkRetry, id, |row| {
            if !row.is_leased_by(owner) {
                return Transition::LeaseLost;
            }
            row.status = EventStatus::Pending;
            row.attempt_count = row.attempt_count.saturating_add(1);
            row.next_attempt_at = next_attempt_at;
            row.last_error = Some(error.to_string());
            clear_lease(row);
            Transition::Applied
        })
    }

    async fn mark_dead_lettered(
        &self,
        id: EventId,
        owner: Option<&LeaseOwner>,
        cause: DeadLetterCause,
        error: &str,
    ) -> Result<Transition, OutboxStoreError> {
        self.transition(Operation::MarkDeadLettered, id, |row| {
            let allowed = match owner {
                Some(owner) => row.is_leased_by(owner),
                None => !row.status.is_terminal(),
            };
            if !allowed {
                return Transition::LeaseLost;
            }
            row.status = EventStatus::DeadLettered;
            if cause.reached_broker() {
                row.attempt_count = row.attempt_count.saturating_add(1);
            }
            row.last_error = Some(error.to_string());
            clear_lease(row);
            Transition::Applied
        })
    }

    async fn release_leases(
        &self,
        ids: &[EventId],
        owner: &LeaseOwner,
    ) -> Result<u64, OutboxStoreError> {
        let mut state = self.lock(Operation::ReleaseLeases)?;
        let mut released = 0;
        for id in ids {
            if let Some(row) = state.row_mut(*id) {
                if row.is_leased_by(owner) {
                    row.status = EventStatus::Pending;
                    clear_lease(row);
                    released += 1;
                }
            }
        }
        Ok(released)
    }

    async fn release_expired_leases(&self, now: Timestamp) -> Result<u64, OutboxStoreError> {
        let mut state = self.lock(Operation::ReleaseExpiredLeases)?;
        let mut released = 0;
        for row in state.rows.values_mut() {
            let lapsed = row
                .lease_expires_at
                .is_some_and(|expires_at| expires_at < now);
            if row.status == EventStatus::Leased && lapsed {
                row.status = EventStatus::Pending;
                clear_lease(row);
                released += 1;
            }
        }
        Ok(released)
    }

    async fn status_counts(&self) -> Result<StatusCounts, OutboxStoreError> {
        let state = self.lock(Operation::StatusCounts)?;
        let mut counts = StatusCounts::default();
        for row in state.rows.values() {
            counts.record(row.status);
        }
        Ok(counts)
    }
}

impl TransactionalStore for InMemoryOutboxStore {
    fn begin_transaction(
        &self,
    ) -> impl Future<Output = Result<InMemoryTransaction, OutboxStoreError>> + Send {
        std::future::ready(Ok(self.begin()))
    }

    fn commit_transaction<'t>(
        &'t self,
        tx: InMemoryTransaction,
    ) -> impl Future<Output = Result<(), OutboxStoreError>> + Send + 't {
        std::future::ready(self.commit(tx))
    }

    fn rollback_transaction<'t>(
        &'t self,
        tx: InMemoryTransaction,
    ) -> impl Future<Output = Result<(), OutboxStoreError>> + Send + 't {
        drop(tx);
        std::future::ready(Ok(()))
    }
}

impl std::fmt::Debug for InMemoryOutboxStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rows = self
            .state
            .lock()
            .map(|state| state.rows.len())
            .unwrap_or_default();
        f.debug_struct("InMemoryOutboxStore")
            .field("rows", &rows)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventrelay_types::{EventType, Headers, SchemaVersion};

    fn owner(name: &str) -> LeaseOwner {
        LeaseOwner::try_new(name).unwrap()
    }

    fn row(partition: &str, created_at: Timestamp) -> OutboxEvent {
        OutboxEvent::new(
            EventId::new(),
            PartitionKey::try_new(partition).unwrap(),
            EventType::try_new("OrderPlaced").unwrap(),
            SchemaVersion::initial(),
            br#"{}"#.to_vec(),
            Headers::new(),
            created_at,
        )
    }

    async fn store_with(rows: Vec<OutboxEvent>) -> InMemoryOutboxStore {
        let store = InMemoryOutboxStore::new();
        let mut tx = store.begin();
        store.append(&mut tx, rows).await.unwrap();
        store.commit(tx).unwrap();
        store
    }

    #[tokio::test]
    async fn uncommitted_rows_are_invisible_to_claimers() {
        // Given: a row appended on an open transaction
        let store = InMemoryOutboxStore::new();
        let now = Timestamp::now();
        let mut tx = store.begin();
        store.append(&mut tx, vec![row("a", now)]).await.unwrap();

        // When: a dispatcher claims before the commit
        let claimed = store
            .claim_batch(&owner("relay-1"), Duration::from_secs(30), 10, now)
            .await
            .unwrap();

        // Then: nothing is visible
        assert!(claimed.is_empty());
        assert_eq!(tx.staged().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected_at_append() {
        let now = Timestamp::now();
        let existing = row("a", now);
        let store = store_with(vec![existing.clone()]).await;

        let mut tx = store.begin();
        let result = store.append(&mut tx, vec![existing.clone()]).await;

        assert_eq!(
            result,
            Err(OutboxStoreError::DuplicateEventId {
                event_id: existing.id
            })
        );
    }

    #[tokio::test]
    async fn rows_in_backoff_hold_back_their_partition() {
        // Given: the head of partition "a" is waiting for its retry
        let now = Timestamp::now();
        let mut head = row("a", now);
        head.next_attempt_at = now.plus(Duration::from_secs(60));
        let follower = row("a", now.plus(Duration::from_millis(1)));
        let other = row("b", now.plus(Duration::from_millis(2)));
        let store = store_with(vec![head, follower, other.clone()]).await;

        // When: claiming after all rows were created
        let later = now.plus(Duration::from_secs(1));
        let claimed = store
            .claim_batch(&owner("relay-1"), Duration::from_secs(30), 10, later)
            .await
            .unwrap();

        // Then: only the independent partition is handed out
        assert_eq!(
            claimed.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![other.id]
        );
    }

    #[tokio::test]
    async fn expired_leases_return_to_pending_without_an_attempt() {
        let now = Timestamp::now();
        let event = row("a", now);
        let store = store_with(vec![event.clone()]).await;
        let _ = store
            .claim_batch(&owner("crashed"), Duration::from_secs(30), 10, now)
            .await
            .unwrap();

        let released = store
            .release_expired_leases(now.plus(Duration::from_secs(31)))
            .await
            .unwrap();

        assert_eq!(released, 1);
        let row = store.get(event.id).unwrap();
        assert_eq!(row.status, EventStatus::Pending);
        assert_eq!(row.lease_owner, None);
        assert_eq!(row.attempt_count, 0);
    }

    #[tokio::test]
    async fn status_counts_track_each_state() {
        let now = Timestamp::now();
        let first = row("a", now);
        let second = row("b", now.plus(Duration::from_millis(1)));
        let store = store_with(vec![first.clone(), second]).await;
        let relay = owner("relay-1");
        let _ = store
            .claim_batch(&relay, Duration::from_secs(30), 1, now)
            .await
            .unwrap();
        let _ = store.mark_published(first.id, &relay, now).await.unwrap();

        let counts = store.status_counts().await.unwrap();

        assert_eq!(counts.published, 1);
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.leased, 0);
        assert_eq!(counts.dead_lettered, 0);
    }
}
