use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::event::{DeadLetterCause, OutboxEvent, StatusCounts};
use crate::types::{EventId, LeaseOwner, Timestamp};

/// Identifies the outbox store operation that failed.
///
/// Used by `OutboxStoreError::StoreFailure` to provide strongly-typed
/// identification of which operation encountered an infrastructure failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Inserting rows inside the caller's transaction.
    AppendEvents,
    /// Selecting and leasing a batch of rows.
    ClaimBatch,
    /// `Leased → Published`.
    MarkPublished,
    /// `Leased → Pending` after a failed attempt.
    MarkRetry,
    /// Any non-terminal state `→ DeadLettered`.
    MarkDeadLettered,
    /// Explicit `Leased → Pending` without an attempt.
    ReleaseLeases,
    /// Housekeeping of lapsed leases.
    ReleaseExpiredLeases,
    /// Reading per-status row counts.
    StatusCounts,
    /// Beginning a database transaction.
    BeginTransaction,
    /// Committing a database transaction.
    CommitTransaction,
    /// Rolling back a database transaction.
    RollbackTransaction,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::AppendEvents => write!(f, "append_events"),
            Operation::ClaimBatch => write!(f, "claim_batch"),
            Operation::MarkPublished => write!(f, "mark_published"),
            Operation::MarkRetry => write!(f, "mark_retry"),
            Operation::MarkDeadLettered => write!(f, "mark_dead_lettered"),
            Operation::ReleaseLeases => write!(f, "release_leases"),
            Operation::ReleaseExpiredLeases => write!(f, "release_expired_leases"),
            Operation::StatusCounts => write!(f, "status_counts"),
            Operation::BeginTransaction => write!(f, "begin_transaction"),
            Operation::CommitTransaction => write!(f, "commit_transaction"),
            Operation::RollbackTransaction => write!(f, "rollback_transaction"),
        }
    }
}

/// Error type returned by outbox store operations.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum OutboxStoreError {
    /// Infrastructure failure surfaced by the backing store (connection drop,
    /// timeout, poisoned lock).
    #[error("{operation} operation failed")]
    StoreFailure {
        /// Store operation that failed.
        operation: Operation,
    },

    /// An appended row reused an id that already exists.
    #[error("duplicate outbox event id {event_id}")]
    DuplicateEventId {
        /// The reused id.
        event_id: EventId,
    },

    /// A persisted row could not be mapped back into an [`OutboxEvent`].
    #[error("corrupt outbox row: {detail}")]
    CorruptRow {
        /// What could not be mapped.
        detail: String,
    },
}

/// Outcome of a guarded state transition.
///
/// `LeaseLost` is the benign race where the caller's lease expired or was
/// reclaimed by another instance; the row was left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The row moved to the requested state.
    Applied,
    /// The caller no longer holds the lease; nothing changed.
    LeaseLost,
}

impl Transition {
    /// Returns true when the transition took effect.
    pub const fn is_applied(self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Durable storage for not-yet-published events.
///
/// The store is the single shared mutable resource between dispatcher
/// instances; every coordination guarantee (lease exclusivity, per-partition
/// ordering) comes from the atomic operations below.
///
/// Implementations include:
/// - `eventrelay-postgres`: PostgreSQL backend using `SKIP LOCKED` claims
/// - `eventrelay-memory`: In-memory backend for tests and development
pub trait OutboxStore {
    /// Externally supplied transaction handle that scopes [`append`](Self::append).
    type Transaction<'t>;

    /// Insert `events` inside the caller's transaction.
    ///
    /// Nothing becomes visible to claimers until the caller commits. An error
    /// means the caller must roll back its whole transaction.
    ///
    /// Order within a partition is `(created_at, id)`, fixed by the appender
    /// before commit, not commit order. Two transactions appending to one
    /// partition concurrently may commit in the opposite order of their
    /// timestamps, and the rows are still delivered by timestamp. A producer
    /// that needs commit order for a partition must serialize its writes to
    /// it, e.g. by locking the aggregate row in the same transaction.
    fn append(
        &self,
        tx: &mut Self::Transaction<'_>,
        events: Vec<OutboxEvent>,
    ) -> impl Future<Output = Result<(), OutboxStoreError>> + Send;

    /// Atomically lease up to `batch_size` eligible rows for `owner`.
    ///
    /// A row is eligible when it is `Pending`, `next_attempt_at <= now`, and
    /// every earlier non-terminal row with the same partition key is eligible
    /// as well (head-of-line ordering). Concurrent claimers never receive the
    /// same row. Rows are returned sorted by `(created_at, id)`.
    fn claim_batch(
        &self,
        owner: &LeaseOwner,
        lease_duration: Duration,
        batch_size: usize,
        now: Timestamp,
    ) -> impl Future<Output = Result<Vec<OutboxEvent>, OutboxStoreError>> + Send;

    /// `Leased → Published`, incrementing `attempt_count`.
    fn mark_published(
        &self,
        id: EventId,
        owner: &LeaseOwner,
        now: Timestamp,
    ) -> impl Future<Output = Result<Transition, OutboxStoreError>> + Send;

    /// `Leased → Pending`, incrementing `attempt_count` and recording `error`.
    fn mark_retry(
        &self,
        id: EventId,
        owner: &LeaseOwner,
        next_attempt_at: Timestamp,
        error: &str,
    ) -> impl Future<Output = Result<Transition, OutboxStoreError>> + Send;

    /// Any non-terminal state `→ DeadLettered`.
    ///
    /// When `owner` is given the row must still be leased by that owner.
    /// `attempt_count` is incremented when the cause reached the broker.
    fn mark_dead_lettered(
        &self,
        id: EventId,
        owner: Option<&LeaseOwner>,
        cause: DeadLetterCause,
        error: &str,
    ) -> impl Future<Output = Result<Transition, OutboxStoreError>> + Send;

    /// Explicit `Leased → Pending` for rows that were not attempted.
    ///
    /// Returns the number of rows released; rows no longer leased by `owner`
    /// are skipped.
    fn release_leases(
        &self,
        ids: &[EventId],
        owner: &LeaseOwner,
    ) -> impl Future<Output = Result<u64, OutboxStoreError>> + Send;

    /// Return rows whose lease lapsed before `now` to `Pending`.
    fn release_expired_leases(
        &self,
        now: Timestamp,
    ) -> impl Future<Output = Result<u64, OutboxStoreError>> + Send;

    /// Count rows per status.
    fn status_counts(&self) -> impl Future<Output = Result<StatusCounts, OutboxStoreError>> + Send;
}

/// A store that can open the transactions [`OutboxStore::append`] runs in.
///
/// Production callers usually bring their own transaction (the one carrying
/// the business write); this trait lets generic code such as test suites and
/// demos drive a store end to end.
pub trait TransactionalStore: OutboxStore {
    /// Opens a new transaction.
    fn begin_transaction(
        &self,
    ) -> impl Future<Output = Result<Self::Transaction<'_>, OutboxStoreError>> + Send;

    /// Commits `tx`, making its appended rows visible to claimers.
    fn commit_transaction<'t>(
        &'t self,
        tx: Self::Transaction<'t>,
    ) -> impl Future<Output = Result<(), OutboxStoreError>> + Send + 't;

    /// Discards `tx` and everything appended on it.
    fn rollback_transaction<'t>(
        &'t self,
        tx: Self::Transaction<'t>,
    ) -> impl Future<Output = Result<(), OutboxStoreError>> + Send + 't;
}

macro_rules! delegate_outbox_store {
    ($target:ty) => {
        impl<T: OutboxStore + Send + Sync> OutboxStore for $target {
            type Transaction<'t> = T::Transaction<'t>;

            fn append(
                &self,
                tx: &mut Self::Transaction<'_>,
                events: Vec<OutboxEvent>,
            ) -> impl Future<Output = Result<(), OutboxStoreError>> + Send {
                (**self).append(tx, events)
            }

            fn claim_batch(
                &self,
                owner: &LeaseOwner,
                lease_duration: Duration,
                batch_size: usize,
                now: Timestamp,
            ) -> impl Future<Output = Result<Vec<OutboxEvent>, OutboxStoreError>> + Send {
                (**self).claim_batch(owner, lease_duration, batch_size, now)
            }

            fn mark_published(
                &self,
                id: EventId,
                owner: &LeaseOwner,
                now: Timestamp,
            ) -> impl Future<Output = Result<Transition, OutboxStoreError>> + Send {
                (**self).mark_published(id, owner, now)
            }

            fn mark_retry(
                &self,
                id: EventId,
                owner: &LeaseOwner,
                next_attempt_at: Timestamp,
                error: &str,
            ) -> impl Future<Output = Result<Transition, OutboxStoreError>> + Send {
                (**self).mark_retry(id, owner, next_attempt_at, error)
            }

            fn mark_dead_lettered(
                &self,
                id: EventId,
                owner: Option<&LeaseOwner>,
                cause: DeadLetterCause,
                error: &str,
            ) -> impl Future<Output = Result<Transition, OutboxStoreError>> + Send {
                (**self).mark_dead_lettered(id, owner, cause, error)
            }

            fn release_leases(
                &self,
                ids: &[EventId],
                owner: &LeaseOwner,
            ) -> impl Future<Output = Result<u64, OutboxStoreError>> + Send {
                (**self).release_leases(ids, owner)
            }

            fn release_expired_leases(
                &self,
                now: Timestamp,
            ) -> impl Future<Output = Result<u64, OutboxStoreError>> + Send {
                (**self).release_expired_leases(now)
            }

            fn status_counts(
                &self,
            ) -> impl Future<Output = Result<StatusCounts, OutboxStoreError>> + Send {
                (**self).status_counts()
            }
        }
    };
}

macro_rules! delegate_transactional_store {
    ($target:ty) => {
        impl<T: TransactionalStore + Send + Sync> TransactionalStore for $target {
            fn begin_transaction(
                &self,
            ) -> impl Future<Output = Result<Self::Transaction<'_>, OutboxStoreError>> + Send {
                (**self).begin_transaction()
            }

            fn commit_transaction<'t>(
                &'t self,
                tx: Self::Transaction<'t>,
            ) -> impl Future<Output = Result<(), OutboxStoreError>> + Send + 't {
                (**self).commit_transaction(tx)
            }

            fn rollback_transaction<'t>(
                &'t self,
                tx: Self::Transaction<'t>,
            ) -> impl Future<Output = Result<(), OutboxStoreError>> + Send + 't {
                (**self).rollback_transaction(tx)
            }
        }
    };
}

// Shared handles (`&store`, `Arc<store>`) are stores too, so one backend can
// serve an appender and several dispatchers at once.
delegate_outbox_store!(&T);
delegate_outbox_store!(Arc<T>);
delegate_transactional_store!(&T);
delegate_transactional_store!(Arc<T>);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operations_display_as_snake_case() {
        assert_eq!(Operation::ClaimBatch.to_string(), "claim_batch");
        assert_eq!(
            Operation::ReleaseExpiredLeases.to_string(),
            "release_expired_leases"
        );
    }

    #[test]
    fn store_failure_message_names_the_operation() {
        let error = OutboxStoreError::StoreFailure {
            operation: Operation::MarkRetry,
        };

        assert_eq!(error.to_string(), "mark_retry operation failed");
    }

    #[test]
    fn lease_lost_is_not_applied() {
        assert!(Transition::Applied.is_applied());
        assert!(!Transition::LeaseLost.is_applied());
    }
}
