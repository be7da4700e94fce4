//! PostgreSQL outbox store for `EventRelay`
//!
//! Rows live in the `eventrelay_outbox` table (see `migrations/`). Appends run
//! inside the caller's `sqlx` transaction. Claims lease rows with
//! `FOR UPDATE SKIP LOCKED` after taking a transaction-scoped advisory lock
//! per partition key, so concurrent dispatchers never block each other, never
//! lease the same row, and never work on the same partition at once.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::time::Duration;

use chrono::{DateTime, Utc};
use eventrelay_types::{
    DeadLetterCause, EventId, EventStatus, EventType, Headers, LeaseOwner, Operation,
    OutboxEvent, OutboxStore, OutboxStoreError, PartitionKey, SchemaVersion, StatusCounts,
    Timestamp, TransactionalStore, Transition,
};
use nutype::nutype;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{query, query_scalar, Pool, Postgres, Row};
use thiserror::Error;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

/// Errors raised while setting up a [`PostgresOutboxStore`].
#[derive(Debug, Error)]
pub enum PostgresOutboxStoreError {
    /// The connection pool could not be created.
    #[error("failed to create postgres connection pool")]
    ConnectionFailed(#[source] sqlx::Error),

    /// The schema migrations did not apply.
    #[error("failed to apply outbox migrations")]
    MigrationFailed(#[source] sqlx::migrate::MigrateError),
}

/// Maximum number of database connections in the pool.
///
/// Must be at least 1, enforced by using `NonZeroU32` as the underlying type.
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRef, Into))]
pub struct MaxConnections(std::num::NonZeroU32);

/// Configuration for the [`PostgresOutboxStore`] connection pool.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Maximum number of connections in the pool (default: 10)
    pub max_connections: MaxConnections,
    /// Timeout for acquiring a connection from the pool (default: 30 seconds)
    pub acquire_timeout: Duration,
    /// Idle timeout for connections in the pool (default: 10 minutes)
    pub idle_timeout: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        const DEFAULT_MAX_CONNECTIONS: std::num::NonZeroU32 = match std::num::NonZeroU32::new(10) {
            Some(v) => v,
            None => unreachable!(),
        };

        Self {
            max_connections: MaxConnections::new(DEFAULT_MAX_CONNECTIONS),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// Outbox store backed by PostgreSQL.
#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: Pool<Postgres>,
}

impl PostgresOutboxStore {
    /// Connects with the default pool configuration.
    pub async fn new<S: Into<String>>(
        connection_string: S,
    ) -> Result<Self, PostgresOutboxStoreError> {
        Self::with_config(connection_string, PostgresConfig::default()).await
    }

    /// Connects with a custom pool configuration.
    pub async fn with_config<S: Into<String>>(
        connection_string: S,
        config: PostgresConfig,
    ) -> Result<Self, PostgresOutboxStoreError> {
        let connection_string = connection_string.into();
        let max_connections: std::num::NonZeroU32 = config.max_connections.into();
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.get())
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .connect(&connection_string)
            .await
            .map_err(PostgresOutboxStoreError::ConnectionFailed)?;
        Ok(Self { pool })
    }

    /// Wraps an existing pool, typically the one the application already
    /// uses for its business tables.
    pub fn from_pool(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    /// Creates the outbox table and indexes if they do not exist.
    pub async fn migrate(&self) -> Result<(), PostgresOutboxStoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(PostgresOutboxStoreError::MigrationFailed)
    }

    /// Begins a transaction for business writes plus
    /// [`OutboxStore::append`].
    pub async fn begin(&self) -> Result<sqlx::Transaction<'static, Postgres>, OutboxStoreError> {
        self.pool
            .begin()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::BeginTransaction))
    }

    async fn guarded_update(
        &self,
        operation: Operation,
        statement: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Transition, OutboxStoreError> {
        let result = statement
            .execute(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, operation))?;
        if result.rows_affected() == 1 {
            Ok(Transition::Applied)
        } else {
            debug!(operation = %operation, "[postgres.lease_lost] guarded update matched no row");
            Ok(Transition::LeaseLost)
        }
    }
}

/// Partitions whose head row is claimable now, oldest head first, filtered to
/// the ones whose advisory lock this transaction could take.
///
/// Only the head counts: a partition blocked by a leased or backed-off head
/// must not take a batch slot through an eligible row behind it.
const LOCK_PARTITIONS_SQL: &str = r#"
    SELECT partition_key
    FROM (
        SELECT partition_key, created_at
        FROM (
            SELECT DISTINCT ON (partition_key) partition_key, status, next_attempt_at, created_at
            FROM eventrelay_outbox
            WHERE status IN ('pending', 'leased')
            ORDER BY partition_key, created_at, id
        ) AS heads
        WHERE status = 'pending' AND next_attempt_at <= $1
        ORDER BY created_at
        LIMIT $2
    ) AS candidates
    WHERE pg_try_advisory_xact_lock(hashtextextended(partition_key, 0))
    ORDER BY created_at
"#;

/// Leases the head-of-line rows of the locked partitions.
///
/// `blockers` counts, per partition, the rows up to and including this one
/// that are leased or still backing off; only rows with none ahead of them
/// are claimable.
const CLAIM_SQL: &str = r#"
    WITH ranked AS (
        SELECT id, created_at, status,
               SUM(CASE WHEN status = 'leased' OR next_attempt_at > $1 THEN 1 ELSE 0 END)
                   OVER (PARTITION BY partition_key ORDER BY created_at, id
                         ROWS BETWEEN UNBOUNDED PRECEDING AND CURRENT ROW) AS blockers
        FROM eventrelay_outbox
        WHERE partition_key = ANY($2) AND status IN ('pending', 'leased')
    ),
    eligible AS (
        SELECT id
        FROM ranked
        WHERE status = 'pending' AND blockers = 0
        ORDER BY created_at, id
        LIMIT $3
    ),
    claimable AS (
        SELECT o.id
        FROM eventrelay_outbox o
        JOIN eligible e ON e.id = o.id
        WHERE o.status = 'pending'
        FOR UPDATE OF o SKIP LOCKED
    )
    UPDATE eventrelay_outbox o
    SET status = 'leased', lease_owner = $4, lease_expires_at = $5
    FROM claimable c
    WHERE o.id = c.id
    RETURNING o.id, o.partition_key, o.event_type, o.schema_version, o.payload, o.headers,
              o.created_at, o.status, o.lease_owner, o.lease_expires_at, o.attempt_count,
              o.next_attempt_at, o.last_error, o.published_at
"#;

impl OutboxStore for PostgresOutboxStore {
    type Transaction<'t> = sqlx::Transaction<'t, Postgres>;

    #[instrument(name = "postgres.append_events", skip(self, tx, events), fields(event_count = events.len()))]
    async fn append(
        &self,
        tx: &mut Self::Transaction<'_>,
        events: Vec<OutboxEvent>,
    ) -> Result<(), OutboxStoreError> {
        // `created_at` comes from the event, so claim order is timestamp order
        // even when transactions commit out of it.
        for event in events {
            let attempt_count = i32::try_from(event.attempt_count).unwrap_or(i32::MAX);
            query(
                "INSERT INTO eventrelay_outbox
                     (id, partition_key, event_type, schema_version, payload, headers,
                      created_at, status, attempt_count, next_attempt_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(event.id.into_inner())
            .bind(event.partition_key.as_str())
            .bind(event.event_type.as_str())
            .bind(event.schema_version.as_str())
            .bind(&event.payload)
            .bind(Json(&event.headers))
            .bind(event.created_at.into_datetime())
            .bind(event.status.as_str())
            .bind(attempt_count)
            .bind(event.next_attempt_at.into_datetime())
            .execute(&mut **tx)
            .await
            .map_err(|error| {
                if is_unique_violation(&error) {
                    OutboxStoreError::DuplicateEventId { event_id: event.id }
                } else {
                    map_sqlx_error(error, Operation::AppendEvents)
                }
            })?;
        }
        Ok(())
    }

    #[instrument(name = "postgres.claim_batch", skip(self))]
    async fn claim_batch(
        &self,
        owner: &LeaseOwner,
        lease_duration: Duration,
        batch_size: usize,
        now: Timestamp,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(batch_size).unwrap_or(i64::MAX);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::BeginTransaction))?;

        // Locks are taken in their own statement so the claim below runs on a
        // snapshot taken after every competing claim on these partitions
        // committed.
        let partitions: Vec<String> = query_scalar(LOCK_PARTITIONS_SQL)
            .bind(now.into_datetime())
            .bind(limit)
            .fetch_all(&mut *tx)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::ClaimBatch))?;

        if partitions.is_empty() {
            tx.commit()
                .await
                .map_err(|error| map_sqlx_error(error, Operation::CommitTransaction))?;
            return Ok(Vec::new());
        }

        let rows = query(CLAIM_SQL)
            .bind(now.into_datetime())
            .bind(&partitions)
            .bind(limit)
            .bind(owner.as_str())
            .bind(now.plus(lease_duration).into_datetime())
            .fetch_all(&mut *tx)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::ClaimBatch))?;

        let mut claimed = rows
            .iter()
            .map(event_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        claimed.sort_by_key(OutboxEvent::order_key);

        tx.commit()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::CommitTransaction))?;

        if !claimed.is_empty() {
            info!(
                owner = %owner,
                claimed = claimed.len(),
                partitions = partitions.len(),
                "[postgres.claim_batch] leased outbox rows"
            );
        }
        Ok(claimed)
    }

    #[instrument(name = "postgres.mark_published", skip(self))]
    async fn mark_published(
        &self,
        id: EventId,
        owner: &LeaseOwner,
        now: Timestamp,
    ) -> Result<Transition, OutboxStoreError> {
        let statement = query(
            "UPDATE eventrelay_outbox
             SET status = 'published', attempt_count = attempt_count + 1, published_at = $3,
                 lease_owner = NULL, lease_expires_at = NULL
             WHERE id = $1 AND status = 'leased' AND lease_owner = $2",
        )
        .bind(id.into_inner())
        .bind(owner.as_str())
        .bind(now.into_datetime());
        self.guarded_update(Operation::MarkPublished, statement).await
    }

    #[instrument(name = "postgres.mark_retry", skip(self, error))]
    async fn mark_retry(
        &self,
        id: EventId,
        owner: &LeaseOwner,
        next_attempt_at: Timestamp,
        error: &str,
    ) -> Result<Transition, OutboxStoreError> {
        let statement = query(
            "UPDATE eventrelay_outbox
             SET status = 'pending', attempt_count = attempt_count + 1, next_attempt_at = $3,
                 last_error = $4, lease_owner = NULL, lease_expires_at = NULL
             WHERE id = $1 AND status = 'leased' AND lease_owner = $2",
        )
        .bind(id.into_inner())
        .bind(owner.as_str())
        .bind(next_attempt_at.into_datetime())
        .bind(error);
        self.guarded_update(Operation::MarkRetry, statement).await
    }

    #[instrument(name = "postgres.mark_dead_lettered", skip(self, error))]
    async fn mark_dead_lettered(
        &self,
        id: EventId,
        owner: Option<&LeaseOwner>,
        cause: DeadLetterCause,
        error: &str,
    ) -> Result<Transition, OutboxStoreError> {
        let increment = i32::from(cause.reached_broker());
        let statement = query(
            "UPDATE eventrelay_outbox
             SET status = 'dead_lettered', attempt_count = attempt_count + $3,
                 last_error = $4, lease_owner = NULL, lease_expires_at = NULL
             WHERE id = $1
               AND status IN ('pending', 'leased')
               AND ($2::TEXT IS NULL OR (status = 'leased' AND lease_owner = $2))",
        )
        .bind(id.into_inner())
        .bind(owner.map(|owner| owner.as_str()))
        .bind(increment)
        .bind(error);
        self.guarded_update(Operation::MarkDeadLettered, statement)
            .await
    }

    #[instrument(name = "postgres.release_leases", skip(self, ids), fields(count = ids.len()))]
    async fn release_leases(
        &self,
        ids: &[EventId],
        owner: &LeaseOwner,
    ) -> Result<u64, OutboxStoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<Uuid> = ids.iter().copied().map(EventId::into_inner).collect();
        let result = query(
            "UPDATE eventrelay_outbox
             SET status = 'pending', lease_owner = NULL, lease_expires_at = NULL
             WHERE id = ANY($1) AND status = 'leased' AND lease_owner = $2",
        )
        .bind(&ids)
        .bind(owner.as_str())
        .execute(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::ReleaseLeases))?;
        Ok(result.rows_affected())
    }

    #[instrument(name = "postgres.release_expired_leases", skip(self))]
    async fn release_expired_leases(&self, now: Timestamp) -> Result<u64, OutboxStoreError> {
        let result = query(
            "UPDATE eventrelay_outbox
             SET status = 'pending', lease_owner = NULL, lease_expires_at = NULL
             WHERE status = 'leased' AND lease_expires_at < $1",
        )
        .bind(now.into_datetime())
        .execute(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::ReleaseExpiredLeases))?;

        let released = result.rows_affected();
        if released > 0 {
            info!(released, "[postgres.release_expired_leases] recovered lapsed leases");
        }
        Ok(released)
    }

    #[instrument(name = "postgres.status_counts", skip(self))]
    async fn status_counts(&self) -> Result<StatusCounts, OutboxStoreError> {
        let rows = query("SELECT status, COUNT(*) AS count FROM eventrelay_outbox GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::StatusCounts))?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|error| map_sqlx_error(error, Operation::StatusCounts))?;
            let count: i64 = row
                .try_get("count")
                .map_err(|error| map_sqlx_error(error, Operation::StatusCounts))?;
            let count = u64::try_from(count).unwrap_or_default();
            match status.parse::<EventStatus>().map_err(corrupt)? {
                EventStatus::Pending => counts.pending = count,
                EventStatus::Leased => counts.leased = count,
                EventStatus::Published => counts.published = count,
                EventStatus::DeadLettered => counts.dead_lettered = count,
            }
        }
        Ok(counts)
    }
}

impl TransactionalStore for PostgresOutboxStore {
    async fn begin_transaction(&self) -> Result<sqlx::Transaction<'_, Postgres>, OutboxStoreError> {
        self.begin().await
    }

    async fn commit_transaction<'t>(
        &'t self,
        tx: sqlx::Transaction<'t, Postgres>,
    ) -> Result<(), OutboxStoreError> {
        tx.commit()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::CommitTransaction))
    }

    async fn rollback_transaction<'t>(
        &'t self,
        tx: sqlx::Transaction<'t, Postgres>,
    ) -> Result<(), OutboxStoreError> {
        tx.rollback()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::RollbackTransaction))
    }
}

fn corrupt(detail: impl std::fmt::Display) -> OutboxStoreError {
    OutboxStoreError::CorruptRow {
        detail: detail.to_string(),
    }
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T, OutboxStoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name)
        .map_err(|error| corrupt(format!("column {name}: {error}")))
}

fn event_from_row(row: &PgRow) -> Result<OutboxEvent, OutboxStoreError> {
    let id = EventId::try_new(column::<Uuid>(row, "id")?).map_err(corrupt)?;
    let status = column::<String>(row, "status")?
        .parse::<EventStatus>()
        .map_err(corrupt)?;
    let lease_owner = column::<Option<String>>(row, "lease_owner")?
        .map(LeaseOwner::try_new)
        .transpose()
        .map_err(corrupt)?;
    let attempt_count =
        u32::try_from(column::<i32>(row, "attempt_count")?).map_err(corrupt)?;
    let Json(headers) = column::<Json<Headers>>(row, "headers")?;

    Ok(OutboxEvent {
        id,
        partition_key: PartitionKey::try_new(column::<String>(row, "partition_key")?)
            .map_err(corrupt)?,
        event_type: EventType::try_new(column::<String>(row, "event_type")?).map_err(corrupt)?,
        schema_version: SchemaVersion::try_new(column::<String>(row, "schema_version")?)
            .map_err(corrupt)?,
        payload: column::<Vec<u8>>(row, "payload")?,
        headers,
        created_at: column::<DateTime<Utc>>(row, "created_at")?.into(),
        status,
        lease_owner,
        lease_expires_at: column::<Option<DateTime<Utc>>>(row, "lease_expires_at")?
            .map(Timestamp::from),
        attempt_count,
        next_attempt_at: column::<DateTime<Utc>>(row, "next_attempt_at")?.into(),
        last_error: column::<Option<String>>(row, "last_error")?,
        published_at: column::<Option<DateTime<Utc>>>(row, "published_at")?.map(Timestamp::from),
    })
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db_error) if db_error.code().as_deref() == Some("23505"))
}

fn map_sqlx_error(error: sqlx::Error, operation: Operation) -> OutboxStoreError {
    error!(
        error = %error,
        operation = %operation,
        "[postgres.database_error] database operation failed"
    );
    OutboxStoreError::StoreFailure { operation }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_pool_settings() {
        let config = PostgresConfig::default();

        assert_eq!(u32::from(config.max_connections.into_inner()), 10);
        assert_eq!(config.acquire_timeout, Duration::from_secs(30));
        assert_eq!(config.idle_timeout, Duration::from_secs(600));
    }

    #[test]
    fn non_database_errors_map_to_store_failure() {
        let mapped = map_sqlx_error(sqlx::Error::PoolTimedOut, Operation::ClaimBatch);

        assert_eq!(
            mapped,
            OutboxStoreError::StoreFailure {
                operation: Operation::ClaimBatch
            }
        );
    }

    #[test]
    fn pool_timeouts_are_not_unique_violations() {
        assert!(!is_unique_violation(&sqlx::Error::PoolTimedOut));
    }
}
