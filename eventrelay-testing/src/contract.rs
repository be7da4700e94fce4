//! Behavioural contract every `OutboxStore` backend must satisfy.
//!
//! Invoke [`outbox_store_contract_tests!`](crate::outbox_store_contract_tests)
//! with a factory producing an empty, isolated store; each scenario calls the
//! factory once.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use eventrelay_types::{
    DeadLetterCause, EventId, EventStatus, EventType, Headers, LeaseOwner, OutboxEvent,
    OutboxStore, OutboxStoreError, PartitionKey, SchemaVersion, StatusCounts, Timestamp,
    TransactionalStore, Transition,
};

const LEASE: Duration = Duration::from_secs(30);

/// A contract scenario that did not hold.
#[derive(Debug)]
pub struct ContractTestFailure {
    scenario: &'static str,
    detail: String,
}

impl ContractTestFailure {
    fn new(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self {
            scenario,
            detail: detail.into(),
        }
    }

    fn store_error(
        scenario: &'static str,
        operation: &'static str,
        error: OutboxStoreError,
    ) -> Self {
        Self::new(
            scenario,
            format!("{operation} operation returned unexpected error: {error}"),
        )
    }

    fn assertion(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self::new(scenario, detail)
    }
}

impl fmt::Display for ContractTestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.scenario, self.detail)
    }
}

impl std::error::Error for ContractTestFailure {}

/// Result of one contract scenario.
pub type ContractTestResult = Result<(), ContractTestFailure>;

/// The current instant truncated to whole milliseconds, so no backend has to
/// round the instants derived from it.
fn contract_now() -> Timestamp {
    let now = Utc::now();
    Timestamp::new(DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now))
}

fn contract_partition(
    scenario: &'static str,
    label: &str,
) -> Result<PartitionKey, ContractTestFailure> {
    let raw = format!("contract::{scenario}::{label}");
    PartitionKey::try_new(raw.clone()).map_err(|error| {
        ContractTestFailure::assertion(
            scenario,
            format!("unable to construct partition key `{raw}`: {error}"),
        )
    })
}

fn contract_owner(scenario: &'static str, label: &str) -> Result<LeaseOwner, ContractTestFailure> {
    LeaseOwner::try_new(format!("contract-{label}")).map_err(|error| {
        ContractTestFailure::assertion(scenario, format!("unable to construct owner: {error}"))
    })
}

fn contract_row(
    scenario: &'static str,
    partition_key: &PartitionKey,
    created_at: Timestamp,
) -> Result<OutboxEvent, ContractTestFailure> {
    let event_type = EventType::try_new("ContractTestEvent").map_err(|error| {
        ContractTestFailure::assertion(scenario, format!("unable to construct event type: {error}"))
    })?;
    Ok(OutboxEvent::new(
        EventId::new(),
        partition_key.clone(),
        event_type,
        SchemaVersion::initial(),
        br#"{"contract":true}"#.to_vec(),
        Headers::new().with(Headers::CONTENT_TYPE, "application/json"),
        created_at,
    ))
}

/// `count` rows on one partition, one millisecond apart from `start` on.
fn contract_rows(
    scenario: &'static str,
    partition_key: &PartitionKey,
    start: Timestamp,
    count: u64,
) -> Result<Vec<OutboxEvent>, ContractTestFailure> {
    (0..count)
        .map(|offset| contract_row(scenario, partition_key, start.plus(Duration::from_millis(offset))))
        .collect()
}

async fn append_committed<S>(
    scenario: &'static str,
    store: &S,
    rows: Vec<OutboxEvent>,
) -> ContractTestResult
where
    S: TransactionalStore,
{
    let mut tx = store
        .begin_transaction()
        .await
        .map_err(|error| ContractTestFailure::store_error(scenario, "begin_transaction", error))?;
    store
        .append(&mut tx, rows)
        .await
        .map_err(|error| ContractTestFailure::store_error(scenario, "append", error))?;
    store
        .commit_transaction(tx)
        .await
        .map_err(|error| ContractTestFailure::store_error(scenario, "commit_transaction", error))
}

async fn claim<S: OutboxStore>(
    scenario: &'static str,
    store: &S,
    owner: &LeaseOwner,
    batch_size: usize,
    now: Timestamp,
) -> Result<Vec<OutboxEvent>, ContractTestFailure> {
    store
        .claim_batch(owner, LEASE, batch_size, now)
        .await
        .map_err(|error| ContractTestFailure::store_error(scenario, "claim_batch", error))
}

async fn counts<S: OutboxStore>(
    scenario: &'static str,
    store: &S,
) -> Result<StatusCounts, ContractTestFailure> {
    store
        .status_counts()
        .await
        .map_err(|error| ContractTestFailure::store_error(scenario, "status_counts", error))
}

fn ids(rows: &[OutboxEvent]) -> Vec<EventId> {
    rows.iter().map(|row| row.id).collect()
}

fn expect_ids(
    scenario: &'static str,
    what: &str,
    observed: &[OutboxEvent],
    expected: &[EventId],
) -> ContractTestResult {
    let observed = ids(observed);
    if observed == expected {
        Ok(())
    } else {
        Err(ContractTestFailure::assertion(
            scenario,
            format!("{what}: expected {expected:?}, observed {observed:?}"),
        ))
    }
}

fn expect_transition(
    scenario: &'static str,
    operation: &'static str,
    result: Result<Transition, OutboxStoreError>,
    expected: Transition,
) -> ContractTestResult {
    let observed =
        result.map_err(|error| ContractTestFailure::store_error(scenario, operation, error))?;
    if observed == expected {
        Ok(())
    } else {
        Err(ContractTestFailure::assertion(
            scenario,
            format!("{operation}: expected {expected:?}, observed {observed:?}"),
        ))
    }
}

fn expect_counts(
    scenario: &'static str,
    observed: StatusCounts,
    expected: StatusCounts,
) -> ContractTestResult {
    if observed == expected {
        Ok(())
    } else {
        Err(ContractTestFailure::assertion(
            scenario,
            format!("status counts: expected {expected:?}, observed {observed:?}"),
        ))
    }
}

/// Committed rows become claimable, leased to the claimer, in order.
pub async fn test_committed_appends_are_claimable<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: TransactionalStore + Send + Sync + 'static,
{
    const SCENARIO: &str = "committed_appends_are_claimable";

    let store = make_store();
    let now = contract_now();
    let owner = contract_owner(SCENARIO, "a")?;
    let left = contract_row(SCENARIO, &contract_partition(SCENARIO, "left")?, now)?;
    let right = contract_row(
        SCENARIO,
        &contract_partition(SCENARIO, "right")?,
        now.plus(Duration::from_millis(1)),
    )?;
    let expected = vec![left.id, right.id];

    append_committed(SCENARIO, &store, vec![right, left]).await?;
    let claimed = claim(SCENARIO, &store, &owner, 10, now.plus(Duration::from_millis(5))).await?;

    expect_ids(SCENARIO, "claimed rows", &claimed, &expected)?;
    for row in &claimed {
        if row.status != EventStatus::Leased || !row.is_leased_by(&owner) {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                format!("row {} not leased by the claimer: {:?}", row.id, row.status),
            ));
        }
        if row.lease_expires_at.is_none() || row.attempt_count != 0 {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                format!("row {} has unexpected lease or attempt fields", row.id),
            ));
        }
    }

    expect_counts(
        SCENARIO,
        counts(SCENARIO, &store).await?,
        StatusCounts {
            leased: 2,
            ..StatusCounts::default()
        },
    )
}

/// Rows appended on a rolled back transaction never appear.
pub async fn test_rolled_back_appends_are_invisible<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: TransactionalStore + Send + Sync + 'static,
{
    const SCENARIO: &str = "rolled_back_appends_are_invisible";

    let store = make_store();
    let now = contract_now();
    let owner = contract_owner(SCENARIO, "a")?;
    let rows = contract_rows(SCENARIO, &contract_partition(SCENARIO, "p")?, now, 3)?;

    let mut tx = store
        .begin_transaction()
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "begin_transaction", error))?;
    store
        .append(&mut tx, rows)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "append", error))?;

    let before_commit = claim(SCENARIO, &store, &owner, 10, now.plus(LEASE)).await?;
    if !before_commit.is_empty() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("{} uncommitted rows were claimable", before_commit.len()),
        ));
    }

    store
        .rollback_transaction(tx)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "rollback_transaction", error))?;

    let after_rollback = claim(SCENARIO, &store, &owner, 10, now.plus(LEASE)).await?;
    expect_ids(SCENARIO, "rows after rollback", &after_rollback, &[])?;
    expect_counts(SCENARIO, counts(SCENARIO, &store).await?, StatusCounts::default())
}

/// Appending an id twice fails, at append or at commit.
pub async fn test_duplicate_event_id_is_rejected<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: TransactionalStore + Send + Sync + 'static,
{
    const SCENARIO: &str = "duplicate_event_id_is_rejected";

    let store = make_store();
    let row = contract_row(SCENARIO, &contract_partition(SCENARIO, "p")?, contract_now())?;
    let duplicate_id = row.id;
    append_committed(SCENARIO, &store, vec![row.clone()]).await?;

    let mut tx = store
        .begin_transaction()
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "begin_transaction", error))?;
    let appended = store.append(&mut tx, vec![row]).await;
    let outcome = match appended {
        Ok(()) => store.commit_transaction(tx).await,
        // The aborted transaction is dropped, which rolls it back.
        Err(error) => Err(error),
    };

    match outcome {
        Err(OutboxStoreError::DuplicateEventId { event_id }) if event_id == duplicate_id => {}
        Err(error) => {
            return Err(ContractTestFailure::store_error(SCENARIO, "append", error));
        }
        Ok(()) => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                "expected a duplicate event id error but the append committed",
            ));
        }
    }

    expect_counts(
        SCENARIO,
        counts(SCENARIO, &store).await?,
        StatusCounts {
            pending: 1,
            ..StatusCounts::default()
        },
    )
}

/// Concurrent claimers never receive the same row.
pub async fn test_concurrent_claims_are_exclusive<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: TransactionalStore + Send + Sync + 'static,
{
    const SCENARIO: &str = "concurrent_claims_are_exclusive";
    const PARTITIONS: u64 = 12;

    let store = make_store();
    let now = contract_now();
    let mut rows = Vec::new();
    for index in 0..PARTITIONS {
        let partition_key = contract_partition(SCENARIO, &format!("p{index}"))?;
        rows.extend(contract_rows(
            SCENARIO,
            &partition_key,
            now.plus(Duration::from_millis(index)),
            2,
        )?);
    }
    let expected_total = rows.len();
    append_committed(SCENARIO, &store, rows).await?;

    let first_owner = contract_owner(SCENARIO, "first")?;
    let second_owner = contract_owner(SCENARIO, "second")?;
    let claim_at = now.plus(Duration::from_secs(1));
    let (first, second) = futures::join!(
        claim(SCENARIO, &store, &first_owner, expected_total, claim_at),
        claim(SCENARIO, &store, &second_owner, expected_total, claim_at),
    );
    let (first, second) = (first?, second?);

    let mut seen = HashSet::new();
    for row in first.iter().chain(second.iter()) {
        if !seen.insert(row.id) {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                format!("row {} was leased to both claimers", row.id),
            ));
        }
    }

    // A partition is worked by one claimer at a time.
    let first_partitions: HashSet<_> = first.iter().map(|row| &row.partition_key).collect();
    if let Some(shared) = second
        .iter()
        .find(|row| first_partitions.contains(&row.partition_key))
    {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("partition {} was split across claimers", shared.partition_key),
        ));
    }

    let third_owner = contract_owner(SCENARIO, "third")?;
    let rest = claim(SCENARIO, &store, &third_owner, expected_total, claim_at).await?;
    let total = seen.len() + rest.len();
    if total != expected_total {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected {expected_total} rows leased overall, observed {total}"),
        ));
    }

    Ok(())
}

/// Rows behind a leased row or a row in backoff stay put.
pub async fn test_claims_respect_partition_order<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: TransactionalStore + Send + Sync + 'static,
{
    const SCENARIO: &str = "claims_respect_partition_order";

    let store = make_store();
    let now = contract_now();
    let ordered = contract_partition(SCENARIO, "ordered")?;
    let rows = contract_rows(SCENARIO, &ordered, now, 3)?;
    let ordered_ids = ids(&rows);
    let other = contract_row(
        SCENARIO,
        &contract_partition(SCENARIO, "other")?,
        now.plus(Duration::from_millis(10)),
    )?;
    let other_id = other.id;
    append_committed(SCENARIO, &store, rows).await?;
    append_committed(SCENARIO, &store, vec![other]).await?;

    let first_owner = contract_owner(SCENARIO, "first")?;
    let second_owner = contract_owner(SCENARIO, "second")?;
    let claim_at = now.plus(Duration::from_secs(1));

    // Given: the head of the ordered partition leased to the first owner
    let head = claim(SCENARIO, &store, &first_owner, 1, claim_at).await?;
    expect_ids(SCENARIO, "head claim", &head, &ordered_ids[..1])?;

    // Then: another claimer only gets the unrelated partition
    let blocked = claim(SCENARIO, &store, &second_owner, 10, claim_at).await?;
    expect_ids(SCENARIO, "claim behind a leased head", &blocked, &[other_id])?;

    // When: the head is put into backoff
    let retry_at = claim_at.plus(Duration::from_secs(60));
    expect_transition(
        SCENARIO,
        "mark_retry",
        store
            .mark_retry(ordered_ids[0], &first_owner, retry_at, "broker unavailable")
            .await,
        Transition::Applied,
    )?;

    // Then: the rows behind it are still not claimable
    let still_blocked = claim(SCENARIO, &store, &second_owner, 10, claim_at).await?;
    expect_ids(SCENARIO, "claim behind a row in backoff", &still_blocked, &[])?;

    // And: once the backoff elapses the whole partition comes back in order
    let resumed = claim(SCENARIO, &store, &second_owner, 10, retry_at).await?;
    expect_ids(SCENARIO, "claim after backoff", &resumed, &ordered_ids)
}

/// A claim never returns more than `batch_size` rows.
pub async fn test_claims_honour_batch_size<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: TransactionalStore + Send + Sync + 'static,
{
    const SCENARIO: &str = "claims_honour_batch_size";

    let store = make_store();
    let now = contract_now();
    let rows = contract_rows(SCENARIO, &contract_partition(SCENARIO, "p")?, now, 5)?;
    let expected = ids(&rows);
    append_committed(SCENARIO, &store, rows).await?;

    let owner = contract_owner(SCENARIO, "a")?;
    let claim_at = now.plus(Duration::from_secs(1));
    let first = claim(SCENARIO, &store, &owner, 2, claim_at).await?;
    expect_ids(SCENARIO, "first batch", &first, &expected[..2])?;

    let empty = claim(SCENARIO, &store, &owner, 0, claim_at).await?;
    expect_ids(SCENARIO, "zero sized batch", &empty, &[])
}

/// Publishing needs the lease and counts the attempt.
pub async fn test_mark_published_requires_lease<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: TransactionalStore + Send + Sync + 'static,
{
    const SCENARIO: &str = "mark_published_requires_lease";

    let store = make_store();
    let now = contract_now();
    let row = contract_row(SCENARIO, &contract_partition(SCENARIO, "p")?, now)?;
    let id = row.id;
    append_committed(SCENARIO, &store, vec![row]).await?;

    let owner = contract_owner(SCENARIO, "holder")?;
    let intruder = contract_owner(SCENARIO, "intruder")?;
    let claim_at = now.plus(Duration::from_secs(1));
    let _ = claim(SCENARIO, &store, &owner, 1, claim_at).await?;

    expect_transition(
        SCENARIO,
        "mark_published",
        store.mark_published(id, &intruder, claim_at).await,
        Transition::LeaseLost,
    )?;
    expect_transition(
        SCENARIO,
        "mark_published",
        store.mark_published(EventId::new(), &owner, claim_at).await,
        Transition::LeaseLost,
    )?;
    expect_transition(
        SCENARIO,
        "mark_published",
        store.mark_published(id, &owner, claim_at).await,
        Transition::Applied,
    )?;
    // Published is terminal.
    expect_transition(
        SCENARIO,
        "mark_published",
        store.mark_published(id, &owner, claim_at).await,
        Transition::LeaseLost,
    )?;

    expect_counts(
        SCENARIO,
        counts(SCENARIO, &store).await?,
        StatusCounts {
            published: 1,
            ..StatusCounts::default()
        },
    )
}

/// A retry returns the row to pending, gated and counted.
pub async fn test_retry_defers_and_counts_attempt<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: TransactionalStore + Send + Sync + 'static,
{
    const SCENARIO: &str = "retry_defers_and_counts_attempt";

    let store = make_store();
    let now = contract_now();
    let row = contract_row(SCENARIO, &contract_partition(SCENARIO, "p")?, now)?;
    let id = row.id;
    append_committed(SCENARIO, &store, vec![row]).await?;

    let owner = contract_owner(SCENARIO, "a")?;
    let claim_at = now.plus(Duration::from_secs(1));
    let _ = claim(SCENARIO, &store, &owner, 1, claim_at).await?;

    let retry_at = claim_at.plus(Duration::from_secs(60));
    expect_transition(
        SCENARIO,
        "mark_retry",
        store.mark_retry(id, &owner, retry_at, "broker unavailable").await,
        Transition::Applied,
    )?;
    // The lease is gone, so a second outcome is a lost race.
    expect_transition(
        SCENARIO,
        "mark_retry",
        store.mark_retry(id, &owner, retry_at, "again").await,
        Transition::LeaseLost,
    )?;

    let early = claim(SCENARIO, &store, &owner, 1, claim_at).await?;
    expect_ids(SCENARIO, "claim before next_attempt_at", &early, &[])?;

    let due = claim(SCENARIO, &store, &owner, 1, retry_at).await?;
    expect_ids(SCENARIO, "claim at next_attempt_at", &due, &[id])?;
    let retried = &due[0];
    if retried.attempt_count != 1 || retried.last_error.as_deref() != Some("broker unavailable") {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!(
                "expected attempt_count=1 and the recorded error, observed attempt_count={} last_error={:?}",
                retried.attempt_count, retried.last_error
            ),
        ));
    }

    Ok(())
}

/// Lapsed leases return to pending without counting an attempt.
pub async fn test_expired_leases_are_recovered<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: TransactionalStore + Send + Sync + 'static,
{
    const SCENARIO: &str = "expired_leases_are_recovered";

    let store = make_store();
    let now = contract_now();
    let row = contract_row(SCENARIO, &contract_partition(SCENARIO, "p")?, now)?;
    let id = row.id;
    append_committed(SCENARIO, &store, vec![row]).await?;

    let crashed = contract_owner(SCENARIO, "crashed")?;
    let survivor = contract_owner(SCENARIO, "survivor")?;
    let claim_at = now.plus(Duration::from_secs(1));
    let _ = claim(SCENARIO, &store, &crashed, 1, claim_at).await?;

    let expiry = claim_at.plus(LEASE);
    let at_expiry = store
        .release_expired_leases(expiry)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "release_expired_leases", error))?;
    if at_expiry != 0 {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("a lease was released at its expiry instant ({at_expiry} rows)"),
        ));
    }

    let after_expiry = expiry.plus(Duration::from_secs(1));
    let released = store
        .release_expired_leases(after_expiry)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "release_expired_leases", error))?;
    if released != 1 {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected one lapsed lease to be released, observed {released}"),
        ));
    }

    expect_transition(
        SCENARIO,
        "mark_published",
        store.mark_published(id, &crashed, after_expiry).await,
        Transition::LeaseLost,
    )?;

    let reclaimed = claim(SCENARIO, &store, &survivor, 1, after_expiry).await?;
    expect_ids(SCENARIO, "reclaim after expiry", &reclaimed, &[id])?;
    if reclaimed[0].attempt_count != 0 {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "lease expiry must not count as an attempt",
        ));
    }

    Ok(())
}

/// Dead-lettered rows are terminal; only broker attempts are counted.
pub async fn test_dead_letter_is_terminal<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: TransactionalStore + Send + Sync + 'static,
{
    const SCENARIO: &str = "dead_letter_is_terminal";

    let store = make_store();
    let now = contract_now();
    let rejected = contract_row(SCENARIO, &contract_partition(SCENARIO, "rejected")?, now)?;
    let parked = contract_row(
        SCENARIO,
        &contract_partition(SCENARIO, "parked")?,
        now.plus(Duration::from_millis(1)),
    )?;
    let (rejected_id, parked_id) = (rejected.id, parked.id);
    append_committed(SCENARIO, &store, vec![rejected, parked]).await?;

    let owner = contract_owner(SCENARIO, "a")?;
    let intruder = contract_owner(SCENARIO, "intruder")?;
    let claim_at = now.plus(Duration::from_secs(1));
    let claimed = claim(SCENARIO, &store, &owner, 1, claim_at).await?;
    expect_ids(SCENARIO, "claim", &claimed, &[rejected_id])?;

    expect_transition(
        SCENARIO,
        "mark_dead_lettered",
        store
            .mark_dead_lettered(rejected_id, Some(&intruder), DeadLetterCause::Rejected, "nope")
            .await,
        Transition::LeaseLost,
    )?;
    expect_transition(
        SCENARIO,
        "mark_dead_lettered",
        store
            .mark_dead_lettered(rejected_id, Some(&owner), DeadLetterCause::Rejected, "schema rejected")
            .await,
        Transition::Applied,
    )?;

    // An operator parks a pending row that never reached the broker.
    expect_transition(
        SCENARIO,
        "mark_dead_lettered",
        store
            .mark_dead_lettered(parked_id, None, DeadLetterCause::Undeliverable, "no route")
            .await,
        Transition::Applied,
    )?;
    expect_transition(
        SCENARIO,
        "mark_dead_lettered",
        store
            .mark_dead_lettered(parked_id, None, DeadLetterCause::Undeliverable, "again")
            .await,
        Transition::LeaseLost,
    )?;

    let after = claim(SCENARIO, &store, &owner, 10, claim_at.plus(LEASE).plus(LEASE)).await?;
    expect_ids(SCENARIO, "claim after dead letter", &after, &[])?;

    expect_counts(
        SCENARIO,
        counts(SCENARIO, &store).await?,
        StatusCounts {
            dead_lettered: 2,
            ..StatusCounts::default()
        },
    )
}

/// Released leases go back to pending for anyone, attempt count untouched.
pub async fn test_release_leases_skips_attempt<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: TransactionalStore + Send + Sync + 'static,
{
    const SCENARIO: &str = "release_leases_skips_attempt";

    let store = make_store();
    let now = contract_now();
    let rows = contract_rows(SCENARIO, &contract_partition(SCENARIO, "p")?, now, 2)?;
    let expected = ids(&rows);
    append_committed(SCENARIO, &store, rows).await?;

    let owner = contract_owner(SCENARIO, "holder")?;
    let other = contract_owner(SCENARIO, "other")?;
    let claim_at = now.plus(Duration::from_secs(1));
    let claimed = claim(SCENARIO, &store, &owner, 10, claim_at).await?;
    expect_ids(SCENARIO, "claim", &claimed, &expected)?;

    let by_other = store
        .release_leases(&expected, &other)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "release_leases", error))?;
    let by_owner = store
        .release_leases(&expected, &owner)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "release_leases", error))?;
    if by_other != 0 || by_owner != 2 {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected releases 0 (other) and 2 (owner), observed {by_other} and {by_owner}"),
        ));
    }

    let reclaimed = claim(SCENARIO, &store, &other, 10, claim_at).await?;
    expect_ids(SCENARIO, "reclaim", &reclaimed, &expected)?;
    if reclaimed.iter().any(|row| row.attempt_count != 0) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "released rows must keep attempt_count=0",
        ));
    }

    Ok(())
}

/// A partition blocked at its head, by a lease or a backoff, takes no batch
/// slot away from partitions behind it.
pub async fn test_blocked_partitions_do_not_starve_others<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: TransactionalStore + Send + Sync + 'static,
{
    const SCENARIO: &str = "blocked_partitions_do_not_starve_others";

    let store = make_store();
    let now = contract_now();
    let stuck = contract_rows(SCENARIO, &contract_partition(SCENARIO, "stuck")?, now, 2)?;
    let head = stuck[0].id;
    let leased_behind = contract_row(
        SCENARIO,
        &contract_partition(SCENARIO, "leased-behind")?,
        now.plus(Duration::from_millis(10)),
    )?;
    let leased_behind_id = leased_behind.id;
    let backoff_behind = contract_row(
        SCENARIO,
        &contract_partition(SCENARIO, "backoff-behind")?,
        now.plus(Duration::from_millis(20)),
    )?;
    let backoff_behind_id = backoff_behind.id;
    append_committed(SCENARIO, &store, stuck).await?;
    append_committed(SCENARIO, &store, vec![leased_behind, backoff_behind]).await?;

    let claim_at = now.plus(Duration::from_secs(1));
    let first = contract_owner(SCENARIO, "first")?;
    let claimed = claim(SCENARIO, &store, &first, 1, claim_at).await?;
    expect_ids(SCENARIO, "first claim", &claimed, &[head])?;

    // The stuck head is leased; its follower is pending and due.
    let second = contract_owner(SCENARIO, "second")?;
    let claimed = claim(SCENARIO, &store, &second, 1, claim_at).await?;
    expect_ids(SCENARIO, "claim past a leased head", &claimed, &[leased_behind_id])?;

    expect_transition(
        SCENARIO,
        "mark_retry",
        store
            .mark_retry(head, &first, claim_at.plus(Duration::from_secs(300)), "broker unavailable")
            .await,
        Transition::Applied,
    )?;

    // Now the stuck head is backing off; its follower still is due.
    let third = contract_owner(SCENARIO, "third")?;
    let claimed = claim(SCENARIO, &store, &third, 1, claim_at).await?;
    expect_ids(SCENARIO, "claim past a backed-off head", &claimed, &[backoff_behind_id])?;

    let claimed = claim(SCENARIO, &store, &third, 1, claim_at).await?;
    expect_ids(SCENARIO, "claim with every partition blocked", &claimed, &[])?;

    Ok(())
}

/// Partition order is `created_at` order even when the later row commits
/// first.
pub async fn test_partition_order_ignores_commit_order<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: TransactionalStore + Send + Sync + 'static,
{
    const SCENARIO: &str = "partition_order_ignores_commit_order";

    let store = make_store();
    let now = contract_now();
    let rows = contract_rows(SCENARIO, &contract_partition(SCENARIO, "p")?, now, 2)?;
    let expected = ids(&rows);
    let mut rows = rows.into_iter();
    let (Some(earlier), Some(later)) = (rows.next(), rows.next()) else {
        return Err(ContractTestFailure::assertion(SCENARIO, "expected two rows"));
    };
    append_committed(SCENARIO, &store, vec![later]).await?;
    append_committed(SCENARIO, &store, vec![earlier]).await?;

    let owner = contract_owner(SCENARIO, "a")?;
    let claimed = claim(SCENARIO, &store, &owner, 10, now.plus(Duration::from_secs(1))).await?;
    expect_ids(SCENARIO, "claim after out-of-order commits", &claimed, &expected)
}

/// Generates one `#[tokio::test]` per contract scenario inside module `$suite`.
///
/// `make_store` is called once per scenario and must yield an empty store.
///
/// ```ignore
/// eventrelay_testing::outbox_store_contract_tests!(
///     suite = in_memory,
///     make_store = eventrelay_memory::InMemoryOutboxStore::new,
/// );
/// ```
#[macro_export]
macro_rules! outbox_store_contract_tests {
    (suite = $suite:ident, make_store = $make_store:expr $(,)?) => {
        #[allow(non_snake_case)]
        mod $suite {
            use $crate::contract::{
                test_blocked_partitions_do_not_starve_others, test_claims_honour_batch_size,
                test_claims_respect_partition_order, test_committed_appends_are_claimable,
                test_concurrent_claims_are_exclusive, test_dead_letter_is_terminal,
                test_duplicate_event_id_is_rejected, test_expired_leases_are_recovered,
                test_mark_published_requires_lease, test_partition_order_ignores_commit_order,
                test_release_leases_skips_attempt, test_retry_defers_and_counts_attempt,
                test_rolled_back_appends_are_invisible,
            };

            #[tokio::test(flavor = "multi_thread")]
            async fn committed_appends_are_claimable_contract() {
                test_committed_appends_are_claimable($make_store)
                    .await
                    .expect("outbox store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn rolled_back_appends_are_invisible_contract() {
                test_rolled_back_appends_are_invisible($make_store)
                    .await
                    .expect("outbox store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn duplicate_event_id_is_rejected_contract() {
                test_duplicate_event_id_is_rejected($make_store)
                    .await
                    .expect("outbox store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn concurrent_claims_are_exclusive_contract() {
                test_concurrent_claims_are_exclusive($make_store)
                    .await
                    .expect("outbox store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn claims_respect_partition_order_contract() {
                test_claims_respect_partition_order($make_store)
                    .await
                    .expect("outbox store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn claims_honour_batch_size_contract() {
                test_claims_honour_batch_size($make_store)
                    .await
                    .expect("outbox store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn blocked_partitions_do_not_starve_others_contract() {
                test_blocked_partitions_do_not_starve_others($make_store)
                    .await
                    .expect("outbox store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn partition_order_ignores_commit_order_contract() {
                test_partition_order_ignores_commit_order($make_store)
                    .await
                    .expect("outbox store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn mark_published_requires_lease_contract() {
                test_mark_published_requires_lease($make_store)
                    .await
                    .expect("outbox store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn retry_defers_and_counts_attempt_contract() {
                test_retry_defers_and_counts_attempt($make_store)
                    .await
                    .expect("outbox store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn expired_leases_are_recovered_contract() {
                test_expired_leases_are_recovered($make_store)
                    .await
                    .expect("outbox store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn dead_letter_is_terminal_contract() {
                test_dead_letter_is_terminal($make_store)
                    .await
                    .expect("outbox store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn release_leases_skips_attempt_contract() {
                test_release_leases_skips_attempt($make_store)
                    .await
                    .expect("outbox store contract failed");
            }
        }
    };
}

pub use outbox_store_contract_tests;
