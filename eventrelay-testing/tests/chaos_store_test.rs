use std::sync::Arc;
use std::time::Duration;

use eventrelay::{
    Clock, CycleError, Dispatcher, DispatcherConfig, EventId, EventStatus, EventType, Headers,
    ManualClock, Operation, OutboxEvent, OutboxStore, OutboxStoreError, PartitionKey,
    SchemaVersion, Timestamp, Topic, TopicRouter,
};
use eventrelay_memory::InMemoryOutboxStore;
use eventrelay_testing::{ChaosConfig, ChaosOutboxStoreExt, RecordingPublisher};

async fn committed_row(store: &InMemoryOutboxStore, created_at: Timestamp) -> EventId {
    let row = OutboxEvent::new(
        EventId::new(),
        PartitionKey::try_new("chaos-partition").expect("valid partition key"),
        EventType::try_new("ChaosEvent").expect("valid event type"),
        SchemaVersion::initial(),
        b"{}".to_vec(),
        Headers::new(),
        created_at,
    );
    let id = row.id;
    let mut tx = store.begin();
    store
        .append(&mut tx, vec![row])
        .await
        .expect("append should stage");
    store.commit(tx).expect("commit should succeed");
    id
}

fn router() -> TopicRouter {
    TopicRouter::new(Topic::try_new("chaos").expect("valid topic"))
}

#[tokio::test]
async fn chaos_mode_can_abort_a_dispatcher_cycle() {
    // Given: a store where every operation fails
    let store = Arc::new(InMemoryOutboxStore::new());
    let clock = ManualClock::new(Timestamp::now());
    let id = committed_row(&store, clock.now()).await;
    let chaos_store = Arc::clone(&store)
        .with_chaos(ChaosConfig::deterministic().with_failure_probability(1.0));
    let dispatcher = Dispatcher::new(
        chaos_store,
        RecordingPublisher::new(),
        router(),
        DispatcherConfig::default(),
    )
    .expect("valid config")
    .with_clock(clock);

    // When: a cycle runs
    let result = dispatcher.run_cycle().await;

    // Then: the cycle aborts at its first store call and the row is untouched
    assert!(matches!(
        result,
        Err(CycleError::Store(OutboxStoreError::StoreFailure {
            operation: Operation::ReleaseExpiredLeases
        }))
    ));
    let row = store.get(id).expect("row should exist");
    assert_eq!((row.status, row.attempt_count), (EventStatus::Pending, 0));
}

#[tokio::test]
async fn lost_lease_outcomes_are_discarded_and_redelivered() {
    // Given: a dispatcher whose every outcome loses the lease race
    let store = Arc::new(InMemoryOutboxStore::new());
    let clock = ManualClock::new(Timestamp::now());
    let id = committed_row(&store, clock.now()).await;
    let publisher = Arc::new(RecordingPublisher::new());
    let flaky = Dispatcher::new(
        Arc::clone(&store)
            .with_chaos(ChaosConfig::deterministic().with_lease_loss_probability(1.0)),
        Arc::clone(&publisher),
        router(),
        DispatcherConfig::default(),
    )
    .expect("valid config")
    .with_clock(clock.clone());

    // When: it publishes, and a healthy dispatcher runs after the lease lapses
    let lost = flaky.run_cycle().await.expect("cycle should run");
    let still_leased = store.get(id).expect("row should exist").status;
    clock.advance(Duration::from_secs(31));
    let healthy = Dispatcher::new(
        Arc::clone(&store),
        Arc::clone(&publisher),
        router(),
        DispatcherConfig::default(),
    )
    .expect("valid config")
    .with_clock(clock.clone());
    let recovered = healthy.run_cycle().await.expect("cycle should run");

    // Then: the envelope reached the broker twice; consumers deduplicate on id
    assert_eq!((lost.published, lost.lease_lost), (0, 1));
    assert_eq!(still_leased, EventStatus::Leased);
    assert_eq!(recovered.published, 1);
    assert_eq!(publisher.acknowledged(), vec![id, id]);
    assert_eq!(store.get(id).expect("row should exist").status, EventStatus::Published);
}

#[tokio::test]
async fn deterministic_chaos_replays_the_same_failures() {
    let config = ChaosConfig::deterministic().with_failure_probability(0.5);
    let first = InMemoryOutboxStore::new().with_chaos(config.clone());
    let second = InMemoryOutboxStore::new().with_chaos(config);

    let mut first_run = Vec::new();
    let mut second_run = Vec::new();
    for _ in 0..32 {
        first_run.push(first.status_counts().await.is_ok());
        second_run.push(second.status_counts().await.is_ok());
    }

    assert_eq!(first_run, second_run);
    assert!(first_run.contains(&true) && first_run.contains(&false));
}
