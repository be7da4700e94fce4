use std::sync::Arc;

use eventrelay::{Dispatcher, DispatcherConfig, OutboxStore, StatusCounts};
use eventrelay_examples::orders::{
    order_router, ChannelPublisher, OrderConsumer, OrderError, OrderMessage, OrderService,
    ORDERS_TOPIC, SHIPMENTS_TOPIC,
};
use eventrelay_memory::InMemoryOutboxStore;

#[tokio::test]
async fn placed_and_shipped_orders_reach_their_topics_in_order() {
    // Given: an order placed and shipped through the outbox
    let store = Arc::new(InMemoryOutboxStore::new());
    let service = OrderService::new(Arc::clone(&store));
    let placed = service
        .place_order("ORD-1", "alice", 4_999)
        .await
        .expect("order should be recorded");
    let shipped = service
        .ship_order("ORD-1", "TRK-1")
        .await
        .expect("shipment should be recorded");

    // When: one dispatcher cycle relays them
    let (publisher, mut deliveries) = ChannelPublisher::channel(8);
    let dispatcher = Dispatcher::new(
        Arc::clone(&store),
        publisher,
        order_router(),
        DispatcherConfig::default(),
    )
    .expect("valid config");
    let report = dispatcher.run_cycle().await.expect("cycle should run");

    // Then: both arrive in order, each on its own topic
    let (first_topic, first) = deliveries.recv().await.expect("first delivery");
    let (second_topic, second) = deliveries.recv().await.expect("second delivery");
    assert_eq!(report.published, 2);
    assert_eq!((first.event_id, second.event_id), (placed, shipped));
    assert_eq!(first_topic.as_str(), ORDERS_TOPIC);
    assert_eq!(second_topic.as_str(), SHIPMENTS_TOPIC);
}

#[tokio::test]
async fn consumer_decodes_each_event_once() {
    // Given: a relayed order event
    let store = Arc::new(InMemoryOutboxStore::new());
    let service = OrderService::new(Arc::clone(&store));
    let _ = service
        .place_order("ORD-2", "bob", 1_250)
        .await
        .expect("order should be recorded");
    let (publisher, mut deliveries) = ChannelPublisher::channel(8);
    let dispatcher = Dispatcher::new(
        Arc::clone(&store),
        publisher,
        order_router(),
        DispatcherConfig::default(),
    )
    .expect("valid config");
    let _ = dispatcher.run_cycle().await.expect("cycle should run");
    let (_, envelope) = deliveries.recv().await.expect("delivery");

    // When: the broker redelivers it
    let mut consumer = OrderConsumer::new().expect("registry should build");
    let first = consumer.handle(&envelope).expect("should decode");
    let redelivered = consumer.handle(&envelope).expect("should decode");

    // Then: only the first copy is handed to the application
    assert!(matches!(
        first,
        Some(OrderMessage::Placed(ref order)) if order.customer == "bob" && order.total_cents == 1_250
    ));
    assert_eq!(redelivered, None);
}

#[tokio::test]
async fn invalid_order_ids_leave_the_outbox_empty() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let service = OrderService::new(Arc::clone(&store));

    let result = service.place_order("   ", "carol", 100).await;

    assert!(matches!(result, Err(OrderError::InvalidOrderId(_))));
    assert_eq!(store.status_counts().await, Ok(StatusCounts::default()));
}
