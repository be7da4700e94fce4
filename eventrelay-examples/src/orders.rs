use std::collections::HashSet;
use std::time::Duration;

use eventrelay::{
    AppendError, BrokerPublisher, DomainEvent, Envelope, EventId, EventType, EventTypeRegistry,
    Headers, OutboxAppender, OutboxStoreError, PartitionKey, PartitionKeyError, PublishError,
    RegistryError, SchemaVersion, Topic, TopicRouter, TransactionalStore,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Topic carrying order lifecycle events.
pub const ORDERS_TOPIC: &str = "orders";
/// Topic carrying shipment events.
pub const SHIPMENTS_TOPIC: &str = "shipments";

/// A customer placed an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPlaced {
    /// Order identifier, also the partition key.
    pub order_id: PartitionKey,
    /// Who placed it.
    pub customer: String,
    /// Order total in cents.
    pub total_cents: u64,
}

/// An order left the warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderShipped {
    /// Order identifier, also the partition key.
    pub order_id: PartitionKey,
    /// Carrier tracking number.
    pub tracking_number: String,
}

impl DomainEvent for OrderPlaced {
    fn event_type(&self) -> EventType {
        order_placed_type()
    }

    fn partition_key(&self) -> PartitionKey {
        self.order_id.clone()
    }
}

impl DomainEvent for OrderShipped {
    fn event_type(&self) -> EventType {
        order_shipped_type()
    }

    fn partition_key(&self) -> PartitionKey {
        self.order_id.clone()
    }
}

/// Event type of [`OrderPlaced`].
pub fn order_placed_type() -> EventType {
    EventType::try_new("OrderPlaced").expect("literal event type is valid")
}

/// Event type of [`OrderShipped`].
pub fn order_shipped_type() -> EventType {
    EventType::try_new("OrderShipped").expect("literal event type is valid")
}

/// Routes order events to [`ORDERS_TOPIC`] and shipments to [`SHIPMENTS_TOPIC`].
pub fn order_router() -> TopicRouter {
    TopicRouter::new(Topic::try_new(ORDERS_TOPIC).expect("literal topic is valid")).route(
        order_shipped_type(),
        Topic::try_new(SHIPMENTS_TOPIC).expect("literal topic is valid"),
    )
}

/// Failures of the order service.
#[derive(Debug, Error)]
pub enum OrderError {
    /// The order id cannot serve as a partition key.
    #[error("invalid order id")]
    InvalidOrderId(#[from] PartitionKeyError),

    /// Events could not be staged.
    #[error(transparent)]
    Append(#[from] AppendError),

    /// The surrounding transaction failed.
    #[error(transparent)]
    Store(#[from] OutboxStoreError),
}

/// Writes order events to the outbox inside the store's transaction.
#[derive(Debug)]
pub struct OrderService<S> {
    appender: OutboxAppender<S>,
}

impl<S: TransactionalStore> OrderService<S> {
    /// Creates a service writing to `store`.
    pub fn new(store: S) -> Self {
        Self {
            appender: OutboxAppender::new(store),
        }
    }

    /// Records an [`OrderPlaced`] event and returns its id.
    pub async fn place_order(
        &self,
        order_id: &str,
        customer: &str,
        total_cents: u64,
    ) -> Result<EventId, OrderError> {
        let event = OrderPlaced {
            order_id: PartitionKey::try_new(order_id)?,
            customer: customer.to_string(),
            total_cents,
        };
        self.record(&event).await
    }

    /// Records an [`OrderShipped`] event and returns its id.
    pub async fn ship_order(
        &self,
        order_id: &str,
        tracking_number: &str,
    ) -> Result<EventId, OrderError> {
        let event = OrderShipped {
            order_id: PartitionKey::try_new(order_id)?,
            tracking_number: tracking_number.to_string(),
        };
        self.record(&event).await
    }

    async fn record<E: DomainEvent>(&self, event: &E) -> Result<EventId, OrderError> {
        let store = self.appender.store();
        let order_id = event.partition_key();
        let headers = Headers::new().with_correlation_id(format!("order-{order_id}"));

        let mut tx = store.begin_transaction().await?;
        let ids = match self
            .appender
            .append_events(&mut tx, std::slice::from_ref(event), &headers)
            .await
        {
            Ok(ids) => ids,
            Err(error) => {
                store.rollback_transaction(tx).await?;
                return Err(error.into());
            }
        };
        store.commit_transaction(tx).await?;

        let id = ids[0];
        info!(%id, %order_id, event_type = %event.event_type(), "[orders.record] event committed");
        Ok(id)
    }
}

/// Broker stand-in that forwards envelopes to a channel.
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    sender: mpsc::Sender<(Topic, Envelope)>,
}

impl ChannelPublisher {
    /// Creates a publisher and the receiving end consumers read from.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<(Topic, Envelope)>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }
}

impl BrokerPublisher for ChannelPublisher {
    async fn publish(
        &self,
        topic: &Topic,
        _partition_key: &PartitionKey,
        envelope: &Envelope,
        timeout: Duration,
    ) -> Result<(), PublishError> {
        self.sender
            .send_timeout((topic.clone(), envelope.clone()), timeout)
            .await
            .map_err(|error| PublishError::transient(error.to_string()))
    }
}

/// Consumer-side view of every order event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderMessage {
    /// See [`OrderPlaced`].
    Placed(OrderPlaced),
    /// See [`OrderShipped`].
    Shipped(OrderShipped),
}

/// Decodes envelopes and skips ids it has already handled.
pub struct OrderConsumer {
    registry: EventTypeRegistry<OrderMessage>,
    seen: HashSet<EventId>,
}

impl OrderConsumer {
    /// Creates a consumer understanding version 1 of both order events.
    pub fn new() -> Result<Self, RegistryError> {
        let registry = EventTypeRegistry::new()
            .with(order_placed_type(), SchemaVersion::initial(), OrderMessage::Placed)?
            .with(order_shipped_type(), SchemaVersion::initial(), OrderMessage::Shipped)?;
        Ok(Self {
            registry,
            seen: HashSet::new(),
        })
    }

    /// Decodes `envelope`, or returns `None` for a redelivery.
    pub fn handle(&mut self, envelope: &Envelope) -> Result<Option<OrderMessage>, RegistryError> {
        if self.seen.contains(&envelope.event_id) {
            debug!(event_id = %envelope.event_id, "[orders.consume] duplicate skipped");
            return Ok(None);
        }
        let message = self.registry.decode(envelope)?;
        let _ = self.seen.insert(envelope.event_id);
        Ok(Some(message))
    }
}

impl std::fmt::Debug for OrderConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderConsumer")
            .field("seen", &self.seen.len())
            .finish_non_exhaustive()
    }
}
