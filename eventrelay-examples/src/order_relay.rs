//! Order relay example application
//!
//! This example demonstrates the outbox flow end to end:
//! - An order service recording events in the outbox
//! - A dispatcher relaying them to a channel standing in for a broker
//! - A consumer decoding envelopes and skipping redeliveries
//!
//! Dispatcher settings can be overridden with a JSON document in
//! `EVENTRELAY_CONFIG`, e.g. `{"batch_size": 2, "poll_interval_ms": 20}`.
//! Log verbosity follows `RUST_LOG`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use eventrelay::{Dispatcher, DispatcherConfig, OutboxStore};
use eventrelay_examples::orders::{
    order_router, ChannelPublisher, OrderConsumer, OrderMessage, OrderService,
};
use eventrelay_memory::InMemoryOutboxStore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn dispatcher_config() -> Result<DispatcherConfig> {
    match std::env::var("EVENTRELAY_CONFIG") {
        Ok(json) => DispatcherConfig::from_json_str(&json).context("invalid EVENTRELAY_CONFIG"),
        Err(_) => Ok(DispatcherConfig::default().with_poll_interval(Duration::from_millis(50))),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting order relay example");

    let store = Arc::new(InMemoryOutboxStore::new());
    let service = OrderService::new(Arc::clone(&store));

    // Two orders interleaved; each one's events must arrive in order.
    let _ = service.place_order("ORD-1001", "alice", 4_999).await?;
    let _ = service.place_order("ORD-1002", "bob", 1_250).await?;
    let _ = service.ship_order("ORD-1001", "TRK-77").await?;
    let _ = service.ship_order("ORD-1002", "TRK-78").await?;
    let expected = 4;

    let (publisher, mut deliveries) = ChannelPublisher::channel(16);
    let dispatcher = Dispatcher::new(
        Arc::clone(&store),
        publisher,
        order_router(),
        dispatcher_config()?,
    )?;
    let mut consumer = OrderConsumer::new()?;
    let shutdown = CancellationToken::new();

    let consume = async {
        let mut handled = 0;
        while handled < expected {
            let Some((topic, envelope)) = deliveries.recv().await else {
                break;
            };
            match consumer.handle(&envelope) {
                Ok(Some(OrderMessage::Placed(order))) => {
                    handled += 1;
                    info!(%topic, order_id = %order.order_id, customer = %order.customer, "order placed");
                }
                Ok(Some(OrderMessage::Shipped(shipment))) => {
                    handled += 1;
                    info!(%topic, order_id = %shipment.order_id, tracking = %shipment.tracking_number, "order shipped");
                }
                Ok(None) => {}
                Err(error) => warn!(%error, "undecodable envelope"),
            }
        }
        shutdown.cancel();
    };

    let (stats, ()) = tokio::join!(dispatcher.run(shutdown.clone()), consume);

    let counts = store.status_counts().await?;
    info!(
        cycles = stats.cycles,
        published = counts.published,
        pending = counts.pending,
        dead_lettered = counts.dead_lettered,
        "Order relay finished"
    );
    Ok(())
}
