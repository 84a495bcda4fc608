use anyhow::Context;
use resilient_amqp::env::DemoConfig;
use resilient_amqp::options::{self, Options, TracingLogger};
use resilient_amqp::{Client, Event, Exchange, Queue, Subscription};
use serde::{Deserialize, Serialize};
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize, Deserialize)]
struct OrderCreated {
    order_id: u64,
    customer: String,
    total_cents: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = DemoConfig::load().context("loading demo configuration")?;
    info!(exchange = %config.exchange, queue = %config.queue, "Starting demo");

    let options = Options::build([
        options::wait_connection(true, config.wait_timeout()),
        options::handlers_amount(config.handlers_amount),
        options::prefetch_count(config.prefetch_count),
        options::lazy_declaring(true),
        options::application_id("resilient-amqp-demo"),
        options::event_chan_buffer(16),
        options::info_logger(TracingLogger::new(Level::INFO)),
        options::warn_logger(TracingLogger::new(Level::WARN)),
        options::error_logger(TracingLogger::new(Level::ERROR)),
    ])?;
    let client = Client::dial(&config.amqp_addr, options)?;

    let exchange = Exchange::topic(config.exchange.as_str());
    let subscription = Subscription::new(
        exchange.clone(),
        Queue::new(config.queue.as_str()),
        config.routing_key.as_str(),
    );
    let mut handle = client.subscribe(subscription, |ctx, order: OrderCreated| async move {
        info!(
            order_id = order.order_id,
            customer = %order.customer,
            total_cents = order.total_cents,
            generation = ctx.generation(),
            "Received order"
        );
        anyhow::Ok(())
    });

    if let Some(mut events) = handle.take_events() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    Event::Reconnected { generation } => info!(generation, "Subscription recovered"),
                    Event::ConsumeFailed { error } => warn!(%error, "Subscription trouble"),
                    other => info!(?other, "Subscription event"),
                }
            }
        });
    }

    for order_id in 1..=3 {
        let order = OrderCreated {
            order_id,
            customer: format!("customer-{order_id}"),
            total_cents: 1_999 * order_id,
        };
        let routing_key = config.routing_key.replace('#', "created").replace('*', "created");
        client
            .publish(&exchange, &routing_key, &order, 0)
            .await
            .with_context(|| format!("publishing order {order_id}"))?;
    }

    info!("Waiting for Ctrl-C");
    tokio::signal::ctrl_c().await?;

    handle.shutdown().await;
    client.close().await;
    info!("Shut down cleanly");
    Ok(())
}
