// src/rabbitmq/dispatcher.rs
// Fans one delivery stream out to a pool of handler workers.

use futures::future::{join_all, FutureExt};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::client::Client;
use super::connection::LiveChannel;
use super::context::DeliveryContext;
use super::errors::{RabbitMQError, Result};
use super::message::decode_delivery;
use super::transport::{
    Delivery, DeliveryStream, Exchange, Queue, Topology, Transport, TransportChannel,
};

/// What to consume and the topology it needs.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub exchange: Exchange,
    pub queue: Queue,
    pub binding_keys: Vec<String>,
    pub consumer_tag: String,
}

impl Subscription {
    pub fn new(exchange: Exchange, queue: Queue, binding_key: impl Into<String>) -> Self {
        Self {
            exchange,
            queue,
            binding_keys: vec![binding_key.into()],
            consumer_tag: format!("consumer-{}", Uuid::new_v4()),
        }
    }

    /// Consume `queue` directly, without an exchange or binding.
    pub fn queue(queue: Queue) -> Self {
        Self {
            exchange: Exchange::default_exchange(),
            queue,
            binding_keys: Vec::new(),
            consumer_tag: format!("consumer-{}", Uuid::new_v4()),
        }
    }

    pub fn with_binding_key(mut self, key: impl Into<String>) -> Self {
        self.binding_keys.push(key.into());
        self
    }

    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = tag.into();
        self
    }

    pub fn topology(&self) -> Topology {
        let exchange = (!self.exchange.name.is_empty()).then(|| self.exchange.clone());
        Topology {
            binding_keys: if exchange.is_some() {
                self.binding_keys.clone()
            } else {
                Vec::new()
            },
            exchange,
            queue: Some(self.queue.clone()),
        }
    }
}

/// Things that happened inside a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Subscribed { generation: u64 },
    Reconnected { generation: u64 },
    Delivered { delivery_tag: u64 },
    HandlerFailed { delivery_tag: u64, error: String },
    DecodeFailed { delivery_tag: u64, error: String },
    PriorityRejected { delivery_tag: u64, priority: u8 },
    ConsumeFailed { error: String },
}

/// Controls a running subscription.
pub struct SubscriptionHandle {
    done: CancellationToken,
    events: Option<mpsc::Receiver<Event>>,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    /// Signal the subscription to stop. Whether buffered deliveries are still
    /// handled depends on `process_all_deliveries`.
    pub fn stop(&self) {
        self.done.cancel();
    }

    pub fn done(&self) -> &CancellationToken {
        &self.done
    }

    /// `None` when events are disabled (`event_chan_buffer(0)`) or were taken.
    pub fn events(&mut self) -> Option<&mut mpsc::Receiver<Event>> {
        self.events.as_mut()
    }

    pub fn take_events(&mut self) -> Option<mpsc::Receiver<Event>> {
        self.events.take()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the subscription loop to end.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!("Subscription task ended abnormally: {}", e);
        }
    }

    pub async fn shutdown(self) {
        self.stop();
        self.join().await;
    }
}

struct Emitter(Option<mpsc::Sender<Event>>);

impl Emitter {
    // Never blocks: a full buffer drops the event.
    fn emit(&self, event: Event) {
        if let Some(tx) = &self.0 {
            if let Err(TrySendError::Full(event)) = tx.try_send(event) {
                debug!(?event, "Event buffer full, dropping event");
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Failure {
    Decode,
    Handler,
}

type SharedStream = Arc<Mutex<DeliveryStream>>;

pub(crate) struct Dispatcher<T: Transport, V, H> {
    client: Client<T>,
    subscription: Subscription,
    handler: H,
    done: CancellationToken,
    events: Emitter,
    _value: PhantomData<fn() -> V>,
}

pub(crate) fn spawn<T, V, H, Fut>(
    client: Client<T>,
    subscription: Subscription,
    handler: H,
) -> SubscriptionHandle
where
    T: Transport,
    V: DeserializeOwned + Send + 'static,
    H: Fn(DeliveryContext, V) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let done = client.options().context.child_token();
    let buffer = client.options().event_buffer;
    let (tx, events) = if buffer > 0 {
        let (tx, rx) = mpsc::channel(buffer);
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };

    let dispatcher = Arc::new(Dispatcher {
        client,
        subscription,
        handler,
        done: done.clone(),
        events: Emitter(tx),
        _value: PhantomData,
    });
    let task = tokio::spawn(dispatcher.run());

    SubscriptionHandle { done, events, task }
}

impl<T, V, H, Fut> Dispatcher<T, V, H>
where
    T: Transport,
    V: DeserializeOwned + Send + 'static,
    H: Fn(DeliveryContext, V) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(self: Arc<Self>) {
        let opts = self.client.options();
        let queue = &self.subscription.queue.name;
        let mut last_generation: Option<u64> = None;
        let mut failures = 0u32;

        while !self.done.is_cancelled() {
            let live = match self.client.connection().wait_channel(&self.done).await {
                Ok(live) => live,
                Err(RabbitMQError::Cancelled) => break,
                Err(e @ (RabbitMQError::ConnectionClosed | RabbitMQError::ReconnectExhausted { .. })) => {
                    opts.log.error.log(&format!("Subscription to {queue} ended: {e}"));
                    self.events.emit(Event::ConsumeFailed {
                        error: e.to_string(),
                    });
                    break;
                }
                Err(e) => {
                    self.retry_later(&mut failures, e).await;
                    continue;
                }
            };

            match last_generation {
                Some(previous) if previous != live.generation => {
                    info!(queue = %queue, generation = live.generation, "Resubscribing after reconnect");
                    opts.log.info.log(&format!(
                        "Resubscribed to {queue} on connection generation {}",
                        live.generation
                    ));
                    self.events.emit(Event::Reconnected {
                        generation: live.generation,
                    });
                }
                Some(_) => {}
                None => {
                    opts.log.info.log(&format!("Subscribed to {queue}"));
                    self.events.emit(Event::Subscribed {
                        generation: live.generation,
                    });
                }
            }
            last_generation = Some(live.generation);

            match self.consume_round(&live).await {
                Ok(()) => failures = 0,
                Err(e) => self.retry_later(&mut failures, e).await,
            }

            if let Err(e) = live.channel.close().await {
                debug!("Failed to close consumer channel: {}", e);
            }
        }

        debug!(queue = %queue, "Subscription stopped");
    }

    async fn retry_later(&self, failures: &mut u32, error: RabbitMQError) {
        *failures += 1;
        let queue = &self.subscription.queue.name;
        warn!(queue = %queue, attempt = *failures, "Subscription round failed: {}", error);
        self.client
            .options()
            .log
            .warn
            .log(&format!("Subscription to {queue} failed: {error}"));
        self.events.emit(Event::ConsumeFailed {
            error: error.to_string(),
        });

        let delay = self.client.options().reconnect.delay_for(*failures);
        tokio::select! {
            _ = self.done.cancelled() => {}
            _ = sleep(delay) => {}
        }
    }

    /// One consume session on one channel. Returns when the stream ends or
    /// the subscription is stopped.
    async fn consume_round(self: &Arc<Self>, live: &LiveChannel<T::Channel>) -> Result<()> {
        let opts = self.client.options();
        let sub = &self.subscription;

        self.client.declare(&live.channel, &sub.topology()).await?;
        if opts.prefetch_count > 0 {
            live.channel.qos(opts.prefetch_count).await?;
        }
        let stream = live
            .channel
            .consume(&sub.queue.name, &sub.consumer_tag)
            .await?;
        info!(
            queue = %sub.queue.name,
            consumer = %sub.consumer_tag,
            workers = opts.handlers_amount,
            "Started consuming"
        );

        let stream: SharedStream = Arc::new(Mutex::new(stream));
        let workers: Vec<_> = (0..opts.handlers_amount)
            .map(|id| tokio::spawn(self.clone().worker(id, stream.clone(), live.generation)))
            .collect();
        let all = join_all(workers);
        tokio::pin!(all);

        let results = tokio::select! {
            results = &mut all => results,
            _ = self.done.cancelled() => {
                if opts.process_all_deliveries {
                    // Stop the broker pushing; workers drain what is buffered.
                    if let Err(e) = live.channel.cancel(&sub.consumer_tag).await {
                        debug!("Failed to cancel consumer: {}", e);
                    }
                }
                (&mut all).await
            }
        };

        for result in results {
            if let Err(e) = result {
                warn!("Handler worker ended abnormally: {}", e);
            }
        }
        Ok(())
    }

    async fn worker(self: Arc<Self>, id: usize, stream: SharedStream, generation: u64) {
        let process_all = self.client.options().process_all_deliveries;
        debug!(worker = id, generation, "Worker started");

        loop {
            let next = tokio::select! {
                biased;
                _ = self.done.cancelled(), if !process_all => None,
                next = next_delivery(&stream) => next,
            };

            match next {
                Some(Ok(delivery)) => self.handle(delivery, generation).await,
                Some(Err(e)) => {
                    warn!(worker = id, "Error receiving message: {}", e);
                    self.events.emit(Event::ConsumeFailed {
                        error: e.to_string(),
                    });
                    break;
                }
                None => break,
            }
        }

        debug!(worker = id, "Worker stopped");
    }

    async fn handle(&self, delivery: Delivery, generation: u64) {
        let opts = self.client.options();
        let tag = delivery.delivery_tag;

        if let Some(priority) = delivery.priority {
            if opts.message.check_priority(priority).is_err() {
                opts.log.warn.log(&format!(
                    "Rejecting delivery {tag} with priority {priority} outside {}..={}",
                    opts.message.min_priority, opts.message.max_priority
                ));
                self.events.emit(Event::PriorityRejected {
                    delivery_tag: tag,
                    priority,
                });
                if let Err(e) = delivery.reject(false).await {
                    warn!("Failed to reject message: {}", e);
                }
                return;
            }
        }

        let ctx = opts
            .message
            .delivery_before
            .iter()
            .fold(DeliveryContext::new(self.done.clone(), generation), |ctx, hook| {
                hook(ctx, &delivery)
            });

        let value: V =
            match decode_delivery(&opts.codecs, &delivery, &opts.message.default_content_type) {
                Ok(value) => value,
                Err(e) => return self.fail(&delivery, e, Failure::Decode).await,
            };

        let outcome = AssertUnwindSafe(async { (self.handler)(ctx, value).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {
                if let Err(e) = delivery.ack().await {
                    warn!("Failed to acknowledge message: {}", e);
                }
                opts.log.debug.log(&format!("Handled delivery {tag}"));
                self.events.emit(Event::Delivered { delivery_tag: tag });
            }
            Ok(Err(e)) => {
                self.fail(&delivery, RabbitMQError::handler(e), Failure::Handler)
                    .await
            }
            Err(panic) => {
                let error = RabbitMQError::HandlerError(panic_message(panic).into());
                self.fail(&delivery, error, Failure::Handler).await
            }
        }
    }

    async fn fail(&self, delivery: &Delivery, error: RabbitMQError, failure: Failure) {
        let opts = self.client.options();
        let tag = delivery.delivery_tag;

        let error = opts
            .error_before
            .iter()
            .try_fold(error, |error, hook| hook(delivery, error));

        let Some(error) = error else {
            opts.log.debug.log(&format!("Error for delivery {tag} suppressed"));
            if let Err(e) = delivery.ack().await {
                warn!("Failed to acknowledge message: {}", e);
            }
            return;
        };

        opts.log
            .error
            .log(&format!("Failed to process delivery {tag}: {error}"));

        let settled = match failure {
            Failure::Decode => {
                self.events.emit(Event::DecodeFailed {
                    delivery_tag: tag,
                    error: error.to_string(),
                });
                // Reject malformed messages
                delivery.reject(false).await
            }
            Failure::Handler => {
                self.events.emit(Event::HandlerFailed {
                    delivery_tag: tag,
                    error: error.to_string(),
                });
                delivery.nack(true).await
            }
        };
        if let Err(e) = settled {
            warn!("Failed to settle message {}: {}", tag, e);
        }
    }
}

async fn next_delivery(stream: &Mutex<DeliveryStream>) -> Option<Result<Delivery>> {
    stream.lock().await.next().await
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}
