// src/rabbitmq/transport.rs
// The seam between the reconnecting client and the AMQP library underneath.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use super::errors::Result;
use super::message::Publishing;

/// Deliveries pushed by the broker for one consumer.
///
/// The stream ends when the consumer is cancelled or its channel dies.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// A live, protocol-capable connection to the broker.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Channel: TransportChannel;

    async fn create_channel(&self) -> Result<Self::Channel>;

    /// Resolves once the connection is gone, with a human-readable reason.
    async fn closed(&self) -> String;

    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

/// A channel derived from a [`Transport`], used for one publish or consume.
#[async_trait]
pub trait TransportChannel: Send + Sync + 'static {
    async fn declare(&self, topology: &Topology) -> Result<()>;

    async fn publish(&self, exchange: &str, routing_key: &str, publishing: Publishing)
        -> Result<()>;

    async fn qos(&self, prefetch_count: u16) -> Result<()>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Produces fresh transports for the connection manager.
///
/// Any `Fn() -> impl Future<Output = Result<T>>` closure is a dialer.
#[async_trait]
pub trait Dialer<T>: Send + Sync + 'static {
    async fn dial(&self) -> Result<T>;
}

#[async_trait]
impl<T, F, Fut> Dialer<T> for F
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    async fn dial(&self) -> Result<T> {
        (self)().await
    }
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn nack(&self, requeue: bool) -> Result<()>;

    async fn reject(&self, requeue: bool) -> Result<()>;
}

/// One inbound message.
#[derive(Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub content_type: Option<String>,
    pub priority: Option<u8>,
    pub message_id: Option<String>,
    pub app_id: Option<String>,
    pub user_id: Option<String>,
    pub kind: Option<String>,
    pub timestamp: Option<u64>,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(delivery_tag: u64, body: Vec<u8>, acker: Arc<dyn Acknowledger>) -> Self {
        Self {
            delivery_tag,
            exchange: String::new(),
            routing_key: String::new(),
            redelivered: false,
            content_type: None,
            priority: None,
            message_id: None,
            app_id: None,
            user_id: None,
            kind: None,
            timestamp: None,
            headers: BTreeMap::new(),
            body,
            acker,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }

    pub async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("content_type", &self.content_type)
            .field("priority", &self.priority)
            .field("message_id", &self.message_id)
            .field("body_len", &self.body.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
    Headers,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Exchange {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
}

impl Exchange {
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: true,
            auto_delete: false,
        }
    }

    pub fn direct(name: impl Into<String>) -> Self {
        Self::new(name, ExchangeKind::Direct)
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self::new(name, ExchangeKind::Topic)
    }

    pub fn fanout(name: impl Into<String>) -> Self {
        Self::new(name, ExchangeKind::Fanout)
    }

    /// The nameless default exchange; never declared.
    pub fn default_exchange() -> Self {
        Self::direct("")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Queue {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl Queue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }
}

/// Exchanges, queues and bindings a publish or subscribe depends on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Topology {
    pub exchange: Option<Exchange>,
    pub queue: Option<Queue>,
    pub binding_keys: Vec<String>,
}

impl Topology {
    pub fn for_exchange(exchange: &Exchange) -> Self {
        Self {
            exchange: (!exchange.name.is_empty()).then(|| exchange.clone()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.exchange.is_none() && self.queue.is_none()
    }

    /// Identity used by lazy declaring.
    pub fn key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.exchange.as_ref().map_or("", |e| e.name.as_str()),
            self.queue.as_ref().map_or("", |q| q.name.as_str()),
            self.binding_keys.join(",")
        )
    }
}
