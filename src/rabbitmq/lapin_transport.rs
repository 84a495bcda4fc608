// src/rabbitmq/lapin_transport.rs
// Transport implementation on top of lapin.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::uri::AMQPUri;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error};

use super::connection::{ConnectionManager, ReconnectPolicy};
use super::errors::{RabbitMQError, Result};
use super::message::Publishing;
use super::transport::{
    Acknowledger, Delivery, DeliveryStream, Dialer, Exchange, ExchangeKind, Topology,
    Transport, TransportChannel,
};

pub const DEFAULT_PRODUCT: &str = "resilient-amqp";
pub const DEFAULT_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DEFAULT_PLATFORM: &str = "rust";
pub const DEFAULT_INFORMATION: &str =
    "Reconnecting AMQP 0-9-1 client for Rust on top of lapin";
pub const DEFAULT_LOCALE: &str = "en_US";
pub const DEFAULT_HEARTBEAT_SECS: u16 = 10;

/// Fill in the client properties sent in the connection handshake.
/// Keys the caller already set are left untouched.
pub fn setup_default_properties(mut properties: ConnectionProperties) -> ConnectionProperties {
    let defaults = [
        ("product", DEFAULT_PRODUCT),
        ("version", DEFAULT_VERSION),
        ("platform", DEFAULT_PLATFORM),
        ("information", DEFAULT_INFORMATION),
    ];
    for (key, value) in defaults {
        let key = ShortString::from(key);
        if !properties.client_properties.inner().contains_key(&key) {
            properties.client_properties.insert(
                key,
                AMQPValue::LongString(LongString::from(value)),
            );
        }
    }
    if properties.locale.is_empty() {
        properties.locale = DEFAULT_LOCALE.to_string();
    }
    properties
}

/// Parse an `amqp://` / `amqps://` URI, defaulting the heartbeat when the
/// query string does not set one.
pub fn parse_uri(url: &str) -> Result<AMQPUri> {
    let mut uri = AMQPUri::from_str(url)
        .map_err(|e| RabbitMQError::InvalidConfig(format!("invalid AMQP URI {url:?}: {e}")))?;
    if uri.query.heartbeat.is_none() {
        uri.query.heartbeat = Some(DEFAULT_HEARTBEAT_SECS);
    }
    Ok(uri)
}

/// A lapin connection plus a watcher for its failure.
pub struct LapinTransport {
    connection: Connection,
    lost: watch::Receiver<Option<String>>,
}

impl LapinTransport {
    pub fn new(connection: Connection) -> Self {
        let (tx, lost) = watch::channel(None);
        connection.on_error(move |err| {
            error!("RabbitMQ connection error: {}", err);
            tx.send_replace(Some(err.to_string()));
        });
        Self { connection, lost }
    }

    pub async fn connect(uri: AMQPUri, properties: ConnectionProperties) -> Result<Self> {
        let connection = Connection::connect_uri(uri, properties).await?;
        Ok(Self::new(connection))
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

#[async_trait]
impl Transport for LapinTransport {
    type Channel = LapinChannel;

    async fn create_channel(&self) -> Result<LapinChannel> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| RabbitMQError::ChannelError(e.to_string()))?;
        Ok(LapinChannel { channel })
    }

    async fn closed(&self) -> String {
        let mut lost = self.lost.clone();
        let reason = match lost.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "connection dropped".to_string(),
        };
        reason
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self) -> Result<()> {
        if self.connection.status().connected() {
            self.connection.close(200, "Closing connection").await?;
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct LapinChannel {
    channel: Channel,
}

impl LapinChannel {
    pub fn inner(&self) -> &Channel {
        &self.channel
    }
}

#[async_trait]
impl TransportChannel for LapinChannel {
    async fn declare(&self, topology: &Topology) -> Result<()> {
        if let Some(exchange) = &topology.exchange {
            self.channel
                .exchange_declare(
                    &exchange.name,
                    exchange_kind(exchange),
                    ExchangeDeclareOptions {
                        durable: exchange.durable,
                        auto_delete: exchange.auto_delete,
                        ..ExchangeDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    RabbitMQError::ChannelError(format!("Failed to declare exchange: {}", e))
                })?;
        }

        if let Some(queue) = &topology.queue {
            self.channel
                .queue_declare(
                    &queue.name,
                    QueueDeclareOptions {
                        durable: queue.durable,
                        exclusive: queue.exclusive,
                        auto_delete: queue.auto_delete,
                        ..QueueDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    RabbitMQError::ChannelError(format!("Failed to declare queue: {}", e))
                })?;

            if let Some(exchange) = &topology.exchange {
                for key in &topology.binding_keys {
                    self.channel
                        .queue_bind(
                            &queue.name,
                            &exchange.name,
                            key,
                            QueueBindOptions::default(),
                            FieldTable::default(),
                        )
                        .await
                        .map_err(|e| {
                            RabbitMQError::ChannelError(format!("Failed to bind queue: {}", e))
                        })?;
                }
            }
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        publishing: Publishing,
    ) -> Result<()> {
        let properties = to_properties(&publishing);
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &publishing.body,
                properties,
            )
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;
        Ok(())
    }

    async fn qos(&self, prefetch_count: u16) -> Result<()> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to set QoS: {}", e)))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))?;

        Ok(consumer
            .map(|delivery| delivery.map(from_lapin).map_err(RabbitMQError::from))
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))
    }

    async fn close(&self) -> Result<()> {
        if self.channel.status().connected() {
            self.channel
                .close(200, "Closing channel")
                .await
                .map_err(|e| RabbitMQError::ChannelError(e.to_string()))?;
        }
        Ok(())
    }
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }
}

fn exchange_kind(exchange: &Exchange) -> lapin::ExchangeKind {
    match exchange.kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

fn to_properties(publishing: &Publishing) -> BasicProperties {
    let mut properties = BasicProperties::default()
        .with_content_type(ShortString::from(publishing.content_type.clone()))
        .with_priority(publishing.priority)
        .with_timestamp(publishing.timestamp.timestamp().max(0) as u64);

    if !publishing.message_id.is_empty() {
        properties = properties.with_message_id(ShortString::from(publishing.message_id.clone()));
    }
    if !publishing.app_id.is_empty() {
        properties = properties.with_app_id(ShortString::from(publishing.app_id.clone()));
    }
    if !publishing.user_id.is_empty() {
        properties = properties.with_user_id(ShortString::from(publishing.user_id.clone()));
    }
    if !publishing.kind.is_empty() {
        properties = properties.with_type(ShortString::from(publishing.kind.clone()));
    }
    if !publishing.headers.is_empty() {
        let mut headers = FieldTable::default();
        for (key, value) in &publishing.headers {
            headers.insert(
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            );
        }
        properties = properties.with_headers(headers);
    }
    properties
}

fn from_lapin(delivery: lapin::message::Delivery) -> Delivery {
    let lapin::message::Delivery {
        delivery_tag,
        exchange,
        routing_key,
        redelivered,
        properties: props,
        data,
        acker,
        ..
    } = delivery;
    let text = |s: &Option<ShortString>| s.as_ref().map(|s| s.as_str().to_string());

    let mut headers = BTreeMap::new();
    if let Some(table) = props.headers() {
        for (key, value) in table.inner() {
            headers.insert(key.as_str().to_string(), header_text(value));
        }
    }

    let mut out = Delivery::new(delivery_tag, data, Arc::new(LapinAcker(acker)));
    out.exchange = exchange.as_str().to_string();
    out.routing_key = routing_key.as_str().to_string();
    out.redelivered = redelivered;
    out.content_type = text(props.content_type());
    out.priority = *props.priority();
    out.message_id = text(props.message_id());
    out.app_id = text(props.app_id());
    out.user_id = text(props.user_id());
    out.kind = text(props.kind());
    out.timestamp = *props.timestamp();
    out.headers = headers;
    out
}

fn header_text(value: &AMQPValue) -> String {
    match value {
        AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
        AMQPValue::ShortString(s) => s.as_str().to_string(),
        AMQPValue::Boolean(b) => b.to_string(),
        other => format!("{:?}", other),
    }
}

/// Produces [`ConnectionManager`]s on demand.
pub type Connector = Box<dyn Fn() -> Result<ConnectionManager<LapinTransport>> + Send + Sync>;

/// Reconnecting connection to `url` with default properties.
///
/// Only an unparseable URI is reported here; everything else is retried in
/// the background.
pub fn dial(url: &str, policy: ReconnectPolicy) -> Result<ConnectionManager<LapinTransport>> {
    dial_config(url, ConnectionProperties::default(), policy)
}

/// Reconnecting connection with caller-supplied properties; defaults fill
/// only the keys the caller left out.
pub fn dial_config(
    url: &str,
    properties: ConnectionProperties,
    policy: ReconnectPolicy,
) -> Result<ConnectionManager<LapinTransport>> {
    Ok(ConnectionManager::connect(dialer(url, properties)?, policy))
}

/// The dial function a [`ConnectionManager`] retries.
pub fn dialer(url: &str, properties: ConnectionProperties) -> Result<impl Dialer<LapinTransport>> {
    let (uri, properties) = dial_target(url, properties)?;
    debug!(host = %uri.authority.host, "Dialing RabbitMQ");
    Ok(move || LapinTransport::connect(uri.clone(), properties.clone()))
}

/// Parsed URI and handshake properties every dial of `url` will use.
fn dial_target(url: &str, properties: ConnectionProperties) -> Result<(AMQPUri, ConnectionProperties)> {
    Ok((parse_uri(url)?, setup_default_properties(properties)))
}

pub fn default_connector(url: &str, policy: ReconnectPolicy) -> Connector {
    let url = url.to_string();
    Box::new(move || dial(&url, policy.clone()))
}

pub fn config_connector(
    url: &str,
    properties: ConnectionProperties,
    policy: ReconnectPolicy,
) -> Connector {
    let url = url.to_string();
    Box::new(move || dial_config(&url, properties.clone(), policy.clone()))
}
