// src/rabbitmq/client.rs

use lapin::ConnectionProperties;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use super::connection::{ConnectionManager, LiveChannel};
use super::context::DeliveryContext;
use super::dispatcher::{self, Subscription, SubscriptionHandle};
use super::errors::{RabbitMQError, Result};
use super::lapin_transport::{dialer, LapinTransport};
use super::message::{build_publishing, ContentTyper};
use super::options::Options;
use super::transport::{Dialer, Exchange, Topology, Transport, TransportChannel};

struct ClientInner<T: Transport> {
    connection: ConnectionManager<T>,
    options: Options,
    declared: Mutex<HashSet<String>>,
}

/// Publishes and subscribes over a self-healing connection.
///
/// Cheap to clone; clones share the connection and the declared-topology
/// cache.
pub struct Client<T: Transport> {
    inner: Arc<ClientInner<T>>,
}

impl<T: Transport> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Client<LapinTransport> {
    /// Connect to a broker URL. Returns as soon as the URL is validated;
    /// the connection itself is established in the background.
    pub fn dial(url: &str, options: Options) -> Result<Self> {
        Self::dial_config(url, ConnectionProperties::default(), options)
    }

    pub fn dial_config(
        url: &str,
        properties: ConnectionProperties,
        options: Options,
    ) -> Result<Self> {
        Ok(Self::connect_with(dialer(url, properties)?, options))
    }
}

impl<T: Transport> Client<T> {
    pub fn new(connection: ConnectionManager<T>, options: Options) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                connection,
                options,
                declared: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Start a connection manager on `dialer`, bound to the options' context
    /// and reconnect policy.
    pub fn connect_with<D: Dialer<T>>(dialer: D, options: Options) -> Self {
        let connection = ConnectionManager::connect_with_context(
            dialer,
            options.reconnect.clone(),
            &options.context,
        );
        Self::new(connection, options)
    }

    pub fn connection(&self) -> &ConnectionManager<T> {
        &self.inner.connection
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    /// A fresh channel, waiting for the connection when the client was built
    /// with `wait_connection(true, ..)`.
    pub async fn current_channel(&self) -> Result<LiveChannel<T::Channel>> {
        let opts = &self.inner.options;
        if opts.context.is_cancelled() {
            return Err(RabbitMQError::Cancelled);
        }
        if opts.wait.enabled {
            self.inner
                .connection
                .channel_within(opts.wait.timeout, &opts.context)
                .await
        } else {
            self.inner.connection.channel().await
        }
    }

    /// Encode `value` with the default content type (or a sniffed one) and
    /// publish it.
    pub async fn publish<V>(
        &self,
        exchange: &Exchange,
        routing_key: &str,
        value: &V,
        priority: u8,
    ) -> Result<()>
    where
        V: Serialize + ?Sized + Sync,
    {
        self.publish_with(exchange, routing_key, value, None, priority)
            .await
    }

    /// Publish a value that declares its own content type.
    pub async fn publish_typed<V>(
        &self,
        exchange: &Exchange,
        routing_key: &str,
        value: &V,
        priority: u8,
    ) -> Result<()>
    where
        V: Serialize + ContentTyper + Sync,
    {
        self.publish_with(
            exchange,
            routing_key,
            value,
            Some(value.content_type()),
            priority,
        )
        .await
    }

    async fn publish_with<V>(
        &self,
        exchange: &Exchange,
        routing_key: &str,
        value: &V,
        content_type: Option<&str>,
        priority: u8,
    ) -> Result<()>
    where
        V: Serialize + ?Sized + Sync,
    {
        let opts = &self.inner.options;
        // Rejected values never touch the network.
        let publishing =
            build_publishing(&opts.message, &opts.codecs, value, content_type, priority)?;
        let message_id = publishing.message_id.clone();

        let live = self.current_channel().await?;
        let result = async {
            self.declare(&live.channel, &Topology::for_exchange(exchange))
                .await?;
            live.channel
                .publish(&exchange.name, routing_key, publishing)
                .await
        }
        .await;

        if let Err(e) = live.channel.close().await {
            debug!("Failed to close publish channel: {}", e);
        }

        match &result {
            Ok(()) => opts.log.debug.log(&format!(
                "Published message {message_id:?} to {:?} with routing key {routing_key}",
                exchange.name
            )),
            Err(e) => opts.log.error.log(&format!(
                "Failed to publish to {:?}: {e}",
                exchange.name
            )),
        }
        result
    }

    /// Start consuming. Deliveries are decoded into `V` and passed to
    /// `handler` on `handlers_amount` concurrent workers.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn subscribe<V, H, Fut>(&self, subscription: Subscription, handler: H) -> SubscriptionHandle
    where
        V: DeserializeOwned + Send + 'static,
        H: Fn(DeliveryContext, V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        info!(
            queue = %subscription.queue.name,
            exchange = %subscription.exchange.name,
            "Subscribing"
        );
        dispatcher::spawn(self.clone(), subscription, handler)
    }

    /// Declare `topology`, once per client when lazy declaring is on.
    pub(crate) async fn declare(&self, channel: &T::Channel, topology: &Topology) -> Result<()> {
        if topology.is_empty() {
            return Ok(());
        }
        let lazy = self.inner.options.lazy_declaring;
        let key = topology.key();
        if lazy && self.is_declared(&key) {
            return Ok(());
        }

        channel.declare(topology).await?;
        debug!(topology = %key, "Declared topology");

        if lazy {
            if let Ok(mut declared) = self.inner.declared.lock() {
                declared.insert(key);
            }
        }
        Ok(())
    }

    fn is_declared(&self, key: &str) -> bool {
        self.inner
            .declared
            .lock()
            .map(|declared| declared.contains(key))
            .unwrap_or(false)
    }

    /// Close the connection. Running subscriptions wind down on their own.
    pub async fn close(&self) {
        self.inner.connection.close().await;
        self.inner.options.log.info.log("Client closed");
    }
}
