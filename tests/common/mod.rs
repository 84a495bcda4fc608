//! In-memory broker used by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use resilient_amqp::options::{self, ClientOption, Options};
use resilient_amqp::rabbitmq::transport::{
    Acknowledger, Delivery, DeliveryStream, Topology, TransportChannel,
};
use resilient_amqp::rabbitmq::{Client, Publishing, RabbitMQError, ReconnectPolicy, Result, Transport};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub publishing: Publishing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Nack { requeue: bool },
    Reject { requeue: bool },
}

struct Link {
    closed: CancellationToken,
}

#[derive(Default)]
struct BrokerState {
    dials: AtomicU32,
    failing_dials: AtomicU32,
    refuse_all: AtomicBool,
    channels_opened: AtomicUsize,
    next_tag: AtomicU64,
    current: Mutex<Option<Arc<Link>>>,
    consumers: Mutex<HashMap<String, UnboundedSender<Result<Delivery>>>>,
    published: Mutex<Vec<Published>>,
    declared: Mutex<Vec<Topology>>,
    qos: Mutex<Vec<u16>>,
    cancelled: Mutex<Vec<String>>,
    settlements: Mutex<Vec<(u64, Settlement)>>,
}

/// Fake broker: counts dials, records everything the client sends and lets
/// tests push deliveries or sever the connection.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<BrokerState>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` dials.
    pub fn fail_next_dials(&self, n: u32) {
        self.state.failing_dials.store(n, Ordering::SeqCst);
    }

    pub fn refuse_all(&self, refuse: bool) {
        self.state.refuse_all.store(refuse, Ordering::SeqCst);
    }

    pub fn dialer(&self) -> impl Fn() -> futures::future::Ready<Result<MockTransport>> + Send + Sync + 'static {
        let broker = self.clone();
        move || futures::future::ready(broker.dial())
    }

    fn dial(&self) -> Result<MockTransport> {
        self.state.dials.fetch_add(1, Ordering::SeqCst);
        if self.state.refuse_all.load(Ordering::SeqCst) {
            return Err(RabbitMQError::ConnectionError("connection refused".into()));
        }
        let failing = self
            .state
            .failing_dials
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(RabbitMQError::ConnectionError("connection refused".into()));
        }

        let link = Arc::new(Link {
            closed: CancellationToken::new(),
        });
        *self.state.current.lock().unwrap() = Some(link.clone());
        Ok(MockTransport {
            link,
            state: self.state.clone(),
        })
    }

    /// Sever the live connection: its transport reports closed and every
    /// consumer stream ends.
    pub fn drop_connection(&self) {
        if let Some(link) = self.state.current.lock().unwrap().take() {
            link.closed.cancel();
        }
        self.state.consumers.lock().unwrap().clear();
    }

    pub fn dials(&self) -> u32 {
        self.state.dials.load(Ordering::SeqCst)
    }

    pub fn channels_opened(&self) -> usize {
        self.state.channels_opened.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<Published> {
        self.state.published.lock().unwrap().clone()
    }

    pub fn declared(&self) -> Vec<Topology> {
        self.state.declared.lock().unwrap().clone()
    }

    pub fn qos(&self) -> Vec<u16> {
        self.state.qos.lock().unwrap().clone()
    }

    pub fn cancelled_consumers(&self) -> Vec<String> {
        self.state.cancelled.lock().unwrap().clone()
    }

    pub fn settlements(&self) -> Vec<(u64, Settlement)> {
        self.state.settlements.lock().unwrap().clone()
    }

    pub fn has_consumer(&self, tag: &str) -> bool {
        self.state.consumers.lock().unwrap().contains_key(tag)
    }

    pub async fn wait_for_consumer(&self, tag: &str) {
        assert!(
            eventually(Duration::from_secs(2), || self.has_consumer(tag)).await,
            "consumer {tag} never registered"
        );
    }

    pub async fn wait_for_settlements(&self, n: usize) -> Vec<(u64, Settlement)> {
        assert!(
            eventually(Duration::from_secs(2), || self.settlements().len() >= n).await,
            "expected {n} settlements, got {:?}",
            self.settlements()
        );
        self.settlements()
    }

    /// Push a delivery to consumer `tag`. Returns its delivery tag.
    pub fn deliver(&self, tag: &str, delivery: impl FnOnce(Delivery) -> Delivery, body: &[u8]) -> u64 {
        let delivery_tag = self.state.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        let acker = Arc::new(MockAcker {
            delivery_tag,
            state: self.state.clone(),
        });
        let delivery = delivery(Delivery::new(delivery_tag, body.to_vec(), acker));
        let consumers = self.state.consumers.lock().unwrap();
        let sender = consumers
            .get(tag)
            .unwrap_or_else(|| panic!("no consumer {tag}"));
        sender.unbounded_send(Ok(delivery)).unwrap();
        delivery_tag
    }

    pub fn deliver_json(&self, tag: &str, value: &serde_json::Value) -> u64 {
        let body = serde_json::to_vec(value).unwrap();
        self.deliver(tag, |d| d.with_content_type("application/json"), &body)
    }
}

pub struct MockTransport {
    link: Arc<Link>,
    state: Arc<BrokerState>,
}

#[async_trait]
impl Transport for MockTransport {
    type Channel = MockChannel;

    async fn create_channel(&self) -> Result<MockChannel> {
        if self.link.closed.is_cancelled() {
            return Err(RabbitMQError::ChannelError("connection is closed".into()));
        }
        self.state.channels_opened.fetch_add(1, Ordering::SeqCst);
        Ok(MockChannel {
            link: self.link.clone(),
            state: self.state.clone(),
        })
    }

    async fn closed(&self) -> String {
        self.link.closed.cancelled().await;
        "connection dropped by test".to_string()
    }

    fn is_connected(&self) -> bool {
        !self.link.closed.is_cancelled()
    }

    async fn close(&self) -> Result<()> {
        self.link.closed.cancel();
        Ok(())
    }
}

pub struct MockChannel {
    link: Arc<Link>,
    state: Arc<BrokerState>,
}

impl std::fmt::Debug for MockChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockChannel")
            .field("open", &!self.link.closed.is_cancelled())
            .finish()
    }
}

impl MockChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.link.closed.is_cancelled() {
            return Err(RabbitMQError::ChannelError("channel is closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl TransportChannel for MockChannel {
    async fn declare(&self, topology: &Topology) -> Result<()> {
        self.ensure_open()?;
        self.state.declared.lock().unwrap().push(topology.clone());
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, publishing: Publishing) -> Result<()> {
        self.ensure_open()?;
        self.state.published.lock().unwrap().push(Published {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            publishing,
        });
        Ok(())
    }

    async fn qos(&self, prefetch_count: u16) -> Result<()> {
        self.ensure_open()?;
        self.state.qos.lock().unwrap().push(prefetch_count);
        Ok(())
    }

    async fn consume(&self, _queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let (tx, rx) = unbounded();
        self.state
            .consumers
            .lock()
            .unwrap()
            .insert(consumer_tag.to_string(), tx);
        Ok(rx.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.state.consumers.lock().unwrap().remove(consumer_tag);
        self.state
            .cancelled
            .lock()
            .unwrap()
            .push(consumer_tag.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct MockAcker {
    delivery_tag: u64,
    state: Arc<BrokerState>,
}

impl MockAcker {
    fn record(&self, settlement: Settlement) -> Result<()> {
        self.state
            .settlements
            .lock()
            .unwrap()
            .push((self.delivery_tag, settlement));
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MockAcker {
    async fn ack(&self) -> Result<()> {
        self.record(Settlement::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.record(Settlement::Nack { requeue })
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.record(Settlement::Reject { requeue })
    }
}

pub fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy::default()
        .with_initial_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(40))
        .without_jitter()
}

/// Client over `broker` with a fast reconnect policy plus `extra` options.
pub fn client(broker: &MockBroker, extra: Vec<ClientOption>) -> Client<MockTransport> {
    let mut all = vec![options::reconnect_policy(fast_policy())];
    all.extend(extra);
    let options = Options::build(all).unwrap();
    Client::connect_with(broker.dialer(), options)
}

pub async fn connected(client: &Client<MockTransport>) {
    assert!(
        eventually(Duration::from_secs(2), || client.connection().is_connected()).await,
        "client never connected"
    );
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(5)).await;
    }
    check()
}
