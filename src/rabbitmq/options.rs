// src/rabbitmq/options.rs
// Client configuration, built once from option functions and then frozen.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use uuid::Uuid;

use super::codecs::{CodecRegistry, APPLICATION_JSON};
use super::connection::ReconnectPolicy;
use super::context::DeliveryContext;
use super::errors::{RabbitMQError, Result};
use super::message::Publishing;
use super::transport::Delivery;

pub const MAX_MESSAGE_PRIORITY: u8 = 9;
pub const MIN_MESSAGE_PRIORITY: u8 = 0;

const DEFAULT_WAIT_DEADLINE: Duration = Duration::from_secs(5);
const DEFAULT_EVENT_BUFFER: usize = 1;
const DEFAULT_HANDLERS_AMOUNT: usize = 1;

/// Returns a new message id on every publish.
pub type MessageIdBuilder = Arc<dyn Fn() -> String + Send + Sync>;
/// Maps a value's type name to the envelope's `type` property.
pub type Typer = Arc<dyn Fn(&str) -> String + Send + Sync>;
/// Mutates an envelope before it is published.
pub type PublishingBefore = Arc<dyn Fn(&mut Publishing) + Send + Sync>;
/// Enriches the per-delivery context before the handler runs.
pub type DeliveryBefore = Arc<dyn Fn(DeliveryContext, &Delivery) -> DeliveryContext + Send + Sync>;
/// Transforms a delivery failure; `None` suppresses it.
pub type ErrorBefore =
    Arc<dyn Fn(&Delivery, RabbitMQError) -> Option<RabbitMQError> + Send + Sync>;

/// One sink of the leveled logger set.
pub trait Logger: Send + Sync {
    fn log(&self, message: &str);
}

impl<F> Logger for F
where
    F: Fn(&str) + Send + Sync,
{
    fn log(&self, message: &str) {
        self(message)
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn log(&self, _message: &str) {}
}

/// Forwards to `tracing` at a fixed level.
#[derive(Debug, Clone, Copy)]
pub struct TracingLogger {
    level: Level,
}

impl TracingLogger {
    pub fn new(level: Level) -> Self {
        Self { level }
    }
}

impl Logger for TracingLogger {
    fn log(&self, message: &str) {
        match self.level {
            Level::ERROR => tracing::error!(target: "resilient_amqp", "{message}"),
            Level::WARN => tracing::warn!(target: "resilient_amqp", "{message}"),
            Level::INFO => tracing::info!(target: "resilient_amqp", "{message}"),
            Level::DEBUG => tracing::debug!(target: "resilient_amqp", "{message}"),
            _ => tracing::trace!(target: "resilient_amqp", "{message}"),
        }
    }
}

#[derive(Clone)]
pub struct Loggers {
    pub debug: Arc<dyn Logger>,
    pub info: Arc<dyn Logger>,
    pub warn: Arc<dyn Logger>,
    pub error: Arc<dyn Logger>,
}

impl Default for Loggers {
    fn default() -> Self {
        let noop: Arc<dyn Logger> = Arc::new(NoopLogger);
        Self {
            debug: noop.clone(),
            info: noop.clone(),
            warn: noop.clone(),
            error: noop,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub enabled: bool,
    pub timeout: Duration,
}

#[derive(Clone)]
pub struct MessageOptions {
    pub id_builder: MessageIdBuilder,
    pub typer: Typer,
    pub min_priority: u8,
    pub max_priority: u8,
    pub application_id: String,
    pub user_id: String,
    pub publish_before: Vec<PublishingBefore>,
    pub delivery_before: Vec<DeliveryBefore>,
    pub default_content_type: String,
}

impl MessageOptions {
    pub fn check_priority(&self, priority: u8) -> Result<()> {
        if (self.min_priority..=self.max_priority).contains(&priority) {
            Ok(())
        } else {
            Err(RabbitMQError::PriorityOutOfRange {
                priority,
                min: self.min_priority,
                max: self.max_priority,
            })
        }
    }
}

impl Default for MessageOptions {
    fn default() -> Self {
        Self {
            id_builder: Arc::new(String::new),
            typer: Arc::new(|_: &str| String::new()),
            min_priority: MIN_MESSAGE_PRIORITY,
            max_priority: MAX_MESSAGE_PRIORITY,
            application_id: String::new(),
            user_id: String::new(),
            publish_before: Vec::new(),
            delivery_before: Vec::new(),
            default_content_type: APPLICATION_JSON.to_string(),
        }
    }
}

/// Frozen client configuration.
///
/// Build it with [`Options::build`] from an ordered list of option functions;
/// later options override earlier ones, hook options append.
#[derive(Clone)]
pub struct Options {
    pub wait: WaitOptions,
    pub reconnect: ReconnectPolicy,
    pub event_buffer: usize,
    pub log: Loggers,
    pub context: CancellationToken,
    pub message: MessageOptions,
    pub error_before: Vec<ErrorBefore>,
    pub process_all_deliveries: bool,
    pub handlers_amount: usize,
    pub lazy_declaring: bool,
    pub prefetch_count: u16,
    pub codecs: CodecRegistry,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            wait: WaitOptions {
                enabled: false,
                timeout: DEFAULT_WAIT_DEADLINE,
            },
            reconnect: ReconnectPolicy::default(),
            event_buffer: DEFAULT_EVENT_BUFFER,
            log: Loggers::default(),
            context: CancellationToken::new(),
            message: MessageOptions::default(),
            error_before: Vec::new(),
            process_all_deliveries: false,
            handlers_amount: DEFAULT_HANDLERS_AMOUNT,
            lazy_declaring: false,
            prefetch_count: 0,
            codecs: CodecRegistry::default(),
        }
    }
}

impl Options {
    pub fn build(options: impl IntoIterator<Item = ClientOption>) -> Result<Self> {
        let mut built = Options::default();
        for option in options {
            option(&mut built);
        }
        built.validate()?;
        Ok(built)
    }

    fn validate(&self) -> Result<()> {
        let msg = &self.message;
        if msg.min_priority > msg.max_priority {
            return Err(RabbitMQError::InvalidConfig(format!(
                "min priority {} is greater than max priority {}",
                msg.min_priority, msg.max_priority
            )));
        }
        if msg.max_priority > MAX_MESSAGE_PRIORITY {
            return Err(RabbitMQError::InvalidConfig(format!(
                "max priority {} exceeds {}",
                msg.max_priority, MAX_MESSAGE_PRIORITY
            )));
        }
        if self.handlers_amount == 0 {
            return Err(RabbitMQError::InvalidConfig(
                "handlers amount must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("wait", &self.wait)
            .field("reconnect", &self.reconnect)
            .field("event_buffer", &self.event_buffer)
            .field("min_priority", &self.message.min_priority)
            .field("max_priority", &self.message.max_priority)
            .field("default_content_type", &self.message.default_content_type)
            .field("process_all_deliveries", &self.process_all_deliveries)
            .field("handlers_amount", &self.handlers_amount)
            .field("lazy_declaring", &self.lazy_declaring)
            .field("prefetch_count", &self.prefetch_count)
            .field("codecs", &self.codecs)
            .finish_non_exhaustive()
    }
}

pub type ClientOption = Box<dyn FnOnce(&mut Options) + Send>;

/// Wait up to `timeout` for a connection before publishing or subscribing.
/// A zero timeout keeps the current one.
pub fn wait_connection(should: bool, timeout: Duration) -> ClientOption {
    Box::new(move |o| {
        o.wait.enabled = should;
        if !timeout.is_zero() {
            o.wait.timeout = timeout;
        }
    })
}

pub fn reconnect_policy(policy: ReconnectPolicy) -> ClientOption {
    Box::new(move |o| o.reconnect = policy)
}

/// Size of each subscription's event channel; zero disables events.
pub fn event_chan_buffer(size: usize) -> ClientOption {
    Box::new(move |o| o.event_buffer = size)
}

/// Root cancellation for the connection, subscriptions and waits.
pub fn context(token: CancellationToken) -> ClientOption {
    Box::new(move |o| o.context = token)
}

pub fn message_id_builder<F>(builder: F) -> ClientOption
where
    F: Fn() -> String + Send + Sync + 'static,
{
    Box::new(move |o| o.message.id_builder = Arc::new(builder))
}

pub fn typer<F>(typer: F) -> ClientOption
where
    F: Fn(&str) -> String + Send + Sync + 'static,
{
    Box::new(move |o| o.message.typer = Arc::new(typer))
}

/// Reject publishes and deliveries whose priority is outside `from..=to`.
pub fn allowed_priority(from: u8, to: u8) -> ClientOption {
    Box::new(move |o| {
        o.message.min_priority = from;
        o.message.max_priority = to;
    })
}

pub fn application_id(id: impl Into<String>) -> ClientOption {
    let id = id.into();
    Box::new(move |o| o.message.application_id = id)
}

pub fn user_id(id: impl Into<String>) -> ClientOption {
    let id = id.into();
    Box::new(move |o| o.message.user_id = id)
}

pub fn debug_logger(logger: impl Logger + 'static) -> ClientOption {
    Box::new(move |o| o.log.debug = Arc::new(logger))
}

pub fn info_logger(logger: impl Logger + 'static) -> ClientOption {
    Box::new(move |o| o.log.info = Arc::new(logger))
}

pub fn warn_logger(logger: impl Logger + 'static) -> ClientOption {
    Box::new(move |o| o.log.warn = Arc::new(logger))
}

pub fn error_logger(logger: impl Logger + 'static) -> ClientOption {
    Box::new(move |o| o.log.error = Arc::new(logger))
}

/// Same logger for every level.
pub fn all_loggers(logger: impl Logger + 'static) -> ClientOption {
    Box::new(move |o| {
        let logger: Arc<dyn Logger> = Arc::new(logger);
        o.log = Loggers {
            debug: logger.clone(),
            info: logger.clone(),
            warn: logger.clone(),
            error: logger,
        };
    })
}

pub fn publish_before<F>(hook: F) -> ClientOption
where
    F: Fn(&mut Publishing) + Send + Sync + 'static,
{
    Box::new(move |o| o.message.publish_before.push(Arc::new(hook)))
}

pub fn deliver_before<F>(hook: F) -> ClientOption
where
    F: Fn(DeliveryContext, &Delivery) -> DeliveryContext + Send + Sync + 'static,
{
    Box::new(move |o| o.message.delivery_before.push(Arc::new(hook)))
}

pub fn error_before<F>(hook: F) -> ClientOption
where
    F: Fn(&Delivery, RabbitMQError) -> Option<RabbitMQError> + Send + Sync + 'static,
{
    Box::new(move |o| o.error_before.push(Arc::new(hook)))
}

/// Keep handling buffered deliveries after a subscription is stopped.
pub fn process_all_deliveries(v: bool) -> ClientOption {
    Box::new(move |o| o.process_all_deliveries = v)
}

/// Number of workers sharing one delivery stream. With more than one the
/// order of handling is not guaranteed. Zero is ignored.
pub fn handlers_amount(n: usize) -> ClientOption {
    Box::new(move |o| {
        if n > 0 {
            o.handlers_amount = n;
        }
    })
}

/// Declare each topology only once per client instead of on every publish
/// and every subscription round.
pub fn lazy_declaring(v: bool) -> ClientOption {
    Box::new(move |o| o.lazy_declaring = v)
}

/// Content type used when the value does not declare one.
pub fn default_content_type(content_type: impl Into<String>) -> ClientOption {
    let content_type = content_type.into();
    Box::new(move |o| o.message.default_content_type = content_type)
}

/// Unacknowledged deliveries per consumer; zero leaves the broker default.
pub fn prefetch_count(count: u16) -> ClientOption {
    Box::new(move |o| o.prefetch_count = count)
}

pub fn codecs(registry: CodecRegistry) -> ClientOption {
    Box::new(move |o| o.codecs = registry)
}

/// Uses the Rust type name as the message type.
pub fn common_typer(type_name: &str) -> String {
    type_name.to_string()
}

/// Random UUID v4 message ids.
pub fn common_message_id_builder() -> String {
    Uuid::new_v4().to_string()
}
