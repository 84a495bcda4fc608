//! Resilient AMQP 0-9-1 client on top of lapin.
//!
//! A [`Client`] owns a [`ConnectionManager`] that keeps redialing the broker
//! in the background, a publish pipeline (codecs, priority gate, hooks) and
//! subscriptions fanned out to a pool of handler workers.

pub mod env;
pub mod rabbitmq;

pub use rabbitmq::options;
pub use rabbitmq::{
    Client, ConnectionManager, ConnectionState, DeliveryContext, Event, Exchange, Queue,
    RabbitMQError, ReconnectPolicy, Result, Subscription, SubscriptionHandle,
};
