// src/rabbitmq/mod.rs
// Resilient RabbitMQ client: connection manager, message pipeline and
// subscription dispatcher.

pub mod errors;
pub mod connection;       // Reconnecting connection manager
pub mod transport;        // Broker seam, implemented by lapin and by test doubles
pub mod lapin_transport;
pub mod codecs;
pub mod message;
pub mod options;
pub mod context;
pub mod client;
pub mod dispatcher;

// Re-export specific items to simplify imports elsewhere
pub use client::Client;
pub use codecs::{Codec, CodecRegistry, JsonCodec, TextCodec};
pub use connection::{ConnectionManager, ConnectionState, LiveChannel, ReconnectPolicy};
pub use context::DeliveryContext;
pub use dispatcher::{Event, Subscription, SubscriptionHandle};
pub use errors::{CodecError, RabbitMQError, Result};
pub use lapin_transport::{dial, dial_config, Connector, LapinTransport};
pub use message::{ContentTyper, Publishing, WithContentType};
pub use options::{ClientOption, Logger, Options};
pub use transport::{Delivery, Exchange, ExchangeKind, Queue, Topology, Transport};
