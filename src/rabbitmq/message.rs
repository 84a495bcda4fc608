// src/rabbitmq/message.rs
// Turning values into wire-ready envelopes, and deliveries back into values.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;

use super::codecs::{sniff_content_type, CodecRegistry};
use super::errors::{CodecError, RabbitMQError, Result};
use super::options::MessageOptions;
use super::transport::Delivery;

/// Implemented by values that know which codec should encode them.
pub trait ContentTyper {
    fn content_type(&self) -> &str;
}

/// Pairs any serializable value with an explicit content type.
#[derive(Debug, Clone, PartialEq)]
pub struct WithContentType<T> {
    pub content_type: String,
    pub value: T,
}

impl<T> WithContentType<T> {
    pub fn new(content_type: impl Into<String>, value: T) -> Self {
        Self {
            content_type: content_type.into(),
            value,
        }
    }
}

impl<T> ContentTyper for WithContentType<T> {
    fn content_type(&self) -> &str {
        &self.content_type
    }
}

impl<T: Serialize> Serialize for WithContentType<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.value.serialize(serializer)
    }
}

/// The envelope handed to the transport on publish.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Publishing {
    pub timestamp: DateTime<Utc>,
    pub priority: u8,
    pub content_type: String,
    pub body: Vec<u8>,
    pub app_id: String,
    pub user_id: String,
    pub message_id: String,
    pub kind: String,
    pub headers: BTreeMap<String, String>,
}

/// Builds a publishing for `value`: stamps time and priority, resolves the
/// content type and encodes the body.
///
/// Resolution order is `declared`, then `default_content_type`, then a sniff
/// of the (still empty) body. A content type without a registered codec is a
/// [`RabbitMQError::CodecNotFound`] and no body is produced.
pub fn construct_publishing<T>(
    codecs: &CodecRegistry,
    value: &T,
    declared: Option<&str>,
    priority: u8,
    default_content_type: &str,
) -> Result<Publishing>
where
    T: Serialize + ?Sized,
{
    let mut msg = Publishing {
        timestamp: Utc::now(),
        priority,
        ..Publishing::default()
    };

    msg.content_type = match declared {
        Some(ct) if !ct.is_empty() => ct.to_string(),
        _ if !default_content_type.is_empty() => default_content_type.to_string(),
        _ => sniff_content_type(&msg.body).to_string(),
    };

    let codec = codecs
        .get(&msg.content_type)
        .ok_or_else(|| RabbitMQError::CodecNotFound(msg.content_type.clone()))?;

    let value = serde_json::to_value(value)
        .map_err(|e| RabbitMQError::EncodeError(CodecError::Serde(e)))?;
    msg.body = codec.encode(&value).map_err(RabbitMQError::EncodeError)?;

    Ok(msg)
}

/// Full publish-side pipeline: priority gate, construction, id/type stamping
/// and the publish-before hook chain.
pub fn build_publishing<T>(
    options: &MessageOptions,
    codecs: &CodecRegistry,
    value: &T,
    declared: Option<&str>,
    priority: u8,
) -> Result<Publishing>
where
    T: Serialize + ?Sized,
{
    options.check_priority(priority)?;

    let mut msg = construct_publishing(
        codecs,
        value,
        declared,
        priority,
        &options.default_content_type,
    )?;

    msg.message_id = (options.id_builder)();
    msg.kind = (options.typer)(std::any::type_name::<T>());
    msg.app_id = options.application_id.clone();
    msg.user_id = options.user_id.clone();

    for hook in &options.publish_before {
        hook(&mut msg);
    }

    Ok(msg)
}

/// Decodes a delivery body with the codec for its content type, falling back
/// to `default_content_type` when the delivery carries none.
pub fn decode_delivery<T>(
    codecs: &CodecRegistry,
    delivery: &Delivery,
    default_content_type: &str,
) -> Result<T>
where
    T: DeserializeOwned,
{
    let content_type = delivery
        .content_type
        .as_deref()
        .filter(|ct| !ct.is_empty())
        .unwrap_or(default_content_type);
    let content_type = if content_type.is_empty() {
        sniff_content_type(&delivery.body)
    } else {
        content_type
    };

    let codec = codecs
        .get(content_type)
        .ok_or_else(|| RabbitMQError::CodecNotFound(content_type.to_string()))?;

    let value = codec.decode(&delivery.body).map_err(RabbitMQError::DecodeError)?;
    serde_json::from_value(value).map_err(|e| RabbitMQError::DecodeError(CodecError::Serde(e)))
}
