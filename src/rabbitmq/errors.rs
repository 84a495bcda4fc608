// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use thiserror::Error;
use tokio::time::error::Elapsed;

/// Failures produced by a [`Codec`](super::codecs::Codec).
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("body is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("unsupported value: {0}")]
    Unsupported(String),
}

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("Not connected to RabbitMQ")]
    NotConnected,

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("Gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Connection timeout: {0}")]
    TimeoutError(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Codec not found for content type {0:?}")]
    CodecNotFound(String),

    #[error("Message encode error: {0}")]
    EncodeError(#[source] CodecError),

    #[error("Message decode error: {0}")]
    DecodeError(#[source] CodecError),

    #[error("Priority {priority} is outside the allowed range {min}..={max}")]
    PriorityOutOfRange { priority: u8, min: u8, max: u8 },

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Handler error: {0}")]
    HandlerError(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl RabbitMQError {
    /// True for errors that a later attempt may not hit again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RabbitMQError::ConnectionError(_)
                | RabbitMQError::ChannelError(_)
                | RabbitMQError::NotConnected
                | RabbitMQError::TimeoutError(_)
        )
    }

    pub(crate) fn handler(error: anyhow::Error) -> Self {
        RabbitMQError::HandlerError(error.into())
    }
}

// Converting from lapin errors
impl From<LapinError> for RabbitMQError {
    fn from(error: LapinError) -> Self {
        // Use string representation for classification
        let error_text = error.to_string();

        if error_text.contains("connection") {
            RabbitMQError::ConnectionError(error_text)
        } else if error_text.contains("channel") {
            RabbitMQError::ChannelError(error_text)
        } else if error_text.contains("publish") {
            RabbitMQError::PublishError(error_text)
        } else if error_text.contains("consume") {
            RabbitMQError::ConsumeError(error_text)
        } else if error_text.contains("ack") || error_text.contains("nack") {
            RabbitMQError::AckError(error_text)
        } else {
            RabbitMQError::Unknown(error_text)
        }
    }
}

impl From<Elapsed> for RabbitMQError {
    fn from(_: Elapsed) -> Self {
        RabbitMQError::TimeoutError("Connection timed out".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connection_level_errors_are_transient() {
        assert!(RabbitMQError::NotConnected.is_transient());
        assert!(!RabbitMQError::Unknown("boom".into()).is_transient());
        assert!(RabbitMQError::TimeoutError("x".into()).is_transient());
        assert!(!RabbitMQError::CodecNotFound("x".into()).is_transient());
    }

    #[test]
    fn handler_errors_keep_their_message() {
        let err = RabbitMQError::handler(anyhow::anyhow!("order rejected"));
        assert_eq!(err.to_string(), "Handler error: order rejected");
    }

    #[test]
    fn priority_error_names_the_range() {
        let err = RabbitMQError::PriorityOutOfRange {
            priority: 12,
            min: 0,
            max: 9,
        };
        assert_eq!(
            err.to_string(),
            "Priority 12 is outside the allowed range 0..=9"
        );
    }
}
