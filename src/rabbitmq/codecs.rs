// src/rabbitmq/codecs.rs
// Content-type keyed encoders/decoders.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::errors::CodecError;

pub const APPLICATION_JSON: &str = "application/json";
pub const TEXT_PLAIN: &str = "text/plain";
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Paired encode/decode strategy for one content type.
///
/// Values travel through codecs as [`serde_json::Value`], so any `Serialize`
/// type can be published and any `DeserializeOwned` type consumed, whatever
/// the wire format.
pub trait Codec: Send + Sync {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, body: &[u8]) -> Result<Value, CodecError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, body: &[u8]) -> Result<Value, CodecError> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// Plain text: strings are written as-is, other scalars by their JSON text.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextCodec;

impl Codec for TextCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        match value {
            Value::String(s) => Ok(s.as_bytes().to_vec()),
            Value::Number(_) | Value::Bool(_) => Ok(value.to_string().into_bytes()),
            Value::Null => Ok(Vec::new()),
            Value::Array(_) | Value::Object(_) => Err(CodecError::Unsupported(
                "text/plain only carries scalar values".to_string(),
            )),
        }
    }

    fn decode(&self, body: &[u8]) -> Result<Value, CodecError> {
        Ok(Value::String(std::str::from_utf8(body)?.to_string()))
    }
}

/// Immutable content-type → codec table.
///
/// Lookups ignore MIME parameters and case, so `Text/Plain; charset=utf-8`
/// resolves to the `text/plain` codec.
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn Codec>>,
}

impl CodecRegistry {
    /// A registry with no codecs at all.
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    pub fn register(mut self, content_type: &str, codec: impl Codec + 'static) -> Self {
        self.codecs
            .insert(essence(content_type), Arc::new(codec) as Arc<dyn Codec>);
        self
    }

    pub fn get(&self, content_type: &str) -> Option<Arc<dyn Codec>> {
        self.codecs.get(&essence(content_type)).cloned()
    }

    pub fn contains(&self, content_type: &str) -> bool {
        self.codecs.contains_key(&essence(content_type))
    }

    pub fn content_types(&self) -> impl Iterator<Item = &str> {
        self.codecs.keys().map(String::as_str)
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::empty()
            .register(APPLICATION_JSON, JsonCodec)
            .register(TEXT_PLAIN, TextCodec)
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&str> = self.content_types().collect();
        types.sort_unstable();
        f.debug_struct("CodecRegistry")
            .field("content_types", &types)
            .finish()
    }
}

fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Guess a content type from raw bytes.
///
/// This is a weak last resort, not schema detection: an empty body is
/// `application/octet-stream`.
pub fn sniff_content_type(body: &[u8]) -> &'static str {
    let trimmed = body
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map(|start| &body[start..]);

    match trimmed {
        None => OCTET_STREAM,
        Some(rest) if rest.starts_with(b"{") || rest.starts_with(b"[") => {
            if serde_json::from_slice::<Value>(body).is_ok() {
                APPLICATION_JSON
            } else {
                TEXT_PLAIN
            }
        }
        Some(_) if std::str::from_utf8(body).is_ok() && !body.contains(&0) => TEXT_PLAIN,
        Some(_) => OCTET_STREAM,
    }
}
