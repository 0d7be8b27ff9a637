//! Messages and per-message properties as the broker carries them

use std::collections::HashMap;
use std::time::Duration;

/// Header key a responder sets to `true` when its handler failed
pub const IS_FAULTED_KEY: &str = "IsFaulted";
/// Header key carrying the UTF-8 encoded failure description of a fault reply
pub const EXCEPTION_MESSAGE_KEY: &str = "ExceptionMessage";
/// Text substituted when a fault reply carries no usable failure description
pub const UNSPECIFIED_FAULT_MESSAGE: &str = "The exception message has not been specified.";

/// Durability requested for an individual message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Message survives a broker restart when its queue is durable
    Persistent,
    /// Message is kept in memory only
    NonPersistent,
}

/// Value of a single message header
///
/// Broker header tables are richer than this, but these are the variants the
/// RPC layer produces and consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    /// Boolean flag
    Bool(bool),
    /// UTF-8 text
    Text(String),
    /// Raw bytes
    Bytes(Vec<u8>),
}

/// Properties attached to a published message
#[derive(Debug, Clone)]
pub struct MessageProperties {
    /// Queue the receiver should address replies to
    pub reply_to: Option<String>,
    /// Tag the receiver echoes back so the sender can match the reply
    pub correlation_id: Option<String>,
    /// Time after which the broker may discard the undelivered message;
    /// `None` keeps it indefinitely
    pub expiration: Option<Duration>,
    /// Priority between 0 and 255
    pub priority: u8,
    /// Requested message durability
    pub delivery_mode: DeliveryMode,
    /// Application headers
    pub headers: HashMap<String, HeaderValue>,
}

impl Default for MessageProperties {
    fn default() -> Self {
        Self {
            reply_to: None,
            correlation_id: None,
            expiration: None,
            priority: 0,
            delivery_mode: DeliveryMode::NonPersistent,
            headers: HashMap::new(),
        }
    }
}

impl MessageProperties {
    /// Expiration in the broker's wire form: string milliseconds when finite
    pub fn expiration_millis(&self) -> Option<String> {
        self.expiration.map(|d| d.as_millis().to_string())
    }

    /// Whether the message declares itself a fault reply
    pub fn is_faulted(&self) -> bool {
        matches!(
            self.headers.get(IS_FAULTED_KEY),
            Some(HeaderValue::Bool(true))
        )
    }

    /// Failure description of a fault reply, if one was attached
    pub fn fault_message(&self) -> Option<String> {
        match self.headers.get(EXCEPTION_MESSAGE_KEY)? {
            HeaderValue::Bytes(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            HeaderValue::Text(text) => Some(text.clone()),
            HeaderValue::Bool(_) => None,
        }
    }
}

/// A payload and its properties, ready for publishing
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Properties travelling with the payload
    pub properties: MessageProperties,
    /// Serialized payload bytes
    pub payload: Vec<u8>,
}

/// A message as handed to a consumer, together with its routing information
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The routing key the message was published under
    pub routing_key: String,
    /// The message itself
    pub message: RawMessage,
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn format_expiration_as_string_milliseconds() {
        let mut properties = MessageProperties::default();
        assert_eq!(properties.expiration_millis(), None);

        properties.expiration = Some(Duration::from_millis(1500));
        assert_eq!(properties.expiration_millis(), Some("1500".into()));
    }

    #[test]
    fn detect_fault_replies() {
        let mut properties = MessageProperties::default();
        assert!(!properties.is_faulted());

        properties
            .headers
            .insert(IS_FAULTED_KEY.into(), HeaderValue::Bool(false));
        assert!(!properties.is_faulted());

        properties
            .headers
            .insert(IS_FAULTED_KEY.into(), HeaderValue::Bool(true));
        assert!(properties.is_faulted());
    }

    #[test]
    fn decode_fault_messages_from_bytes_and_text() {
        let mut properties = MessageProperties::default();
        assert_eq!(properties.fault_message(), None);

        properties.headers.insert(
            EXCEPTION_MESSAGE_KEY.into(),
            HeaderValue::Bytes(b"boom".to_vec()),
        );
        assert_eq!(properties.fault_message(), Some("boom".into()));

        properties.headers.insert(
            EXCEPTION_MESSAGE_KEY.into(),
            HeaderValue::Text("bang".into()),
        );
        assert_eq!(properties.fault_message(), Some("bang".into()));
    }
}
