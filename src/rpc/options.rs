//! Per-call configuration applied through the `configure` callbacks

use crate::broker::HeaderValue;
use std::collections::HashMap;
use std::time::Duration;

/// Queue argument key carrying the queue type
const QUEUE_TYPE_ARGUMENT: &str = "x-queue-type";

/// Adjustable settings of a single outgoing request
///
/// Seeded with the bus-wide defaults and the naming conventions before the
/// caller's configuration callback runs.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub(super) routing_key: String,
    pub(super) expiration: Option<Duration>,
    pub(super) priority: u8,
    pub(super) headers: HashMap<String, HeaderValue>,
    pub(super) mandatory: bool,
    pub(super) publisher_confirms: bool,
}

impl RequestOptions {
    pub(super) fn new(routing_key: String, expiration: Option<Duration>) -> Self {
        Self {
            routing_key,
            expiration,
            priority: 0,
            headers: HashMap::new(),
            mandatory: false,
            publisher_confirms: false,
        }
    }

    /// Overrides the routing key derived from the request type
    pub fn routing_key(&mut self, routing_key: impl Into<String>) -> &mut Self {
        self.routing_key = routing_key.into();
        self
    }

    /// Overrides the bus-wide request timeout; `None` waits indefinitely
    pub fn expiration(&mut self, expiration: Option<Duration>) -> &mut Self {
        self.expiration = expiration;
        self
    }

    /// Sets the message priority
    pub fn priority(&mut self, priority: u8) -> &mut Self {
        self.priority = priority;
        self
    }

    /// Attaches an application header to the request
    pub fn header(&mut self, key: impl Into<String>, value: HeaderValue) -> &mut Self {
        self.headers.insert(key.into(), value);
        self
    }

    /// Flags unroutable delivery as an error on the broker side
    pub fn mandatory(&mut self, mandatory: bool) -> &mut Self {
        self.mandatory = mandatory;
        self
    }

    /// Requests a publisher confirm for the outgoing message
    pub fn publisher_confirms(&mut self, publisher_confirms: bool) -> &mut Self {
        self.publisher_confirms = publisher_confirms;
        self
    }
}

/// Adjustable settings of a responder registration
///
/// Seeded with the bus prefetch count and the queue-type convention of the
/// request type before the configuration callback runs.
#[derive(Debug, Clone)]
pub struct ResponderOptions {
    pub(super) queue_name: Option<String>,
    pub(super) durable: bool,
    pub(super) prefetch_count: u16,
    pub(super) arguments: HashMap<String, String>,
}

impl ResponderOptions {
    pub(super) fn new(prefetch_count: u16, queue_type: Option<String>) -> Self {
        let mut arguments = HashMap::new();
        if let Some(queue_type) = queue_type {
            arguments.insert(QUEUE_TYPE_ARGUMENT.to_owned(), queue_type);
        }

        Self {
            queue_name: None,
            durable: true,
            prefetch_count,
            arguments,
        }
    }

    /// Overrides the request queue name derived from the request type
    pub fn queue_name(&mut self, queue_name: impl Into<String>) -> &mut Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    /// Controls whether the request queue survives a broker restart
    pub fn durable(&mut self, durable: bool) -> &mut Self {
        self.durable = durable;
        self
    }

    /// Overrides the number of concurrently processed deliveries; zero lifts
    /// the limit
    pub fn prefetch_count(&mut self, prefetch_count: u16) -> &mut Self {
        self.prefetch_count = prefetch_count;
        self
    }

    /// Adds a queue argument to the request queue declaration
    pub fn argument(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.arguments.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn seed_queue_type_into_arguments() {
        let options = ResponderOptions::new(50, Some("quorum".into()));

        assert_eq!(
            options.arguments.get(QUEUE_TYPE_ARGUMENT),
            Some(&"quorum".to_owned())
        );
    }

    #[test]
    fn chain_request_mutators() {
        let mut options = RequestOptions::new("key".into(), None);
        options
            .routing_key("elsewhere")
            .priority(7)
            .mandatory(true)
            .header("tag", HeaderValue::Text("value".into()));

        assert_eq!(options.routing_key, "elsewhere");
        assert_eq!(options.priority, 7);
        assert!(options.mandatory);
        assert_eq!(options.headers.len(), 1);
    }
}
