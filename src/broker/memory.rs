//! In-process [`Broker`] implementation
//!
//! Routes messages between exchanges and queues entirely in memory. Besides
//! backing local development it keeps an account of every declaration,
//! consumer registration and publish, which the test suites use to observe
//! broker-side effects.

use super::{
    ActiveConsumer, Broker, ConsumeOptions, ConsumerHandle, DeclaredQueue, Delivery, ExchangeKind,
    QueueOptions, RawMessage, DEFAULT_EXCHANGE,
};
use crate::{BoxedError, EmptyResult};
use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;
use log::trace;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Errors reported by the in-memory broker
#[derive(Debug, Error)]
pub enum MemoryBrokerError {
    /// Publish or bind referenced an exchange that was never declared
    #[error("exchange {0:?} has not been declared")]
    UnknownExchange(String),
    /// Bind or consume referenced a queue that was never declared
    #[error("queue {0:?} has not been declared")]
    UnknownQueue(String),
}

/// One publish as the broker saw it
#[derive(Debug, Clone)]
pub struct PublishRecord {
    /// Target exchange
    pub exchange: String,
    /// Routing key the message was published under
    pub routing_key: String,
    /// Whether unroutable delivery was flagged as an error
    pub mandatory: bool,
    /// Whether a publisher confirm was requested
    pub confirm: bool,
    /// The message itself
    pub message: RawMessage,
}

struct ExchangeRecord {
    kind: ExchangeKind,
    bindings: Vec<Binding>,
}

struct Binding {
    queue: String,
    routing_key: String,
}

struct QueueRecord {
    backlog: VecDeque<Delivery>,
    consumers: Vec<mpsc::UnboundedSender<Delivery>>,
    next_consumer: usize,
}

impl QueueRecord {
    fn new() -> Self {
        Self {
            backlog: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
        }
    }

    /// Hands the delivery to one live consumer, or parks it until one attaches
    fn deliver(&mut self, delivery: Delivery) {
        self.consumers.retain(|consumer| !consumer.is_closed());

        if self.consumers.is_empty() {
            self.backlog.push_back(delivery);
            return;
        }

        self.next_consumer %= self.consumers.len();
        // Unbounded send only fails when the receiver is gone, which retain ruled out
        let _ = self.consumers[self.next_consumer].send(delivery);
        self.next_consumer += 1;
    }
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeRecord>,
    queues: HashMap<String, QueueRecord>,
}

/// In-memory broker with full declaration, consume and publish accounting
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    declared_queues: Mutex<Vec<String>>,
    exchange_declarations: AtomicUsize,
    consumer_starts: AtomicUsize,
    published: Mutex<Vec<PublishRecord>>,
    generated_names: AtomicUsize,
}

impl MemoryBroker {
    /// Creates an empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of all queue declarations in order, including repeats
    pub fn declared_queue_names(&self) -> Vec<String> {
        self.declared_queues.lock().unwrap().clone()
    }

    /// Total number of queue declarations
    pub fn queue_declaration_count(&self) -> usize {
        self.declared_queues.lock().unwrap().len()
    }

    /// Total number of exchange declarations
    pub fn exchange_declaration_count(&self) -> usize {
        self.exchange_declarations.load(Ordering::SeqCst)
    }

    /// Total number of consumer registrations
    pub fn consumer_count(&self) -> usize {
        self.consumer_starts.load(Ordering::SeqCst)
    }

    /// Every publish the broker accepted, in order
    pub fn published(&self) -> Vec<PublishRecord> {
        self.published.lock().unwrap().clone()
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, MemoryBrokerError> {
        let state = self.state.lock().unwrap();

        if exchange == DEFAULT_EXCHANGE {
            // Every queue is implicitly bound to the default exchange by name
            return Ok(state
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_owned())
                .into_iter()
                .collect());
        }

        let record = state
            .exchanges
            .get(exchange)
            .ok_or_else(|| MemoryBrokerError::UnknownExchange(exchange.to_owned()))?;

        let targets = record
            .bindings
            .iter()
            .filter(|binding| match record.kind {
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
            })
            .map(|binding| binding.queue.clone())
            .collect();

        Ok(targets)
    }
}

/// Matches a topic binding pattern against a routing key
///
/// `*` stands for exactly one dot-separated segment, `#` for zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(segment), Some(actual)) if segment == actual => {
                matches(&pattern[1..], &key[1..])
            }
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();

    matches(&pattern, &key)
}

struct MemoryConsumer {
    cancellation: CancellationToken,
}

#[async_trait]
impl ConsumerHandle for MemoryConsumer {
    async fn cancel(&self) -> EmptyResult {
        self.cancellation.cancel();
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        _durable: bool,
    ) -> Result<(), BoxedError> {
        self.exchange_declarations.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock().unwrap();
        state.exchanges.entry(name.to_owned()).or_insert_with(|| {
            trace!("declaring exchange {}", name);
            ExchangeRecord {
                kind,
                bindings: Vec::new(),
            }
        });

        Ok(())
    }

    async fn declare_queue(&self, options: &QueueOptions) -> Result<DeclaredQueue, BoxedError> {
        let name = options.name.clone().unwrap_or_else(|| {
            let ordinal = self.generated_names.fetch_add(1, Ordering::SeqCst);
            format!("srv.gen-{}", ordinal)
        });

        self.declared_queues.lock().unwrap().push(name.clone());

        let mut state = self.state.lock().unwrap();
        match state.queues.entry(name.clone()) {
            Entry::Occupied(mut existing) => {
                // An exclusive queue died with the connection that owned it;
                // declaring it again yields a brand-new instance
                if options.exclusive {
                    *existing.get_mut() = QueueRecord::new();
                }
            }
            Entry::Vacant(vacant) => {
                trace!("declaring queue {}", name);
                vacant.insert(QueueRecord::new());
            }
        }

        Ok(DeclaredQueue { name })
    }

    async fn bind_queue(
        &self,
        exchange: &str,
        queue: &str,
        routing_key: &str,
    ) -> Result<(), BoxedError> {
        let mut state = self.state.lock().unwrap();

        if !state.queues.contains_key(queue) {
            return Err(MemoryBrokerError::UnknownQueue(queue.to_owned()).into());
        }

        let record = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| MemoryBrokerError::UnknownExchange(exchange.to_owned()))?;

        let exists = record
            .bindings
            .iter()
            .any(|binding| binding.queue == queue && binding.routing_key == routing_key);

        if !exists {
            record.bindings.push(Binding {
                queue: queue.to_owned(),
                routing_key: routing_key.to_owned(),
            });
        }

        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        confirm: bool,
        message: RawMessage,
    ) -> Result<(), BoxedError> {
        self.published.lock().unwrap().push(PublishRecord {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            mandatory,
            confirm,
            message: message.clone(),
        });

        let targets = self.route(exchange, routing_key)?;
        trace!(
            "publish to {:?} with key {:?} reaches {} queue(s)",
            exchange,
            routing_key,
            targets.len()
        );

        let mut state = self.state.lock().unwrap();
        for target in targets {
            if let Some(queue) = state.queues.get_mut(&target) {
                queue.deliver(Delivery {
                    routing_key: routing_key.to_owned(),
                    message: message.clone(),
                });
            }
        }

        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _options: ConsumeOptions,
    ) -> Result<ActiveConsumer, BoxedError> {
        let (sender, receiver) = mpsc::unbounded_channel();

        {
            let mut state = self.state.lock().unwrap();
            let record = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| MemoryBrokerError::UnknownQueue(queue.to_owned()))?;

            while let Some(parked) = record.backlog.pop_front() {
                let _ = sender.send(parked);
            }
            record.consumers.push(sender);
        }

        self.consumer_starts.fetch_add(1, Ordering::SeqCst);

        let cancellation = CancellationToken::new();
        let deliveries = stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        })
        .take_until(cancellation.clone().cancelled_owned())
        .boxed();

        Ok(ActiveConsumer {
            handle: Box::new(MemoryConsumer { cancellation }),
            deliveries,
        })
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::broker::MessageProperties;
    use pretty_assertions::assert_eq;

    fn text_message(text: &str) -> RawMessage {
        RawMessage {
            properties: MessageProperties::default(),
            payload: text.as_bytes().to_vec(),
        }
    }

    fn named(name: &str) -> QueueOptions {
        QueueOptions {
            name: Some(name.into()),
            ..QueueOptions::default()
        }
    }

    #[tokio::test]
    async fn route_through_direct_bindings() {
        let broker = MemoryBroker::new();
        broker
            .declare_exchange("orders", ExchangeKind::Direct, true)
            .await
            .unwrap();
        broker.declare_queue(&named("inbox")).await.unwrap();
        broker.bind_queue("orders", "inbox", "create").await.unwrap();

        let mut consumer = broker
            .consume("inbox", ConsumeOptions::default())
            .await
            .unwrap();

        broker
            .publish("orders", "create", false, false, text_message("a"))
            .await
            .unwrap();
        broker
            .publish("orders", "delete", false, false, text_message("b"))
            .await
            .unwrap();

        let delivery = consumer.deliveries.next().await.unwrap();
        assert_eq!(delivery.message.payload, b"a".to_vec());
        assert_eq!(broker.published().len(), 2);
    }

    #[tokio::test]
    async fn route_default_exchange_by_queue_name() {
        let broker = MemoryBroker::new();
        broker.declare_queue(&named("replies")).await.unwrap();

        let mut consumer = broker
            .consume("replies", ConsumeOptions::default())
            .await
            .unwrap();

        broker
            .publish(DEFAULT_EXCHANGE, "replies", false, false, text_message("x"))
            .await
            .unwrap();

        let delivery = consumer.deliveries.next().await.unwrap();
        assert_eq!(delivery.message.payload, b"x".to_vec());
    }

    #[tokio::test]
    async fn park_messages_until_a_consumer_attaches() {
        let broker = MemoryBroker::new();
        broker.declare_queue(&named("later")).await.unwrap();

        broker
            .publish(DEFAULT_EXCHANGE, "later", false, false, text_message("early"))
            .await
            .unwrap();

        let mut consumer = broker
            .consume("later", ConsumeOptions::default())
            .await
            .unwrap();

        let delivery = consumer.deliveries.next().await.unwrap();
        assert_eq!(delivery.message.payload, b"early".to_vec());
    }

    #[tokio::test]
    async fn assign_server_names_when_asked() {
        let broker = MemoryBroker::new();

        let first = broker
            .declare_queue(&QueueOptions::default())
            .await
            .unwrap();
        let second = broker
            .declare_queue(&QueueOptions::default())
            .await
            .unwrap();

        assert_eq!(first.name, "srv.gen-0");
        assert_eq!(second.name, "srv.gen-1");
    }

    #[tokio::test]
    async fn end_the_stream_on_cancel() {
        let broker = MemoryBroker::new();
        broker.declare_queue(&named("stop")).await.unwrap();

        let mut consumer = broker
            .consume("stop", ConsumeOptions::default())
            .await
            .unwrap();

        consumer.handle.cancel().await.unwrap();
        assert_eq!(consumer.deliveries.next().await.map(|d| d.routing_key), None);
    }

    #[tokio::test]
    async fn reject_unknown_exchanges() {
        let broker = MemoryBroker::new();

        let result = broker
            .publish("missing", "key", false, false, text_message("?"))
            .await;

        assert!(result.is_err());
    }

    #[test]
    fn match_topic_patterns() {
        assert!(topic_matches("a.b.c", "a.b.c"));
        assert!(topic_matches("a.*.c", "a.b.c"));
        assert!(topic_matches("a.#", "a.b.c"));
        assert!(topic_matches("#", "a.b.c"));
        assert!(topic_matches("a.#.c", "a.c"));
        assert!(!topic_matches("a.*.c", "a.c"));
        assert!(!topic_matches("a.b", "a.b.c"));
    }
}
