//! Contract of the underlying message broker
//!
//! The RPC engine never talks wire protocol; it declares its needs against
//! the [`Broker`] trait and consumes deliveries as a stream. Any client that
//! can declare exchanges and queues, bind them, publish with per-message
//! properties and push deliveries to a consumer can back the engine. The
//! [`memory`] module provides a complete in-process implementation.

mod message;

pub mod memory;

pub use message::*;

use crate::BoxedError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;

/// Name of the broker's default exchange
///
/// Every queue is implicitly bound to the default exchange under its own
/// name, so publishing to it with a queue name as routing key reaches that
/// queue without any declared binding.
pub const DEFAULT_EXCHANGE: &str = "";

/// Routing behaviour of an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Deliver to queues whose binding key equals the routing key
    Direct,
    /// Deliver to every bound queue
    Fanout,
    /// Deliver to queues whose binding pattern matches the routing key
    Topic,
}

/// Parameters of a queue declaration
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    /// Requested queue name; `None` asks the broker to assign one
    pub name: Option<String>,
    /// Whether the queue survives a broker restart
    pub durable: bool,
    /// Whether the queue is restricted to the declaring connection and
    /// removed with it
    pub exclusive: bool,
    /// Whether the broker deletes the queue once its last consumer is gone
    pub auto_delete: bool,
    /// Additional queue arguments, e.g. the queue type
    pub arguments: HashMap<String, String>,
}

/// Outcome of a queue declaration
#[derive(Debug, Clone)]
pub struct DeclaredQueue {
    /// Effective queue name; the server-assigned one when none was requested
    pub name: String,
}

/// Parameters of a consumer registration
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsumeOptions {
    /// Number of deliveries the broker pushes without acknowledgement;
    /// `None` leaves the channel default in place
    pub prefetch: Option<u16>,
}

/// Control handle of a registered consumer
#[async_trait]
pub trait ConsumerHandle: Send + Sync {
    /// Stops delivery to this consumer without touching the queue
    async fn cancel(&self) -> crate::EmptyResult;
}

/// A running consumer: its control handle and the stream of deliveries
pub struct ActiveConsumer {
    /// Handle that cancels the consumer
    pub handle: Box<dyn ConsumerHandle>,
    /// Push-based stream of deliveries; ends when the consumer is cancelled
    pub deliveries: BoxStream<'static, Delivery>,
}

/// Client-side view of an AMQP-like broker
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Declares an exchange, idempotently
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BoxedError>;

    /// Declares a queue, idempotently, and reports its effective name
    async fn declare_queue(&self, options: &QueueOptions) -> Result<DeclaredQueue, BoxedError>;

    /// Binds a queue to an exchange under a routing key
    async fn bind_queue(
        &self,
        exchange: &str,
        queue: &str,
        routing_key: &str,
    ) -> Result<(), BoxedError>;

    /// Publishes a message to an exchange under a routing key
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        confirm: bool,
        message: RawMessage,
    ) -> Result<(), BoxedError>;

    /// Registers a push-based consumer on a queue
    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<ActiveConsumer, BoxedError>;
}
