//! Pluggable naming and identity policies
//!
//! The engine never hardcodes a broker name: every exchange, queue and
//! routing key is derived from the payload type through [`RpcConventions`].
//! Correlation ids, delivery modes and the bounded type-name form used for
//! validation are equally pluggable. The `Default*` implementations in this
//! module are what an engine uses unless told otherwise.

use crate::broker::{DeliveryMode, DEFAULT_EXCHANGE};
use std::any::{type_name, TypeId};
use uuid::Uuid;

/// Runtime identity of a payload type
///
/// Pairs the [`TypeId`] (for map keys) with the type path (for naming).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageType {
    id: TypeId,
    name: &'static str,
}

impl MessageType {
    /// Identity of `T`
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    /// Opaque identity for map keys
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// Full type path as the compiler renders it
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Type path with `::` folded to `.` so it is usable as a broker name
    pub fn broker_name(&self) -> String {
        self.name.replace("::", ".")
    }
}

/// Mapping from payload types to the broker names the RPC layer uses
pub trait RpcConventions: Send + Sync {
    /// Exchange requests of the given type are published to
    fn rpc_request_exchange(&self, request_type: &MessageType) -> String;

    /// Routing key requests of the given type are published under; doubles
    /// as the default request queue name on the responder side
    fn rpc_routing_key(&self, request_type: &MessageType) -> String;

    /// Exchange replies of the given type are published to; the broker
    /// default exchange means replies are addressed straight to the queue
    fn rpc_response_exchange(&self, response_type: &MessageType) -> String;

    /// Name of the private reply queue for the given response type; an empty
    /// name requests a server-assigned one
    fn rpc_return_queue(&self, response_type: &MessageType) -> String;

    /// Queue type argument for request queues of the given type, if any
    fn queue_type(&self, request_type: &MessageType) -> Option<String>;
}

/// Conventions used when nothing else is configured
///
/// Request names derive from the request type path. The reply queue name
/// carries a per-instance suffix so two processes (or two engines in one
/// process) sharing a broker never consume from each other's replies.
pub struct DefaultConventions {
    instance_id: String,
}

impl DefaultConventions {
    /// Creates conventions with a fresh instance suffix
    pub fn new() -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
        }
    }
}

impl Default for DefaultConventions {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcConventions for DefaultConventions {
    fn rpc_request_exchange(&self, request_type: &MessageType) -> String {
        format!("rpc.{}", request_type.broker_name())
    }

    fn rpc_routing_key(&self, request_type: &MessageType) -> String {
        request_type.broker_name()
    }

    fn rpc_response_exchange(&self, _response_type: &MessageType) -> String {
        DEFAULT_EXCHANGE.to_owned()
    }

    fn rpc_return_queue(&self, response_type: &MessageType) -> String {
        format!("reply.{}.{}", response_type.broker_name(), self.instance_id)
    }

    fn queue_type(&self, _request_type: &MessageType) -> Option<String> {
        None
    }
}

/// Source of process-unique correlation ids
pub trait CorrelationIdSource: Send + Sync {
    /// Returns an id never handed out before within this process
    fn next_id(&self) -> String;
}

/// Correlation ids drawn from random UUIDs
#[derive(Debug, Default)]
pub struct UuidCorrelationIds;

impl CorrelationIdSource for UuidCorrelationIds {
    fn next_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Bounded-length rendering of a response type name
///
/// Replies carry the response type identity in bounded broker fields, so the
/// serialized form is validated against a 255 byte cap at responder setup.
pub trait TypeNameSerializer: Send + Sync {
    /// Serialized form of the given type's name
    fn serialize(&self, message_type: &MessageType) -> String;
}

/// Serializes type names as their broker form
#[derive(Debug, Default)]
pub struct DefaultTypeNames;

impl TypeNameSerializer for DefaultTypeNames {
    fn serialize(&self, message_type: &MessageType) -> String {
        message_type.broker_name()
    }
}

/// Chooses the delivery mode for outgoing requests of a given type
pub trait DeliveryModeStrategy: Send + Sync {
    /// Delivery mode for messages of the given type
    fn delivery_mode(&self, message_type: &MessageType) -> DeliveryMode;
}

/// Applies one configured delivery mode to every message type
#[derive(Debug)]
pub struct UniformDeliveryMode {
    persistent: bool,
}

impl UniformDeliveryMode {
    /// Persistent or non-persistent delivery for all message types
    pub fn new(persistent: bool) -> Self {
        Self { persistent }
    }
}

impl DeliveryModeStrategy for UniformDeliveryMode {
    fn delivery_mode(&self, _message_type: &MessageType) -> DeliveryMode {
        if self.persistent {
            DeliveryMode::Persistent
        } else {
            DeliveryMode::NonPersistent
        }
    }
}
