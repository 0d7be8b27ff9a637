//! Typed request/response messaging over an AMQP-like broker
//!
//! This library crate implements an RPC layer on top of a message broker that
//! speaks in exchanges, queues, bindings and per-message properties. Callers
//! send a typed request and await a typed response; responders bind a handler
//! for a request type and have replies routed back to the requesting process.
//!
//! The two sides meet in the [`rpc::RpcEngine`]: it multiplexes one private
//! reply queue per response type over any number of concurrent outstanding
//! requests using correlation ids, lazily declares the broker resources each
//! request type needs, and invalidates all in-flight state when the broker
//! connection is re-established after a loss.
//!
//! Everything the engine needs from the outside world is a trait: the broker
//! client ([`broker::Broker`]), the naming conventions
//! ([`conventions::RpcConventions`]), the correlation-id source and the event
//! bus carrying connection-recovery notifications. An in-process broker
//! implementation ([`broker::memory::MemoryBroker`]) is included for tests
//! and local development.

#![deny(missing_docs)]

pub mod broker;
pub mod config;
pub mod conventions;
pub mod events;
pub mod rpc;

/// Generic error type
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result with no value and a [`BoxedError`]
pub type EmptyResult = Result<(), BoxedError>;
