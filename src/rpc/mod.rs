//! The RPC correlation and subscription engine
//!
//! [`RpcEngine`] is the meeting point of both sides of a remote call. On the
//! requesting side it multiplexes one private reply queue per response type
//! over any number of concurrent outstanding requests, matching replies to
//! callers through correlation ids. On the responding side it declares the
//! request exchange, queue and binding for a request type and drives a
//! [`RequestHandler`] for every delivery. A recovery listener invalidates
//! all in-flight state when the broker's consumer channel is re-established,
//! so the next request rebuilds its resources against the fresh connection.
//!
//! The engine is intended to live as one instance per logical bus, shared
//! freely across tasks; its whole surface takes `&self`.

mod cancellation;
mod dispatcher;
mod error;
mod options;
mod pending;
mod recovery;
mod responder;
mod subscriptions;

pub use error::RpcError;
pub use options::{RequestOptions, ResponderOptions};
pub use responder::{RequestContext, RequestHandler, ResponderHandle, MAX_RESPONSE_NAME_BYTES};

use crate::broker::Broker;
use crate::config::BusConfig;
use crate::conventions::{
    CorrelationIdSource, DefaultConventions, DefaultTypeNames, DeliveryModeStrategy,
    RpcConventions, TypeNameSerializer, UniformDeliveryMode, UuidCorrelationIds,
};
use crate::events::{EventBus, EventStreamSubscription};
use pending::PendingRequests;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use subscriptions::ResponseSubscriptionRegistry;

/// Payload usable as a request or response body
pub trait RpcPayload: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> RpcPayload for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Typed request/response engine on top of a [`Broker`]
///
/// Construct it inside a Tokio runtime: the recovery listener captures the
/// runtime handle for detached teardown work.
pub struct RpcEngine<B: Broker> {
    broker: Arc<B>,
    config: BusConfig,
    conventions: Arc<dyn RpcConventions>,
    correlation_ids: Arc<dyn CorrelationIdSource>,
    type_names: Arc<dyn TypeNameSerializer>,
    delivery_modes: Arc<dyn DeliveryModeStrategy>,
    pending: Arc<PendingRequests>,
    subscriptions: Arc<ResponseSubscriptionRegistry>,
    recovery: Mutex<Option<EventStreamSubscription>>,
}

impl<B: Broker> RpcEngine<B> {
    /// Creates an engine with the default conventions, UUID correlation ids
    /// and a delivery mode derived from the configuration
    pub fn new(broker: Arc<B>, events: &Arc<EventBus>, config: BusConfig) -> Self {
        let persistent = config.persistent_messages;

        Self::with_components(
            broker,
            events,
            config,
            Arc::new(DefaultConventions::new()),
            Arc::new(UuidCorrelationIds),
            Arc::new(DefaultTypeNames),
            Arc::new(UniformDeliveryMode::new(persistent)),
        )
    }

    /// Creates an engine from explicitly chosen collaborators
    pub fn with_components(
        broker: Arc<B>,
        events: &Arc<EventBus>,
        config: BusConfig,
        conventions: Arc<dyn RpcConventions>,
        correlation_ids: Arc<dyn CorrelationIdSource>,
        type_names: Arc<dyn TypeNameSerializer>,
        delivery_modes: Arc<dyn DeliveryModeStrategy>,
    ) -> Self {
        let pending = Arc::new(PendingRequests::new());
        let subscriptions = Arc::new(ResponseSubscriptionRegistry::new());
        let recovery =
            recovery::register(events, Arc::clone(&pending), Arc::clone(&subscriptions));

        Self {
            broker,
            config,
            conventions,
            correlation_ids,
            type_names,
            delivery_modes,
            pending,
            subscriptions,
            recovery: Mutex::new(Some(recovery)),
        }
    }

    /// Tears the engine down
    ///
    /// Outstanding requests fail with a lost-connection error and every
    /// cached reply subscription is closed. The recovery listener is
    /// released first so a concurrent recovery event cannot race the
    /// teardown.
    pub async fn shutdown(&self) {
        drop(self.recovery.lock().unwrap().take());

        for request in self.pending.snapshot_and_clear() {
            request.fail();
        }
        for subscription in self.subscriptions.snapshot_and_clear() {
            subscription.close().await;
        }
    }
}

#[cfg(test)]
mod tests;
