//! Lazily created reply subscriptions, one per request/response type pair

use super::{RpcEngine, RpcError, RpcPayload};
use crate::broker::{Broker, ConsumerHandle, ExchangeKind, QueueOptions, DEFAULT_EXCHANGE};
use crate::conventions::MessageType;
use dashmap::DashMap;
use futures::StreamExt;
use log::{debug, warn};
use std::any::TypeId;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Identity of a subscription slot
///
/// Keyed by the request/response type *pair*: two request types sharing a
/// response type each hold their own reply queue and consumer. That spends a
/// few extra broker resources but ties every subscription's lifetime to the
/// exact call pair that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct RpcKey {
    request: TypeId,
    response: TypeId,
}

impl RpcKey {
    pub fn of<TReq: 'static, TRes: 'static>() -> Self {
        Self {
            request: TypeId::of::<TReq>(),
            response: TypeId::of::<TRes>(),
        }
    }
}

/// A live reply subscription: the queue, its consumer and the dispatch task
pub(crate) struct ResponseSubscription {
    pub queue: String,
    consumer: Box<dyn ConsumerHandle>,
    dispatch: JoinHandle<()>,
}

impl ResponseSubscription {
    /// Stops dispatching and cancels the consumer
    pub async fn close(self) {
        self.dispatch.abort();
        if let Err(error) = self.consumer.cancel().await {
            warn!("failed to cancel reply consumer for {}: {}", self.queue, error);
        }
    }

    /// Like [`close`](Self::close), but usable from synchronous callers on
    /// foreign threads: dispatching stops immediately, only the broker-side
    /// consumer cancellation is detached onto the runtime
    pub fn close_detached(self, runtime: &Handle) {
        self.dispatch.abort();

        let consumer = self.consumer;
        let queue = self.queue;
        runtime.spawn(async move {
            if let Err(error) = consumer.cancel().await {
                warn!("failed to cancel reply consumer for {}: {}", queue, error);
            }
        });
    }
}

/// Cache of reply subscriptions with creation serialized by one async mutex
///
/// Lookup is lock-free; only the slow path that declares broker resources
/// takes the mutex, and never more than one creation runs at a time.
#[derive(Default)]
pub(crate) struct ResponseSubscriptionRegistry {
    entries: DashMap<RpcKey, ResponseSubscription>,
    creation: Mutex<()>,
}

impl ResponseSubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply queue name of a cached subscription
    pub fn queue_for(&self, key: &RpcKey) -> Option<String> {
        self.entries.get(key).map(|entry| entry.queue.clone())
    }

    pub fn insert(&self, key: RpcKey, subscription: ResponseSubscription) {
        self.entries.insert(key, subscription);
    }

    /// Drains the registry, returning every subscription for teardown
    pub fn snapshot_and_clear(&self) -> Vec<ResponseSubscription> {
        let keys: Vec<RpcKey> = self.entries.iter().map(|entry| *entry.key()).collect();

        keys.iter()
            .filter_map(|key| self.entries.remove(key).map(|(_, subscription)| subscription))
            .collect()
    }

    /// Number of cached subscriptions
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry holds no subscriptions
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<B: Broker> RpcEngine<B> {
    /// Returns the reply queue for the `(TReq, TRes)` pair, creating queue,
    /// binding and consumer on first use
    ///
    /// Creation is double-checked around the registry's mutex so concurrent
    /// requests of the same pair declare at most one queue and start at most
    /// one consumer. The mutex is released before the caller publishes.
    pub(super) async fn ensure_reply_queue<TReq, TRes>(
        &self,
        cancellation: &CancellationToken,
    ) -> Result<String, RpcError>
    where
        TReq: RpcPayload,
        TRes: RpcPayload,
    {
        let key = RpcKey::of::<TReq, TRes>();

        if let Some(queue) = self.subscriptions.queue_for(&key) {
            return Ok(queue);
        }

        let _creation = tokio::select! {
            guard = self.subscriptions.creation.lock() => guard,
            _ = cancellation.cancelled() => return Err(RpcError::Cancelled),
        };

        // Another request may have won the race while we waited for the lock
        if let Some(queue) = self.subscriptions.queue_for(&key) {
            return Ok(queue);
        }

        let response_type = MessageType::of::<TRes>();
        let conventional_name = self.conventions.rpc_return_queue(&response_type);

        // Exclusive and auto-delete so the broker reclaims the queue when the
        // consumer channel goes away; recovery rebuilds the registry entry
        let declared = self
            .broker
            .declare_queue(&QueueOptions {
                name: (!conventional_name.is_empty()).then_some(conventional_name),
                durable: false,
                exclusive: true,
                auto_delete: true,
                arguments: Default::default(),
            })
            .await
            .map_err(RpcError::Broker)?;
        let queue = declared.name;

        let reply_exchange = self.conventions.rpc_response_exchange(&response_type);
        if reply_exchange != DEFAULT_EXCHANGE {
            self.broker
                .declare_exchange(&reply_exchange, ExchangeKind::Direct, true)
                .await
                .map_err(RpcError::Broker)?;
            self.broker
                .bind_queue(&reply_exchange, &queue, &queue)
                .await
                .map_err(RpcError::Broker)?;
        }

        let consumer = self
            .broker
            .consume(&queue, Default::default())
            .await
            .map_err(RpcError::Broker)?;

        let pending = Arc::clone(&self.pending);
        let mut deliveries = consumer.deliveries;
        let dispatch = tokio::spawn(async move {
            while let Some(delivery) = deliveries.next().await {
                let correlation_id = match delivery.message.properties.correlation_id.clone() {
                    Some(correlation_id) => correlation_id,
                    None => {
                        warn!("discarding reply without a correlation id");
                        continue;
                    }
                };

                match pending.try_remove(&correlation_id) {
                    Some(action) => action.succeed(delivery),
                    // Stale reply: the request timed out, was cancelled or
                    // invalidated by recovery
                    None => debug!("dropping reply for unknown correlation id {}", correlation_id),
                }
            }
        });

        debug!(
            "reply subscription for {} consuming from {}",
            response_type.name(),
            queue
        );

        self.subscriptions.insert(
            key,
            ResponseSubscription {
                queue: queue.clone(),
                consumer: consumer.handle,
                dispatch,
            },
        );

        Ok(queue)
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn key_slots_by_the_type_pair() {
        assert_eq!(RpcKey::of::<String, u32>(), RpcKey::of::<String, u32>());
        assert_ne!(RpcKey::of::<String, u32>(), RpcKey::of::<u32, String>());
        assert_ne!(RpcKey::of::<String, u32>(), RpcKey::of::<i64, u32>());
    }
}
