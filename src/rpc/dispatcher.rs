//! Outgoing request path

use super::cancellation::ComposedCancellation;
use super::pending::ResponseAction;
use super::{RequestOptions, RpcEngine, RpcError, RpcPayload};
use crate::broker::{
    Broker, Delivery, ExchangeKind, MessageProperties, RawMessage, UNSPECIFIED_FAULT_MESSAGE,
};
use crate::conventions::MessageType;
use log::trace;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

impl<B: Broker> RpcEngine<B> {
    /// Sends a request and awaits its typed response
    ///
    /// The configuration callback may override routing key, expiration,
    /// priority, headers and publish flags; everything else is seeded from
    /// the bus configuration and the naming conventions. The effective
    /// cancellation combines `cancellation` with the configured expiration,
    /// so a timeout surfaces as [`RpcError::Cancelled`] — callers that need
    /// to tell the two apart can inspect their own token.
    pub async fn request<TReq, TRes>(
        &self,
        request: &TReq,
        configure: impl FnOnce(&mut RequestOptions),
        cancellation: &CancellationToken,
    ) -> Result<TRes, RpcError>
    where
        TReq: RpcPayload,
        TRes: RpcPayload,
    {
        let request_type = MessageType::of::<TReq>();
        let mut options = RequestOptions::new(
            self.conventions.rpc_routing_key(&request_type),
            Some(self.config.timeout),
        );
        configure(&mut options);

        let scope = ComposedCancellation::new(cancellation, options.expiration);

        let correlation_id = self.correlation_ids.next_id();
        let (action, completion) = ResponseAction::channel();
        self.pending.register(correlation_id.clone(), action);

        let outcome = self
            .drive_request::<TReq, TRes>(request, &options, &correlation_id, completion, scope.token())
            .await;

        // The entry is gone already when a reply or recovery dispatched it;
        // this covers the cancellation and error paths
        self.pending.discard(&correlation_id);

        outcome
    }

    async fn drive_request<TReq, TRes>(
        &self,
        request: &TReq,
        options: &RequestOptions,
        correlation_id: &str,
        completion: oneshot::Receiver<Result<Delivery, RpcError>>,
        cancellation: &CancellationToken,
    ) -> Result<TRes, RpcError>
    where
        TReq: RpcPayload,
        TRes: RpcPayload,
    {
        let reply_queue = self.ensure_reply_queue::<TReq, TRes>(cancellation).await?;

        let request_type = MessageType::of::<TReq>();
        let exchange = self.conventions.rpc_request_exchange(&request_type);
        self.broker
            .declare_exchange(&exchange, ExchangeKind::Direct, true)
            .await
            .map_err(RpcError::Broker)?;

        let properties = MessageProperties {
            reply_to: Some(reply_queue),
            correlation_id: Some(correlation_id.to_owned()),
            expiration: options.expiration,
            priority: options.priority,
            delivery_mode: self.delivery_modes.delivery_mode(&request_type),
            headers: options.headers.clone(),
        };
        let payload = serde_json::to_vec(request)?;

        trace!(
            "publishing request {} to {} with correlation id {}",
            request_type.name(),
            exchange,
            correlation_id
        );
        self.broker
            .publish(
                &exchange,
                &options.routing_key,
                options.mandatory,
                options.publisher_confirms,
                RawMessage { properties, payload },
            )
            .await
            .map_err(RpcError::Broker)?;

        // An already-dispatched reply beats a concurrent cancellation
        let delivery = tokio::select! {
            biased;
            received = completion => match received {
                Ok(outcome) => outcome?,
                Err(_) => return Err(RpcError::ConnectionLost),
            },
            _ = cancellation.cancelled() => return Err(RpcError::Cancelled),
        };

        if delivery.message.properties.is_faulted() {
            let message = delivery
                .message
                .properties
                .fault_message()
                .filter(|message| !message.is_empty())
                .unwrap_or_else(|| UNSPECIFIED_FAULT_MESSAGE.to_owned());
            return Err(RpcError::ResponderFault(message));
        }

        Ok(serde_json::from_slice(&delivery.message.payload)?)
    }
}
