//! Responder side: hosting a handler for a request type

use super::{ResponderOptions, RpcEngine, RpcError, RpcPayload};
use crate::broker::{
    Broker, ConsumeOptions, ConsumerHandle, Delivery, DeliveryMode, ExchangeKind, HeaderValue,
    MessageProperties, QueueOptions, RawMessage, DEFAULT_EXCHANGE, EXCEPTION_MESSAGE_KEY,
    IS_FAULTED_KEY,
};
use crate::conventions::{MessageType, RpcConventions};
use crate::{BoxedError, EmptyResult};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use log::{debug, warn};
use std::any::type_name;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Longest serialized response type name the broker's header fields admit
pub const MAX_RESPONSE_NAME_BYTES: usize = 255;

/// Everything a handler receives besides the request body
pub struct RequestContext {
    /// Application headers of the request message
    pub headers: HashMap<String, HeaderValue>,
    /// Cancellation reflecting the hosting consumer's lifecycle; fires when
    /// the responder is closed or the engine shuts down
    pub cancellation: CancellationToken,
}

/// Computes a response from a request
///
/// Returning an error makes the engine publish a fault reply carrying the
/// error's description, then surface the error to the host loop. The one
/// exception is a cancellation error while [`RequestContext::cancellation`]
/// is itself cancelled: the caller observes its own cancellation, so no
/// reply is published.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Type of request to process
    type Request: RpcPayload;
    /// Type of response produced
    type Response: RpcPayload;

    /// Handler for requests, returning a response
    async fn handle(
        &self,
        request: Self::Request,
        context: RequestContext,
    ) -> Result<Self::Response, BoxedError>;
}

/// Control handle of a hosted responder
///
/// Closing stops the consumer; the request queue and exchange stay declared
/// so pending requests survive a responder restart.
pub struct ResponderHandle {
    lifecycle: CancellationToken,
    consumer: Box<dyn ConsumerHandle>,
    host: JoinHandle<()>,
}

impl ResponderHandle {
    /// Stops consuming requests
    pub async fn close(self) {
        self.lifecycle.cancel();
        if let Err(error) = self.consumer.cancel().await {
            warn!("failed to cancel request consumer: {}", error);
        }
        self.host.abort();
    }
}

impl<B: Broker> RpcEngine<B> {
    /// Declares the request resources for `H::Request` and drives `handler`
    /// for every inbound request until the returned handle is closed
    pub async fn respond<H>(
        &self,
        handler: H,
        configure: impl FnOnce(&mut ResponderOptions),
    ) -> Result<ResponderHandle, RpcError>
    where
        H: RequestHandler,
    {
        let response_type = MessageType::of::<H::Response>();
        // Replies carry the response type name in bounded broker fields, so
        // reject names that cannot travel before declaring anything
        let serialized_name = self.type_names.serialize(&response_type);
        if serialized_name.len() > MAX_RESPONSE_NAME_BYTES {
            return Err(RpcError::ResponseNameTooLong(serialized_name.len()));
        }

        let request_type = MessageType::of::<H::Request>();
        let mut options = ResponderOptions::new(
            self.config.prefetch_count,
            self.conventions.queue_type(&request_type),
        );
        configure(&mut options);

        let queue = options
            .queue_name
            .clone()
            .unwrap_or_else(|| self.conventions.rpc_routing_key(&request_type));
        let exchange = self.conventions.rpc_request_exchange(&request_type);

        self.broker
            .declare_exchange(&exchange, ExchangeKind::Direct, true)
            .await
            .map_err(RpcError::Broker)?;
        self.broker
            .declare_queue(&QueueOptions {
                name: Some(queue.clone()),
                durable: options.durable,
                exclusive: false,
                auto_delete: false,
                arguments: options.arguments.clone(),
            })
            .await
            .map_err(RpcError::Broker)?;
        self.broker
            .bind_queue(&exchange, &queue, &queue)
            .await
            .map_err(RpcError::Broker)?;

        let consumer = self
            .broker
            .consume(
                &queue,
                ConsumeOptions {
                    prefetch: Some(options.prefetch_count),
                },
            )
            .await
            .map_err(RpcError::Broker)?;

        debug!(
            "responder for {} consuming from {}",
            request_type.name(),
            queue
        );

        let lifecycle = CancellationToken::new();
        let host = tokio::spawn(host_deliveries(
            Arc::new(handler),
            Arc::clone(&self.broker),
            Arc::clone(&self.conventions),
            consumer.deliveries,
            lifecycle.clone(),
            options.prefetch_count,
        ));

        Ok(ResponderHandle {
            lifecycle,
            consumer: consumer.handle,
            host,
        })
    }
}

/// Consume loop of one responder
///
/// Failures of individual deliveries are logged and do not stop the loop;
/// the fault reply has been published by then (see [`handle_message`]).
async fn host_deliveries<H, B>(
    handler: Arc<H>,
    broker: Arc<B>,
    conventions: Arc<dyn RpcConventions>,
    deliveries: BoxStream<'static, Delivery>,
    lifecycle: CancellationToken,
    prefetch: u16,
) where
    H: RequestHandler,
    B: Broker,
{
    let concurrency = (prefetch > 0).then_some(prefetch as usize);

    deliveries
        .take_until(lifecycle.clone().cancelled_owned())
        .for_each_concurrent(concurrency, |delivery| {
            let handler = Arc::clone(&handler);
            let broker = Arc::clone(&broker);
            let conventions = Arc::clone(&conventions);
            let lifecycle = lifecycle.clone();

            async move {
                if let Err(error) =
                    handle_message(&*handler, &*broker, &*conventions, delivery, &lifecycle).await
                {
                    warn!(
                        "failed to process {}: {}",
                        type_name::<H::Request>(),
                        error
                    );
                }
            }
        })
        .await;
}

/// Processes one inbound request: invoke the handler, then publish either
/// the response or a fault reply to the caller's reply queue
async fn handle_message<H, B>(
    handler: &H,
    broker: &B,
    conventions: &dyn RpcConventions,
    delivery: Delivery,
    lifecycle: &CancellationToken,
) -> EmptyResult
where
    H: RequestHandler,
    B: Broker,
{
    let properties = &delivery.message.properties;
    let (reply_to, correlation_id) = match (&properties.reply_to, &properties.correlation_id) {
        (Some(reply_to), Some(correlation_id)) => (reply_to.clone(), correlation_id.clone()),
        _ => {
            warn!("discarding request without reply-to or correlation id");
            return Ok(());
        }
    };

    let response_type = MessageType::of::<H::Response>();
    let reply_exchange = conventions.rpc_response_exchange(&response_type);
    if reply_exchange != DEFAULT_EXCHANGE {
        broker
            .declare_exchange(&reply_exchange, ExchangeKind::Direct, true)
            .await?;
    }

    let request: H::Request = serde_json::from_slice(&delivery.message.payload)?;
    let context = RequestContext {
        headers: properties.headers.clone(),
        cancellation: lifecycle.clone(),
    };

    match handler.handle(request, context).await {
        Ok(response) => {
            let message = RawMessage {
                properties: MessageProperties {
                    correlation_id: Some(correlation_id),
                    delivery_mode: DeliveryMode::NonPersistent,
                    ..Default::default()
                },
                payload: serde_json::to_vec(&response)?,
            };

            broker
                .publish(&reply_exchange, &reply_to, false, false, message)
                .await?;
            Ok(())
        }
        Err(error) => {
            // The caller observes its own cancellation; a reply would be
            // addressed to a consumer that is already gone
            if lifecycle.is_cancelled() && is_cancellation(&error) {
                return Err(error);
            }

            let mut headers = HashMap::new();
            headers.insert(IS_FAULTED_KEY.to_owned(), HeaderValue::Bool(true));
            headers.insert(
                EXCEPTION_MESSAGE_KEY.to_owned(),
                HeaderValue::Bytes(error.to_string().into_bytes()),
            );

            // The payload stays empty: callers check the fault header before
            // ever decoding the body
            let message = RawMessage {
                properties: MessageProperties {
                    correlation_id: Some(correlation_id),
                    delivery_mode: DeliveryMode::NonPersistent,
                    headers,
                    ..Default::default()
                },
                payload: Vec::new(),
            };

            broker
                .publish(&reply_exchange, &reply_to, false, false, message)
                .await?;

            Err(error)
        }
    }
}

fn is_cancellation(error: &BoxedError) -> bool {
    matches!(error.downcast_ref::<RpcError>(), Some(RpcError::Cancelled))
}
