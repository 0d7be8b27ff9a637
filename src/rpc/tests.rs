use super::*;
use crate::broker::memory::MemoryBroker;
use crate::broker::{Broker, HeaderValue, MessageProperties, RawMessage, DEFAULT_EXCHANGE};
use crate::conventions::MessageType;
use crate::events::{ChannelKind, ConnectionRecovered};
use crate::BoxedError;
use async_trait::async_trait;
use futures::future::join_all;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

struct Echo;

#[async_trait]
impl RequestHandler for Echo {
    type Request = String;
    type Response = String;

    async fn handle(&self, request: String, _context: RequestContext) -> Result<String, BoxedError> {
        Ok(request)
    }
}

struct Increment;

#[async_trait]
impl RequestHandler for Increment {
    type Request = i64;
    type Response = i64;

    async fn handle(&self, request: i64, _context: RequestContext) -> Result<i64, BoxedError> {
        Ok(request + 1)
    }
}

struct Failing;

#[async_trait]
impl RequestHandler for Failing {
    type Request = i32;
    type Response = i32;

    async fn handle(&self, _request: i32, _context: RequestContext) -> Result<i32, BoxedError> {
        Err("boom".into())
    }
}

struct HeaderPeek;

#[async_trait]
impl RequestHandler for HeaderPeek {
    type Request = String;
    type Response = String;

    async fn handle(&self, _request: String, context: RequestContext) -> Result<String, BoxedError> {
        match context.headers.get("tenant") {
            Some(HeaderValue::Text(tenant)) => Ok(tenant.clone()),
            _ => Ok("missing".into()),
        }
    }
}

struct SequentialIds(AtomicUsize);

impl SequentialIds {
    fn new() -> Self {
        Self(AtomicUsize::new(0))
    }
}

impl CorrelationIdSource for SequentialIds {
    fn next_id(&self) -> String {
        format!("corr-{}", self.0.fetch_add(1, Ordering::SeqCst))
    }
}

struct OversizedNames;

impl TypeNameSerializer for OversizedNames {
    fn serialize(&self, _message_type: &MessageType) -> String {
        "x".repeat(256)
    }
}

fn setup() -> (Arc<MemoryBroker>, Arc<EventBus>, RpcEngine<MemoryBroker>) {
    let broker = Arc::new(MemoryBroker::new());
    let events = Arc::new(EventBus::new());
    let engine = RpcEngine::new(Arc::clone(&broker), &events, BusConfig::default());

    (broker, events, engine)
}

fn reply_queues(broker: &MemoryBroker) -> Vec<String> {
    broker
        .declared_queue_names()
        .into_iter()
        .filter(|name| name.starts_with("reply."))
        .collect()
}

#[tokio::test]
async fn round_trip_an_echo_request() {
    let (_broker, _events, engine) = setup();
    let token = CancellationToken::new();

    let responder = engine.respond(Echo, |_| {}).await.unwrap();
    let response: String = engine
        .request(&"hello".to_string(), |_| {}, &token)
        .await
        .unwrap();

    assert_eq!(response, "hello");
    assert!(engine.pending.is_empty());

    responder.close().await;
}

#[tokio::test]
async fn translate_handler_errors_into_responder_faults() {
    let (broker, _events, engine) = setup();
    let token = CancellationToken::new();

    let responder = engine.respond(Failing, |_| {}).await.unwrap();
    let result = engine.request::<i32, i32>(&42, |_| {}, &token).await;

    match result {
        Err(RpcError::ResponderFault(message)) => assert_eq!(message, "boom"),
        other => panic!("expected a responder fault, got {:?}", other.map(|_| ())),
    }

    let faults: Vec<_> = broker
        .published()
        .into_iter()
        .filter(|record| record.message.properties.is_faulted())
        .collect();
    assert_eq!(faults.len(), 1);
    assert_eq!(
        faults[0].message.properties.fault_message(),
        Some("boom".into())
    );
    assert!(faults[0].message.payload.is_empty());

    responder.close().await;
}

#[tokio::test]
async fn cancel_the_caller_when_the_expiration_elapses() {
    let (_broker, _events, engine) = setup();
    let token = CancellationToken::new();
    let started = Instant::now();

    let result = engine
        .request::<String, String>(
            &"nobody listens".to_string(),
            |options| {
                options.expiration(Some(Duration::from_millis(50)));
            },
            &token,
        )
        .await;

    assert!(matches!(result, Err(RpcError::Cancelled)));
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(engine.pending.is_empty());
}

#[tokio::test]
async fn cancel_the_caller_when_the_outer_token_fires() {
    let (_broker, _events, engine) = setup();
    let token = CancellationToken::new();
    let routing_key = "nobody listens".to_string();

    let (result, _) = tokio::join!(
        engine.request::<String, String>(
            &routing_key,
            |options| {
                options.expiration(None);
            },
            &token,
        ),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        }
    );

    assert!(matches!(result, Err(RpcError::Cancelled)));
    assert!(engine.pending.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn share_one_reply_queue_across_concurrent_requests() {
    let (broker, _events, engine) = setup();
    let token = CancellationToken::new();

    let responder = engine.respond(Increment, |_| {}).await.unwrap();

    let requests = (0..1000).map(|value| {
        let engine = &engine;
        let token = &token;
        async move { engine.request::<i64, i64>(&(value as i64), |_| {}, token).await }
    });
    let results = join_all(requests).await;

    for (value, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), value as i64 + 1);
    }

    assert_eq!(reply_queues(&broker).len(), 1);
    // one request consumer, one reply consumer
    assert_eq!(broker.consumer_count(), 2);
    assert!(engine.pending.is_empty());

    responder.close().await;
}

#[tokio::test]
async fn fail_outstanding_requests_on_consumer_recovery() {
    let (broker, events, engine) = setup();
    let engine = Arc::new(engine);
    let token = CancellationToken::new();

    let issuing = {
        let engine = Arc::clone(&engine);
        let token = token.clone();
        tokio::spawn(async move {
            engine
                .request::<String, String>(
                    &"pending".to_string(),
                    |options| {
                        options.expiration(None);
                    },
                    &token,
                )
                .await
        })
    };

    while engine.pending.is_empty() || engine.subscriptions.is_empty() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    events.publish(&ConnectionRecovered {
        channel: ChannelKind::Consumer,
    });

    let result = issuing.await.unwrap();
    assert!(matches!(result, Err(RpcError::ConnectionLost)));
    assert!(engine.subscriptions.is_empty());

    // the next request rebuilds the reply subscription from scratch
    let responder = engine.respond(Echo, |_| {}).await.unwrap();
    let response: String = engine
        .request(&"again".to_string(), |_| {}, &token)
        .await
        .unwrap();
    assert_eq!(response, "again");
    assert_eq!(reply_queues(&broker).len(), 2);

    responder.close().await;
    engine.shutdown().await;
}

#[tokio::test]
async fn ignore_producer_channel_recovery() {
    let (_broker, events, engine) = setup();
    let engine = Arc::new(engine);
    let token = CancellationToken::new();

    let issuing = {
        let engine = Arc::clone(&engine);
        let token = token.clone();
        tokio::spawn(async move {
            engine
                .request::<String, String>(
                    &"pending".to_string(),
                    |options| {
                        options.expiration(None);
                    },
                    &token,
                )
                .await
        })
    };

    while engine.pending.is_empty() || engine.subscriptions.is_empty() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    events.publish(&ConnectionRecovered {
        channel: ChannelKind::Producer,
    });
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert_eq!(engine.pending.len(), 1);
    assert_eq!(engine.subscriptions.len(), 1);

    engine.shutdown().await;
    let result = issuing.await.unwrap();
    assert!(matches!(result, Err(RpcError::ConnectionLost)));
}

#[tokio::test]
async fn reject_oversized_response_type_names_before_declaring() {
    let broker = Arc::new(MemoryBroker::new());
    let events = Arc::new(EventBus::new());
    let engine = RpcEngine::with_components(
        Arc::clone(&broker),
        &events,
        BusConfig::default(),
        Arc::new(DefaultConventions::new()),
        Arc::new(UuidCorrelationIds),
        Arc::new(OversizedNames),
        Arc::new(UniformDeliveryMode::new(false)),
    );

    let result = engine.respond(Echo, |_| {}).await;

    assert!(matches!(result, Err(RpcError::ResponseNameTooLong(256))));
    assert_eq!(broker.queue_declaration_count(), 0);
    assert_eq!(broker.exchange_declaration_count(), 0);
    assert_eq!(broker.consumer_count(), 0);
}

#[tokio::test]
async fn drop_replies_with_unknown_or_stale_correlation_ids() {
    let broker = Arc::new(MemoryBroker::new());
    let events = Arc::new(EventBus::new());
    let engine = RpcEngine::with_components(
        Arc::clone(&broker),
        &events,
        BusConfig::default(),
        Arc::new(DefaultConventions::new()),
        Arc::new(SequentialIds::new()),
        Arc::new(DefaultTypeNames),
        Arc::new(UniformDeliveryMode::new(false)),
    );
    let token = CancellationToken::new();

    // corr-0 expires with nobody responding
    let result = engine
        .request::<String, String>(
            &"will expire".to_string(),
            |options| {
                options.expiration(Some(Duration::from_millis(20)));
            },
            &token,
        )
        .await;
    assert!(matches!(result, Err(RpcError::Cancelled)));

    let reply_queue = reply_queues(&broker).pop().unwrap();
    for stale_id in ["corr-0", "corr-999"] {
        let late_reply = RawMessage {
            properties: MessageProperties {
                correlation_id: Some(stale_id.into()),
                ..Default::default()
            },
            payload: serde_json::to_vec("late").unwrap(),
        };
        broker
            .publish(DEFAULT_EXCHANGE, &reply_queue, false, false, late_reply)
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(engine.pending.is_empty());

    // the subscription keeps dispatching fresh correlation ids afterwards
    let responder = engine.respond(Echo, |_| {}).await.unwrap();
    let response: String = engine
        .request(&"still alive".to_string(), |_| {}, &token)
        .await
        .unwrap();
    assert_eq!(response, "still alive");

    responder.close().await;
}

#[tokio::test]
async fn carry_request_headers_to_the_handler() {
    let (_broker, _events, engine) = setup();
    let token = CancellationToken::new();

    let responder = engine.respond(HeaderPeek, |_| {}).await.unwrap();
    let response: String = engine
        .request(
            &"who am i".to_string(),
            |options| {
                options.header("tenant", HeaderValue::Text("acme".into()));
            },
            &token,
        )
        .await
        .unwrap();

    assert_eq!(response, "acme");

    responder.close().await;
}

#[tokio::test]
async fn fail_outstanding_requests_on_shutdown() {
    let (_broker, events, engine) = setup();
    let engine = Arc::new(engine);
    let token = CancellationToken::new();

    let issuing = {
        let engine = Arc::clone(&engine);
        let token = token.clone();
        tokio::spawn(async move {
            engine
                .request::<String, String>(
                    &"pending".to_string(),
                    |options| {
                        options.expiration(None);
                    },
                    &token,
                )
                .await
        })
    };

    while engine.pending.is_empty() || engine.subscriptions.is_empty() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    engine.shutdown().await;

    let result = issuing.await.unwrap();
    assert!(matches!(result, Err(RpcError::ConnectionLost)));
    assert!(engine.subscriptions.is_empty());

    // the recovery listener is gone; further events are a no-op
    events.publish(&ConnectionRecovered {
        channel: ChannelKind::Consumer,
    });
}

#[tokio::test]
async fn stamp_requests_with_reply_routing_and_delivery_properties() {
    let (broker, _events, engine) = setup();
    let token = CancellationToken::new();

    let responder = engine.respond(Echo, |_| {}).await.unwrap();
    engine
        .request::<String, String>(
            &"inspect me".to_string(),
            |options| {
                options
                    .priority(3)
                    .expiration(Some(Duration::from_secs(2)));
            },
            &token,
        )
        .await
        .unwrap();

    let request_record = broker
        .published()
        .into_iter()
        .find(|record| record.exchange.starts_with("rpc."))
        .unwrap();
    let properties = &request_record.message.properties;

    assert_eq!(properties.reply_to, reply_queues(&broker).pop());
    assert!(properties.correlation_id.is_some());
    assert_eq!(properties.priority, 3);
    assert_eq!(properties.expiration_millis(), Some("2000".into()));
    assert_eq!(properties.delivery_mode, crate::broker::DeliveryMode::Persistent);

    responder.close().await;
}
