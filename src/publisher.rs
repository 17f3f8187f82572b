// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Publishing with bounded retries. `RetryingPublisher` wraps any
//! `PublishTransport` and retries failed publishes with a linear backoff
//! (`attempt * 2s`, 5 attempts by default). `RabbitMQPublisher` sits on top of
//! it for the common case of one exchange and routing key, turning payloads into
//! transient JSON messages and tagging compressed bodies.

use crate::{
    backoff::RetryPolicy,
    errors::AmqpError,
    pool::ReconnectingChannel,
};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Header marking the body encoding of a compressed message
pub const COMPRESSION_HEADER: &str = "compression";
/// Value of `COMPRESSION_HEADER` for zstd bodies
pub const COMPRESSION_ZSTD: &str = "application/zstd";

/// AMQP delivery mode of an outbound message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Not persisted by the broker.
    #[default]
    Transient,
    Persistent,
}

impl DeliveryMode {
    pub fn as_amqp(&self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Persistent => 2,
        }
    }
}

/// A message ready to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub content_type: String,
    pub headers: BTreeMap<String, String>,
    pub delivery_mode: DeliveryMode,
}

impl OutboundMessage {
    /// A transient JSON message.
    pub fn new(body: &[u8]) -> Self {
        OutboundMessage {
            body: body.to_vec(),
            content_type: JSON_CONTENT_TYPE.to_owned(),
            headers: BTreeMap::default(),
            delivery_mode: DeliveryMode::Transient,
        }
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_owned();
        self
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_owned(), value.to_owned());
        self
    }

    /// Tags the body as zstd compressed. The body itself is left untouched.
    pub fn compressed(self) -> Self {
        self.header(COMPRESSION_HEADER, COMPRESSION_ZSTD)
    }

    pub fn is_compressed(&self) -> bool {
        self.headers.get(COMPRESSION_HEADER).map(String::as_str) == Some(COMPRESSION_ZSTD)
    }
}

/// Publishes a single message once.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PublishTransport: Send + Sync {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> Result<(), AmqpError>;
}

/// Retries a transport's publishes according to a `RetryPolicy`.
pub struct RetryingPublisher<T> {
    transport: T,
    policy: RetryPolicy,
}

impl<T: PublishTransport> RetryingPublisher<T> {
    pub fn new(transport: T) -> Self {
        RetryingPublisher {
            transport,
            policy: RetryPolicy::publish(),
        }
    }

    pub fn policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Publishes `message`, retrying up to the policy's attempt count.
    ///
    /// After failed attempt `n` the publisher waits the policy's n-th delay.
    ///
    /// # Parameters
    /// * `exchange` - Target exchange
    /// * `routing_key` - Routing key of the message
    /// * `message` - Body, content type, headers and delivery mode
    ///
    /// # Returns
    /// `Ok(())` on the first success, otherwise the last error once attempts
    /// are exhausted.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> Result<(), AmqpError> {
        let mut delays = self.policy.delays();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let err = match self.transport.publish(exchange, routing_key, message).await {
                Ok(()) => {
                    info!(exchange, routing_key, attempt, "published to rabbitmq");
                    return Ok(());
                }
                Err(err) => err,
            };

            if self.policy.exhausted(attempt) {
                error!(
                    error = err.to_string(),
                    exchange,
                    routing_key,
                    attempts = attempt,
                    "error while publishing to rabbitmq"
                );
                return Err(err);
            }

            warn!(
                error = err.to_string(),
                attempt, "publish failed, retrying"
            );

            if let Some(delay) = delays.next() {
                sleep(delay).await;
            }
        }
    }
}

/// Something that can be turned into a message body.
pub trait Payload: Send + Sync {
    fn bytes(&self) -> Result<Vec<u8>, AmqpError>;
}

/// Payload serialized as JSON.
pub struct JsonPayload<T>(pub T);

impl<T: Serialize + Send + Sync> Payload for JsonPayload<T> {
    fn bytes(&self) -> Result<Vec<u8>, AmqpError> {
        serde_json::to_vec(&self.0).map_err(|err| AmqpError::PayloadError(err.to_string()))
    }
}

/// Settings of a `RabbitMQPublisher`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RabbitMQOpts {
    pub url: String,
    pub exchange: String,
    pub routing_key: String,
    /// Payload bytes are zstd compressed by the caller.
    pub compress: bool,
}

/// Publishes payloads to a fixed exchange and routing key.
pub struct RabbitMQPublisher<T = ReconnectingChannel> {
    publisher: RetryingPublisher<T>,
    exchange: String,
    routing_key: String,
    compress: bool,
}

impl RabbitMQPublisher<ReconnectingChannel> {
    /// Creates a publisher over a lazily connected, self-healing channel.
    pub fn new(opts: &RabbitMQOpts) -> Self {
        Self::with_transport(opts, ReconnectingChannel::new(&opts.url))
    }
}

impl<T: PublishTransport> RabbitMQPublisher<T> {
    pub fn with_transport(opts: &RabbitMQOpts, transport: T) -> Self {
        RabbitMQPublisher {
            publisher: RetryingPublisher::new(transport),
            exchange: opts.exchange.clone(),
            routing_key: opts.routing_key.clone(),
            compress: opts.compress,
        }
    }

    pub fn policy(mut self, policy: RetryPolicy) -> Self {
        self.publisher = self.publisher.policy(policy);
        self
    }

    /// Serializes `payload` and publishes it to the configured exchange.
    ///
    /// # Returns
    /// `AmqpError::PayloadError` without publishing when serialization fails,
    /// otherwise the result of the retrying publish.
    pub async fn publish(&self, payload: &dyn Payload) -> Result<(), AmqpError> {
        let body = payload.bytes().inspect_err(|err| {
            error!(
                error = err.to_string(),
                "error while preparing payload before publishing to rabbitmq"
            )
        })?;

        let mut message = OutboundMessage::new(&body);
        if self.compress {
            message = message.compressed();
        }

        self.publisher
            .publish(&self.exchange, &self.routing_key, &message)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::PUBLISH_MAX_ATTEMPTS;
    use std::{
        sync::{
            atomic::{AtomicU32, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };
    use tokio::time::Instant;

    /// Fails the first `failures` publishes and records the time of each call.
    #[derive(Clone)]
    struct FlakyTransport {
        failures: u32,
        calls: Arc<AtomicU32>,
        published: Arc<Mutex<Vec<(String, String, OutboundMessage, Instant)>>>,
    }

    impl FlakyTransport {
        fn new(failures: u32) -> Self {
            FlakyTransport {
                failures,
                calls: Arc::new(AtomicU32::new(0)),
                published: Arc::new(Mutex::new(vec![])),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        fn call_times(&self) -> Vec<Instant> {
            self.published.lock().unwrap().iter().map(|p| p.3).collect()
        }
    }

    #[async_trait]
    impl PublishTransport for FlakyTransport {
        async fn publish(
            &self,
            exchange: &str,
            routing_key: &str,
            message: &OutboundMessage,
        ) -> Result<(), AmqpError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.published.lock().unwrap().push((
                exchange.to_owned(),
                routing_key.to_owned(),
                message.clone(),
                Instant::now(),
            ));

            if call <= self.failures {
                return Err(AmqpError::PublishingError(format!("attempt {call}")));
            }
            Ok(())
        }
    }

    fn gaps(times: &[Instant]) -> Vec<Duration> {
        times.windows(2).map(|w| w[1] - w[0]).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_from_transient_failures() {
        let transport = FlakyTransport::new(3);
        let publisher = RetryingPublisher::new(transport.clone());

        let res = publisher
            .publish("celery", "celery", &OutboundMessage::new(b"x"))
            .await;

        assert_eq!(res, Ok(()));
        assert_eq!(transport.calls(), 4);
        assert_eq!(
            gaps(&transport.call_times()),
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(6)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn returns_last_error_after_max_attempts() {
        let transport = FlakyTransport::new(u32::MAX);
        let publisher = RetryingPublisher::new(transport.clone());
        let start = Instant::now();

        let res = publisher
            .publish("celery", "celery", &OutboundMessage::new(b"x"))
            .await;

        assert_eq!(
            res,
            Err(AmqpError::PublishingError(format!(
                "attempt {PUBLISH_MAX_ATTEMPTS}"
            )))
        );
        assert_eq!(transport.calls(), PUBLISH_MAX_ATTEMPTS);
        // 2s + 4s + 6s + 8s
        assert_eq!(start.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn first_success_does_not_sleep() {
        let transport = FlakyTransport::new(0);
        let start = Instant::now();

        RetryingPublisher::new(transport.clone())
            .publish("e", "k", &OutboundMessage::new(b"x"))
            .await
            .unwrap();

        assert_eq!(transport.calls(), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn rabbitmq_publisher_tags_compressed_payloads() {
        let transport = FlakyTransport::new(0);
        let opts = RabbitMQOpts {
            url: "amqp://localhost:5672/".to_owned(),
            exchange: "celery".to_owned(),
            routing_key: "celery".to_owned(),
            compress: true,
        };

        RabbitMQPublisher::with_transport(&opts, transport.clone())
            .publish(&JsonPayload(serde_json::json!({"ok": true})))
            .await
            .unwrap();

        let published = transport.published.lock().unwrap();
        let (exchange, routing_key, message, _) = &published[0];
        assert_eq!(exchange, "celery");
        assert_eq!(routing_key, "celery");
        assert_eq!(message.body, br#"{"ok":true}"#.to_vec());
        assert_eq!(message.content_type, JSON_CONTENT_TYPE);
        assert_eq!(message.delivery_mode, DeliveryMode::Transient);
        assert!(message.is_compressed());
    }

    #[tokio::test]
    async fn payload_errors_skip_publishing() {
        struct Broken;

        impl Payload for Broken {
            fn bytes(&self) -> Result<Vec<u8>, AmqpError> {
                Err(AmqpError::PayloadError("test-error".to_owned()))
            }
        }

        let transport = FlakyTransport::new(0);
        let opts = RabbitMQOpts {
            url: String::new(),
            exchange: "celery".to_owned(),
            routing_key: "celery".to_owned(),
            compress: false,
        };

        let res = RabbitMQPublisher::with_transport(&opts, transport.clone())
            .publish(&Broken)
            .await;

        assert!(matches!(res, Err(AmqpError::PayloadError(_))));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn single_attempt_policy_does_not_retry() {
        let mut transport = MockPublishTransport::new();
        transport
            .expect_publish()
            .withf(|exchange, routing_key, message| {
                exchange == "events" && routing_key == "user.created" && !message.is_compressed()
            })
            .times(1)
            .returning(|_, _, _| Err(AmqpError::PublishingError("channel closed".to_owned())));

        let opts = RabbitMQOpts {
            url: String::new(),
            exchange: "events".to_owned(),
            routing_key: "user.created".to_owned(),
            compress: false,
        };

        let res = RabbitMQPublisher::with_transport(&opts, transport)
            .policy(RetryPolicy::publish().max_attempts(1))
            .publish(&JsonPayload("created"))
            .await;

        assert_eq!(
            res,
            Err(AmqpError::PublishingError("channel closed".to_owned()))
        );
    }

    #[test]
    fn uncompressed_messages_carry_no_marker() {
        let message = OutboundMessage::new(b"x").content_type("text/plain");

        assert!(!message.is_compressed());
        assert!(message.headers.is_empty());
        assert_eq!(DeliveryMode::Transient.as_amqp(), 1);
    }
}
