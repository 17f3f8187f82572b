// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! The dispatch loop of a consumer registration. Deliveries are handed to the
//! handler one at a time, in arrival order. They are acknowledged by the broker
//! on hand-off, so a failing handler is logged and the loop carries on with the
//! next delivery; nothing is redelivered.

use crate::{errors::AmqpError, otel, supervisor::ConsumerHealth};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use lapin::types::{AMQPValue, FieldTable};
use opentelemetry::{
    trace::{Span, Status},
    Context,
};
use std::{borrow::Cow, sync::Arc};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, error, warn};

/// An inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub body: Vec<u8>,
    pub routing_key: String,
    pub exchange: String,
    pub headers: FieldTable,
    pub redelivered: bool,
}

impl Delivery {
    pub fn new(body: &[u8], routing_key: &str) -> Self {
        Delivery {
            body: body.to_vec(),
            routing_key: routing_key.to_owned(),
            exchange: String::new(),
            headers: FieldTable::default(),
            redelivered: false,
        }
    }

    pub fn header(&self, key: &str) -> Option<&AMQPValue> {
        self.headers.inner().get(key)
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Delivery {
            headers: delivery.properties.headers().clone().unwrap_or_default(),
            routing_key: delivery.routing_key.to_string(),
            exchange: delivery.exchange.to_string(),
            redelivered: delivery.redelivered,
            body: delivery.data,
        }
    }
}

/// Processes deliveries of a consumer registration.
///
/// Handlers may see the same message twice around a reconnection, since the
/// registration is replayed from scratch.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, ctx: &Context, delivery: Delivery) -> Result<(), AmqpError>;
}

/// Why a dispatch loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Stop was requested through the task handle.
    Stopped,
    /// The delivery stream ended on its own.
    StreamEnded,
    /// The delivery stream reported an error.
    StreamFailed,
}

/// Handle to a running dispatch loop.
pub struct DispatchTask {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<DispatchOutcome>,
}

impl DispatchTask {
    /// Asks the loop to stop after the delivery in progress and waits for it.
    pub async fn stop(self) -> DispatchOutcome {
        let DispatchTask { stop, handle } = self;
        // The loop may already be gone, in which case its outcome stands.
        let _ = stop.send(());
        join_dispatch(handle).await
    }

    /// Waits for the loop to end on its own.
    pub async fn join(self) -> DispatchOutcome {
        join_dispatch(self.handle).await
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

async fn join_dispatch(handle: JoinHandle<DispatchOutcome>) -> DispatchOutcome {
    match handle.await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(error = err.to_string(), "dispatch task failed");
            DispatchOutcome::StreamFailed
        }
    }
}

/// Spawns the dispatch loop over `deliveries`.
///
/// A stream that fails or ends without a stop request marks `health` as lost.
pub fn spawn_dispatch<S>(
    deliveries: S,
    handler: Arc<dyn DeliveryHandler>,
    health: ConsumerHealth,
) -> DispatchTask
where
    S: Stream<Item = Result<Delivery, AmqpError>> + Send + 'static,
{
    let (stop, mut stopped) = oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
        let mut deliveries = Box::pin(deliveries);

        loop {
            tokio::select! {
                biased;

                _ = &mut stopped => return DispatchOutcome::Stopped,

                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => dispatch(handler.as_ref(), delivery).await,
                    Some(Err(err)) => {
                        error!(error = err.to_string(), "errors consume msg");
                        health.mark_lost();
                        return DispatchOutcome::StreamFailed;
                    }
                    None => {
                        warn!("delivery stream closed");
                        health.mark_lost();
                        return DispatchOutcome::StreamEnded;
                    }
                },
            }
        }
    });

    DispatchTask { stop, handle }
}

/// Hands one delivery to the handler inside a consumer span.
async fn dispatch(handler: &dyn DeliveryHandler, delivery: Delivery) {
    let (ctx, mut span) = otel::consumer_span(&delivery.headers, &delivery.routing_key);

    debug!(
        "received: {} - exchange: {}",
        delivery.routing_key, delivery.exchange
    );

    match handler.handle(&ctx, delivery).await {
        Ok(()) => {
            debug!("message successfully processed");
            span.set_status(Status::Ok);
        }
        Err(err) => {
            error!(error = err.to_string(), "error consume msg");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::sync::Mutex;

    /// Records bodies and fails on the configured positions.
    struct RecordingHandler {
        fail_on: Vec<usize>,
        seen: Mutex<Vec<Vec<u8>>>,
    }

    impl RecordingHandler {
        fn new(fail_on: Vec<usize>) -> Arc<Self> {
            Arc::new(RecordingHandler {
                fail_on,
                seen: Mutex::new(vec![]),
            })
        }

        fn seen(&self) -> Vec<Vec<u8>> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeliveryHandler for RecordingHandler {
        async fn handle(&self, _ctx: &Context, delivery: Delivery) -> Result<(), AmqpError> {
            let position = {
                let mut seen = self.seen.lock().unwrap();
                seen.push(delivery.body);
                seen.len() - 1
            };

            if self.fail_on.contains(&position) {
                return Err(AmqpError::HandlerError(format!("delivery {position}")));
            }
            Ok(())
        }
    }

    fn deliveries(bodies: &[&str]) -> Vec<Result<Delivery, AmqpError>> {
        bodies
            .iter()
            .map(|b| Ok(Delivery::new(b.as_bytes(), "jobs.run")))
            .collect()
    }

    #[tokio::test]
    async fn handler_errors_do_not_stop_consumption() {
        let handler = RecordingHandler::new(vec![0, 1]);
        let health = ConsumerHealth::default();

        let task = spawn_dispatch(
            stream::iter(deliveries(&["a", "b", "c"])),
            handler.clone(),
            health.clone(),
        );

        assert_eq!(task.join().await, DispatchOutcome::StreamEnded);
        assert_eq!(
            handler.seen(),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
        );
    }

    #[tokio::test]
    async fn stream_end_marks_consumer_lost() {
        let health = ConsumerHealth::default();

        let task = spawn_dispatch(
            stream::iter(deliveries(&["a"])),
            RecordingHandler::new(vec![]),
            health.clone(),
        );

        assert_eq!(task.join().await, DispatchOutcome::StreamEnded);
        assert!(!health.is_active());
    }

    #[tokio::test]
    async fn stream_error_stops_the_loop() {
        let handler = RecordingHandler::new(vec![]);
        let health = ConsumerHealth::default();
        let mut items = deliveries(&["a"]);
        items.push(Err(AmqpError::ConsumerError("channel closed".to_owned())));
        items.extend(deliveries(&["never"]));

        let task = spawn_dispatch(stream::iter(items), handler.clone(), health.clone());

        assert_eq!(task.join().await, DispatchOutcome::StreamFailed);
        assert_eq!(handler.seen(), vec![b"a".to_vec()]);
        assert!(!health.is_active());
    }

    #[tokio::test]
    async fn stop_ends_an_idle_loop() {
        let health = ConsumerHealth::default();
        let handler = RecordingHandler::new(vec![]);

        let task = spawn_dispatch(
            stream::iter(deliveries(&["a", "b"])).chain(stream::pending()),
            handler.clone(),
            health.clone(),
        );

        while handler.seen().len() < 2 {
            tokio::task::yield_now().await;
        }

        assert!(!task.is_finished());
        assert_eq!(task.stop().await, DispatchOutcome::Stopped);
        assert!(health.is_active());
    }

    #[tokio::test]
    async fn stop_after_stream_end_keeps_its_outcome() {
        let task = spawn_dispatch(
            stream::iter(deliveries(&["a"])),
            RecordingHandler::new(vec![]),
            ConsumerHealth::default(),
        );

        while !task.is_finished() {
            tokio::task::yield_now().await;
        }

        assert_eq!(task.stop().await, DispatchOutcome::StreamEnded);
    }

    #[test]
    fn converts_header_lookup() {
        let mut delivery = Delivery::new(b"x", "k");
        delivery
            .headers
            .insert("compression".into(), AMQPValue::LongString("application/zstd".into()));

        assert!(delivery.header("compression").is_some());
        assert!(delivery.header("missing").is_none());
    }
}
