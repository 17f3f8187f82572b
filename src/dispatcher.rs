// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Registration
//!
//! Registers a consumer on a broker connection: open a channel, declare the
//! queue, bind it to the exchange, start an auto-acknowledged consumer and spawn
//! the dispatch loop. Registration does no retrying of its own; after a broker
//! closure the connection supervisor replays it from scratch.
//!
//! `ResilientConsumer` ties the pieces together: it owns the session, registers
//! the consumer and acts as the supervisor's `Recoverer`, bringing up a fresh
//! session and registration whenever the current connection is lost.

use crate::{
    channel::{setup_connection, BrokerSession},
    configs::RabbitMQConfigs,
    connection::{close_channel_quietly, BrokerConnection},
    consumer::{spawn_dispatch, Delivery, DeliveryHandler, DispatchOutcome, DispatchTask},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    supervisor::{ConsumerHealth, Recoverer},
    topology::{bind_queue, declare_queue},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{options::BasicConsumeOptions, types::FieldTable, Channel};
use std::{
    future::Future,
    sync::{Arc, Weak},
};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};

/// Posted to a blocking `consume` call to make it return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopSignal {
    Shutdown,
    Failed(AmqpError),
}

/// A registered consumer: its channel and running dispatch loop.
pub struct ConsumerHandle {
    channel: Channel,
    dispatch: DispatchTask,
}

impl ConsumerHandle {
    /// Stops the dispatch loop and releases the channel.
    pub async fn shutdown(self) -> DispatchOutcome {
        let outcome = self.dispatch.stop().await;
        close_channel_quietly(&self.channel).await;
        outcome
    }

    /// Blocks until a stop signal arrives, then shuts down.
    ///
    /// A closed signal channel counts as `Shutdown`.
    pub async fn wait(self, stop: mpsc::Receiver<StopSignal>) -> Result<(), AmqpError> {
        let ConsumerHandle { channel, dispatch } = self;

        await_stop(
            dispatch,
            move || async move { close_channel_quietly(&channel).await },
            stop,
        )
        .await
    }
}

/// Waits for a stop signal, stops `dispatch`, then runs `release`.
///
/// # Returns
/// `Ok(())` for `StopSignal::Shutdown` or a closed signal channel, the carried
/// error for `StopSignal::Failed`. `release` runs in every case.
async fn await_stop<R, Fut>(
    dispatch: DispatchTask,
    release: R,
    mut stop: mpsc::Receiver<StopSignal>,
) -> Result<(), AmqpError>
where
    R: FnOnce() -> Fut,
    Fut: Future<Output = ()>,
{
    let signal = stop.recv().await.unwrap_or(StopSignal::Shutdown);

    let outcome = dispatch.stop().await;
    debug!(outcome = ?outcome, "consumer stopped");
    release().await;

    match signal {
        StopSignal::Shutdown => Ok(()),
        StopSignal::Failed(err) => Err(err),
    }
}

/// Registers a consumer of `queue` bound through `binding` on `connection`.
///
/// Any failing step releases the channel and returns the error.
///
/// # Parameters
/// * `connection` - Connection the consumer channel is opened on
/// * `queue` - Queue declared before consuming
/// * `binding` - Binding of the queue to its exchange
/// * `handler` - Receives every delivery, in arrival order
/// * `health` - Marked active once consuming, lost when the stream breaks
///
/// # Returns
/// A handle owning the channel and the running dispatch loop
pub async fn register(
    connection: &BrokerConnection,
    queue: &QueueDefinition,
    binding: &QueueBinding,
    handler: Arc<dyn DeliveryHandler>,
    health: ConsumerHealth,
) -> Result<ConsumerHandle, AmqpError> {
    let channel = connection.create_channel().await?;

    match start_consumer(&channel, queue, binding, handler, health.clone()).await {
        Ok(dispatch) => {
            health.mark_active();
            info!("consumers initialized for queue: {}", queue.name);
            Ok(ConsumerHandle { channel, dispatch })
        }
        Err(err) => {
            close_channel_quietly(&channel).await;
            Err(err)
        }
    }
}

async fn start_consumer(
    channel: &Channel,
    queue: &QueueDefinition,
    binding: &QueueBinding,
    handler: Arc<dyn DeliveryHandler>,
    health: ConsumerHealth,
) -> Result<DispatchTask, AmqpError> {
    declare_queue(channel, queue).await?;
    bind_queue(channel, binding).await?;

    let consumer = match channel
        .basic_consume(
            &queue.name,
            "",
            BasicConsumeOptions {
                no_local: false,
                no_ack: true,
                exclusive: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), "error to create the consumer");
            Err(AmqpError::BindingConsumerError(queue.name.clone()))
        }
        Ok(c) => Ok(c),
    }?;

    let deliveries = consumer.map(|result| {
        result
            .map(Delivery::from)
            .map_err(|err| AmqpError::ConsumerError(err.to_string()))
    });

    Ok(spawn_dispatch(deliveries, handler, health))
}

/// Registers a consumer and blocks until `stop` says otherwise.
///
/// Declares `queue_name` (durable), binds it to `exchange_name` with
/// `routing_key` and dispatches every delivery to `handler`. Setup failures are
/// returned immediately; otherwise the call returns once a `StopSignal` is
/// posted, with the channel released on every path.
///
/// # Parameters
/// * `connection` - Connection the consumer channel is opened on
/// * `queue_name` - Durable queue to declare and consume from
/// * `routing_key` - Routing key binding the queue to the exchange
/// * `exchange_name` - Exchange the queue is bound to
/// * `handler` - Receives every delivery
/// * `health` - Consumer health shared with the connection supervisor
/// * `stop` - Receives the signal ending the call
///
/// # Returns
/// `Ok(())` after `StopSignal::Shutdown`, the carried error after
/// `StopSignal::Failed`, or the setup error.
pub async fn consume(
    connection: &BrokerConnection,
    queue_name: &str,
    routing_key: &str,
    exchange_name: &str,
    handler: Arc<dyn DeliveryHandler>,
    health: ConsumerHealth,
    stop: mpsc::Receiver<StopSignal>,
) -> Result<(), AmqpError> {
    let queue = QueueDefinition::new(queue_name);
    let binding = QueueBinding::new(queue_name)
        .exchange(exchange_name)
        .routing_key(routing_key);

    register(connection, &queue, &binding, handler, health)
        .await?
        .wait(stop)
        .await
}

struct ActiveConsumer {
    session: BrokerSession,
    consumer: ConsumerHandle,
}

/// A consumer that survives broker closures.
///
/// Each start dials a fresh supervised session and registers the consumer on it.
/// The session's supervisor calls back into this consumer to start over when the
/// connection is lost.
pub struct ResilientConsumer {
    configs: RabbitMQConfigs,
    exchange: ExchangeDefinition,
    queue: QueueDefinition,
    binding: QueueBinding,
    handler: Arc<dyn DeliveryHandler>,
    health: ConsumerHealth,
    active: Mutex<Option<ActiveConsumer>>,
    this: Weak<ResilientConsumer>,
}

impl ResilientConsumer {
    /// Creates a consumer. Nothing is connected until `start`.
    ///
    /// # Parameters
    /// * `configs` - Broker connection settings
    /// * `exchange` - Exchange declared on every new session
    /// * `queue` - Queue consumed from
    /// * `routing_key` - Routing key binding `queue` to `exchange`
    /// * `handler` - Receives every delivery
    pub fn new(
        configs: RabbitMQConfigs,
        exchange: ExchangeDefinition,
        queue: QueueDefinition,
        routing_key: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Arc<Self> {
        let binding = QueueBinding::new(&queue.name)
            .exchange(&exchange.name)
            .routing_key(routing_key);

        Arc::new_cyclic(|this| ResilientConsumer {
            configs,
            exchange,
            queue,
            binding,
            handler,
            health: ConsumerHealth::default(),
            active: Mutex::new(None),
            this: this.clone(),
        })
    }

    pub fn health(&self) -> ConsumerHealth {
        self.health.clone()
    }

    /// Connects and registers the consumer.
    pub async fn start(&self) -> Result<(), AmqpError> {
        let recoverer: Arc<dyn Recoverer> = match self.this.upgrade() {
            Some(this) => this,
            None => return Err(AmqpError::InternalError),
        };

        let session =
            setup_connection(&self.configs, &self.exchange, recoverer, self.health.clone())
                .await?;

        let consumer = match register(
            &session.connection,
            &self.queue,
            &self.binding,
            self.handler.clone(),
            self.health.clone(),
        )
        .await
        {
            Ok(consumer) => consumer,
            Err(err) => {
                session.shutdown().await;
                return Err(err);
            }
        };

        let previous = self
            .active
            .lock()
            .await
            .replace(ActiveConsumer { session, consumer });

        if let Some(previous) = previous {
            previous.consumer.shutdown().await;
            previous.session.shutdown().await;
        }

        Ok(())
    }

    /// Stops consuming and closes the connection.
    pub async fn shutdown(&self) {
        let Some(active) = self.active.lock().await.take() else {
            return;
        };

        let outcome = active.consumer.shutdown().await;
        debug!(outcome = ?outcome, "consumer stopped");
        active.session.shutdown().await;
    }
}

#[async_trait]
impl Recoverer for ResilientConsumer {
    async fn recover(&self) -> Result<(), AmqpError> {
        // Runs on the supervisor of the lost session, which must not be aborted.
        let previous = self.active.lock().await.take();
        if let Some(previous) = previous {
            previous.consumer.shutdown().await;
            previous.session.retire().await;
        }

        self.start().await.map_err(|err| {
            error!(error = err.to_string(), "failure to restore consumer");
            AmqpError::RecoveryError(err.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures_util::stream;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Noop;

    #[async_trait]
    impl DeliveryHandler for Noop {
        async fn handle(
            &self,
            _ctx: &opentelemetry::Context,
            _delivery: Delivery,
        ) -> Result<(), AmqpError> {
            Ok(())
        }
    }

    fn idle_dispatch() -> DispatchTask {
        spawn_dispatch(
            stream::pending::<Result<Delivery, AmqpError>>(),
            Arc::new(Noop),
            ConsumerHealth::default(),
        )
    }

    async fn stop_with(signal: Option<StopSignal>) -> (Result<(), AmqpError>, bool) {
        let (tx, rx) = mpsc::channel(1);
        match signal {
            Some(signal) => tx.send(signal).await.unwrap(),
            None => drop(tx),
        }

        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();
        let res = await_stop(
            idle_dispatch(),
            move || async move { flag.store(true, Ordering::SeqCst) },
            rx,
        )
        .await;

        (res, released.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn shutdown_signal_returns_ok() {
        assert_eq!(stop_with(Some(StopSignal::Shutdown)).await, (Ok(()), true));
    }

    #[tokio::test]
    async fn failed_signal_returns_its_error() {
        let err = AmqpError::HandlerError("fatal".to_owned());

        assert_eq!(
            stop_with(Some(StopSignal::Failed(err.clone()))).await,
            (Err(err), true)
        );
    }

    #[tokio::test]
    async fn closed_signal_channel_counts_as_shutdown() {
        assert_eq!(stop_with(None).await, (Ok(()), true));
    }

    #[test]
    fn resilient_consumer_binds_queue_to_exchange() {

        let consumer = ResilientConsumer::new(
            RabbitMQConfigs::default(),
            ExchangeDefinition::new("atlas-jobs").topic(),
            QueueDefinition::new("analysis-run"),
            "analysis.run",
            Arc::new(Noop),
        );

        assert_eq!(
            consumer.binding,
            QueueBinding::new("analysis-run")
                .exchange("atlas-jobs")
                .routing_key("analysis.run")
        );
        assert!(consumer.health().is_active());
    }
}
