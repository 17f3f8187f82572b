// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reconnecting Publish Channel
//!
//! Keeps one connection and channel for publishing. Acquisition is serialized
//! behind a mutex; a missing or broken channel is replaced transparently by
//! dialing again, so publishers never have to be recreated after transport loss.
//! A channel whose publish failed is discarded and the next attempt redials.

use crate::{
    backoff::retry,
    connection::{close_channel_quietly, BrokerConnection},
    dialer::{Connector, LapinConnector},
    errors::AmqpError,
    otel,
    publisher::{OutboundMessage, PublishTransport},
};
use async_trait::async_trait;
use lapin::{
    options::BasicPublishOptions,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel,
};
use std::{collections::BTreeMap, future::Future, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, error};
use uuid::Uuid;

/// Dial attempts per reconnection.
pub const RECONNECT_ATTEMPTS: u32 = 5;
/// Wait between two reconnection attempts.
pub const RECONNECT_WAIT: Duration = Duration::from_secs(1);

/// A connection-backed resource kept by `ReconnectingChannel`.
#[async_trait]
pub trait Pooled: Send + Sync {
    /// What callers get to work with, cloned out of the pool.
    type Handle: Clone + Send;

    fn is_usable(&self) -> bool;

    fn handle(&self) -> Self::Handle;

    /// Closes the resource, logging instead of failing.
    async fn release(&self);
}

/// A connection with one channel opened on it.
pub struct PooledChannel {
    connection: BrokerConnection,
    channel: Channel,
}

#[async_trait]
impl Pooled for PooledChannel {
    type Handle = Channel;

    fn is_usable(&self) -> bool {
        self.connection.is_connected() && self.channel.status().connected()
    }

    fn handle(&self) -> Channel {
        self.channel.clone()
    }

    async fn release(&self) {
        close_channel_quietly(&self.channel).await;
        if let Err(err) = self.connection.close().await {
            debug!(error = err.to_string(), "publish connection already gone");
        }
    }
}

/// `Connector` that opens a connection and a channel on it.
pub struct ChannelConnector<C = LapinConnector> {
    connector: C,
}

impl ChannelConnector<LapinConnector> {
    pub fn new(name: &str) -> Self {
        ChannelConnector {
            connector: LapinConnector::new(name),
        }
    }
}

#[async_trait]
impl<C> Connector for ChannelConnector<C>
where
    C: Connector<Connection = BrokerConnection>,
{
    type Connection = PooledChannel;

    async fn connect(&self, uri: &str) -> Result<PooledChannel, AmqpError> {
        let connection = self.connector.connect(uri).await?;

        match connection.create_channel().await {
            Ok(channel) => Ok(PooledChannel {
                connection,
                channel,
            }),
            Err(err) => {
                if let Err(close_err) = connection.close().await {
                    debug!(error = close_err.to_string(), "connection already gone");
                }
                Err(err)
            }
        }
    }
}

/// Publish transport over a single self-healing channel.
pub struct ReconnectingChannel<C: Connector = ChannelConnector> {
    uri: String,
    connector: C,
    state: Mutex<Option<C::Connection>>,
}

impl ReconnectingChannel<ChannelConnector> {
    /// Creates a pool for `uri`. Nothing is dialed until the first publish.
    pub fn new(uri: &str) -> Self {
        Self::with_connector(uri, ChannelConnector::new(env!("CARGO_PKG_NAME")))
    }
}

impl<C> ReconnectingChannel<C>
where
    C: Connector,
    C::Connection: Pooled,
{
    pub fn with_connector(uri: &str, connector: C) -> Self {
        ReconnectingChannel {
            uri: uri.to_owned(),
            connector,
            state: Mutex::new(None),
        }
    }

    /// Returns a usable handle, reconnecting first when needed.
    ///
    /// # Returns
    /// The pooled handle, or the last dial error after `RECONNECT_ATTEMPTS`
    /// attempts spaced by `RECONNECT_WAIT`.
    async fn acquire(&self) -> Result<<C::Connection as Pooled>::Handle, AmqpError> {
        let mut state = self.state.lock().await;

        if let Some(pooled) = state.as_ref().filter(|p| p.is_usable()) {
            return Ok(pooled.handle());
        }

        if let Some(stale) = state.take() {
            debug!("publish channel lost, reconnecting");
            stale.release().await;
        }

        let fresh = retry(RECONNECT_ATTEMPTS, RECONNECT_WAIT, || {
            self.connector.connect(&self.uri)
        })
        .await?;
        let handle = fresh.handle();
        *state = Some(fresh);

        Ok(handle)
    }

    /// Drops the pooled resource so the next acquisition redials.
    async fn discard(&self) {
        let stale = self.state.lock().await.take();
        if let Some(stale) = stale {
            stale.release().await;
        }
    }

    /// Runs `op` on a pooled handle.
    ///
    /// Acquisition failures surface as `AmqpError::PublishingError`. A failing
    /// `op` discards the pooled resource before its error is returned.
    async fn with_handle<F, Fut>(&self, op: F) -> Result<(), AmqpError>
    where
        F: FnOnce(<C::Connection as Pooled>::Handle) -> Fut + Send,
        Fut: Future<Output = Result<(), AmqpError>> + Send,
    {
        let handle = self.acquire().await.map_err(|err| {
            error!(error = err.to_string(), "no publish channel available");
            AmqpError::PublishingError(err.to_string())
        })?;

        if let Err(err) = op(handle).await {
            self.discard().await;
            return Err(err);
        }

        Ok(())
    }
}

#[async_trait]
impl<C> PublishTransport for ReconnectingChannel<C>
where
    C: Connector<Connection = PooledChannel>,
{
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> Result<(), AmqpError> {
        let props = properties(message);

        self.with_handle(|channel| async move {
            match channel
                .basic_publish(
                    exchange,
                    routing_key,
                    BasicPublishOptions {
                        immediate: false,
                        mandatory: false,
                    },
                    &message.body,
                    props,
                )
                .await
            {
                Err(err) => {
                    error!(error = err.to_string(), "error publishing message");
                    Err(AmqpError::PublishingError(err.to_string()))
                }
                _ => Ok(()),
            }
        })
        .await
    }
}

/// Builds the AMQP properties of an outbound message, trace context included.
fn properties(message: &OutboundMessage) -> BasicProperties {
    let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
    otel::inject_context(&mut headers);

    for (key, value) in &message.headers {
        headers.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }

    BasicProperties::default()
        .with_content_type(ShortString::from(message.content_type.clone()))
        .with_delivery_mode(message.delivery_mode.as_amqp())
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_headers(FieldTable::from(headers))
}
