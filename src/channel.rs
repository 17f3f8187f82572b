// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Session Setup
//!
//! Brings up a supervised broker session: dial with retries, spawn the
//! connection supervisor, open a channel and declare the exchange the
//! application works with.

use crate::{
    configs::RabbitMQConfigs,
    connection::{close_channel_quietly, BrokerConnection},
    dialer::{Dialer, LapinConnector},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    supervisor::{ConnectionSupervisor, ConsumerHealth, Recoverer, SupervisorOutcome},
    topology::declare_exchange,
};
use lapin::Channel;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// A connection, its supervisor and a channel with the exchange declared.
pub struct BrokerSession {
    pub connection: Arc<BrokerConnection>,
    pub channel: Channel,
    supervisor: JoinHandle<SupervisorOutcome>,
}

impl BrokerSession {
    /// Closes the session after its supervisor already handled the closure.
    pub async fn retire(self) {
        close_channel_quietly(&self.channel).await;
        if let Err(err) = self.connection.close().await {
            debug!(error = err.to_string(), "connection already gone");
        }
    }

    /// Stops watching the connection, then closes it.
    ///
    /// Must not be called from the session's own supervisor task.
    pub async fn shutdown(self) {
        self.supervisor.abort();
        self.retire().await;
    }
}

/// Connects to the broker described by `cfg` and prepares a supervised session.
///
/// The supervisor calls `recoverer` when the connection is closed by an
/// actionable broker error, or cleanly while `health` reports the consumer lost.
///
/// # Parameters
/// * `cfg` - Broker address, credentials and connection name
/// * `exchange` - Exchange declared on the session channel
/// * `recoverer` - Invoked by the supervisor after a significant closure
/// * `health` - Consumer health shared with the supervisor
///
/// # Returns
/// The session on success. Dial exhaustion surfaces as `AmqpError::DialError`;
/// channel or exchange failures close the connection before returning.
pub async fn setup_connection(
    cfg: &RabbitMQConfigs,
    exchange: &ExchangeDefinition,
    recoverer: Arc<dyn Recoverer>,
    health: ConsumerHealth,
) -> Result<BrokerSession, AmqpError> {
    debug!("creating amqp connection...");
    let connection = Dialer::new(LapinConnector::new(&cfg.connection_name), &cfg.uri())
        .dial()
        .await?;
    let connection = Arc::new(connection);
    debug!("amqp connected");

    let Some(signal) = connection.close_signal() else {
        error!("connection close signal already taken");
        return Err(AmqpError::InternalError);
    };
    let supervisor = ConnectionSupervisor::new(recoverer, health).spawn(signal);

    let session = match connection.create_channel().await {
        Ok(channel) => BrokerSession {
            connection,
            channel,
            supervisor,
        },
        Err(err) => {
            supervisor.abort();
            if let Err(close_err) = connection.close().await {
                debug!(error = close_err.to_string(), "connection already gone");
            }
            return Err(err);
        }
    };

    if let Err(err) = declare_exchange(&session.channel, exchange).await {
        session.shutdown().await;
        return Err(err);
    }

    Ok(session)
}
