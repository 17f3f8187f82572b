// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Declarations
//!
//! Declares exchanges and queues and binds them together on a channel. Every
//! declaration is idempotent for identical parameters, which is what lets the
//! recovery loop replay them after each reconnection. Declaring an existing
//! entity with different parameters is refused by the broker and reported to
//! the caller.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel,
};
use tracing::{debug, error};

/// Declares an exchange.
///
/// Declaration is idempotent. Re-declaring with different settings is
/// refused by the broker and closes the channel.
///
/// # Parameters
/// * `channel` - Channel used for the declaration
/// * `def` - Exchange name, kind and durability
///
/// # Returns
/// `AmqpError::DeclareExchangeError` with the exchange name on failure
pub async fn declare_exchange(channel: &Channel, def: &ExchangeDefinition) -> Result<(), AmqpError> {
    debug!("creating exchange: {}", def.name);

    match channel
        .exchange_declare(
            &def.name,
            lapin::ExchangeKind::from(&def.kind),
            ExchangeDeclareOptions {
                passive: false,
                durable: def.durable,
                auto_delete: false,
                internal: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(
                error = err.to_string(),
                name = def.name,
                "error to declare the exchange"
            );
            Err(AmqpError::DeclareExchangeError(def.name.clone()))
        }
        _ => {
            debug!("exchange: {} was created", def.name);
            Ok(())
        }
    }
}

/// Declares a queue.
///
/// # Returns
/// `AmqpError::DeclareQueueError` with the queue name on failure
pub async fn declare_queue(channel: &Channel, def: &QueueDefinition) -> Result<(), AmqpError> {
    debug!("creating queue: {}", def.name);

    match channel
        .queue_declare(
            &def.name,
            QueueDeclareOptions {
                passive: false,
                durable: def.durable,
                exclusive: def.exclusive,
                auto_delete: def.delete,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), name = def.name, "error to declare the queue");
            Err(AmqpError::DeclareQueueError(def.name.clone()))
        }
        _ => {
            debug!("queue: {} was created", def.name);
            Ok(())
        }
    }
}

/// Binds a queue to an exchange with the binding's routing key.
pub async fn bind_queue(channel: &Channel, binding: &QueueBinding) -> Result<(), AmqpError> {
    debug!(
        "binding queue: {} to the exchange: {} with the key: {}",
        binding.queue_name, binding.exchange_name, binding.routing_key
    );

    match channel
        .queue_bind(
            &binding.queue_name,
            &binding.exchange_name,
            &binding.routing_key,
            QueueBindOptions { nowait: false },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), "error to bind queue to exchange");
            Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            ))
        }
        _ => Ok(()),
    }
}
