// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Resilient RabbitMQ Layer
//!
//! This module provides the error taxonomy shared by every component of the crate.
//! The `AmqpError` enum covers dialing, broker-initiated closures, recovery,
//! consumer setup, message handling and publishing failures.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Transient transport failures are retried by the component that observed them
/// (dialer, supervisor, publisher). The variants returned to callers are the ones
/// left over once those local retries are exhausted, or the ones that must not be
/// retried at all (handler and configuration errors).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// The broker could not be reached after the bounded number of dial attempts
    #[error("failure to dial broker after {attempts} attempts: {reason}")]
    DialError { attempts: u32, reason: String },

    /// A single connection attempt failed
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// The broker closed the connection with the given reply code
    #[error("connection closed by broker, code: {code}, reason: {reason}")]
    BrokerClosed { code: u16, reason: String },

    /// One invocation of the recovery callback failed
    #[error("failure to recover consumers: {0}")]
    RecoveryError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// The message handler rejected a delivery
    #[error("failure to handle message `{0}`")]
    HandlerError(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error turning a payload into message bytes
    #[error("failure to parse payload: {0}")]
    PayloadError(String),

    /// Error loading the broker configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}
