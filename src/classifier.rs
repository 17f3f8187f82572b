// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Error Classification
//!
//! Maps AMQP 0-9-1 reply codes reported on a connection closure to the action
//! the supervisor should take. Channel and connection level errors warrant a
//! recovery, any other code is logged and left alone.

/// Channel level reply codes.
pub const CONTENT_TOO_LARGE: u16 = 311;
pub const NO_CONSUMERS: u16 = 313;
pub const ACCESS_REFUSED: u16 = 403;
pub const NOT_FOUND: u16 = 404;
pub const RESOURCE_LOCKED: u16 = 405;
pub const PRECONDITION_FAILED: u16 = 406;

/// Connection level reply codes.
pub const CONNECTION_FORCED: u16 = 320;
pub const INVALID_PATH: u16 = 402;
pub const FRAME_ERROR: u16 = 501;
pub const SYNTAX_ERROR: u16 = 502;
pub const COMMAND_INVALID: u16 = 503;
pub const CHANNEL_ERROR: u16 = 504;
pub const UNEXPECTED_FRAME: u16 = 505;
pub const RESOURCE_ERROR: u16 = 506;
pub const NOT_ALLOWED: u16 = 530;
pub const NOT_IMPLEMENTED: u16 = 540;
pub const INTERNAL_ERROR: u16 = 541;

/// Outcome of classifying a broker reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerErrorClass {
    ChannelError,
    ConnectionError,
    NonActionable,
}

impl BrokerErrorClass {
    pub fn is_actionable(&self) -> bool {
        !matches!(self, BrokerErrorClass::NonActionable)
    }
}

/// Classifies a reply code.
pub fn classify(code: u16) -> BrokerErrorClass {
    match code {
        CONTENT_TOO_LARGE | NO_CONSUMERS | ACCESS_REFUSED | NOT_FOUND | RESOURCE_LOCKED
        | PRECONDITION_FAILED => BrokerErrorClass::ChannelError,

        CONNECTION_FORCED | INVALID_PATH | FRAME_ERROR | SYNTAX_ERROR | COMMAND_INVALID
        | CHANNEL_ERROR | UNEXPECTED_FRAME | RESOURCE_ERROR | NOT_ALLOWED | NOT_IMPLEMENTED
        | INTERNAL_ERROR => BrokerErrorClass::ConnectionError,

        _ => BrokerErrorClass::NonActionable,
    }
}

/// Whether a closure with this code should trigger a recovery.
pub fn is_actionable(code: u16) -> bool {
    classify(code).is_actionable()
}
