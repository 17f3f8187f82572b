// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod backoff;
pub mod channel;
pub mod classifier;
pub mod configs;
pub mod connection;
pub mod consumer;
pub mod dialer;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod pool;
pub mod publisher;
pub mod queue;
pub mod supervisor;
pub mod topology;
pub mod watcher;
