// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Consumer queues are durable, shared and never auto-deleted, which keeps
//! their declaration idempotent across reconnections.

/// Definition of a RabbitMQ queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) exclusive: bool,
    pub(crate) delete: bool,
}

impl QueueDefinition {
    /// Creates a durable, non-exclusive, non auto-deleted queue definition.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: true,
            exclusive: false,
            delete: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Configuration for binding a queue to an exchange.
///
/// Bindings are kept by value so they can be replayed on every recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// The exchange name and routing key start empty, set them with `exchange`
    /// and `routing_key`.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumer_queues_are_durable_and_shared() {
        let def = QueueDefinition::new("analysis-run");

        assert_eq!(def.name(), "analysis-run");
        assert!(def.durable);
        assert!(!def.exclusive);
        assert!(!def.delete);
    }

    #[test]
    fn binding_builder() {
        let binding = QueueBinding::new("q").exchange("e").routing_key("k.#");

        assert_eq!(binding.queue_name, "q");
        assert_eq!(binding.exchange_name, "e");
        assert_eq!(binding.routing_key, "k.#");
    }
}
