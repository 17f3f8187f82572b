// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Configuration
//!
//! Connection settings read from an optional TOML file and `RABBITMQ_*`
//! environment variables, environment taking precedence. Every field has a
//! default matching a local RabbitMQ.

use crate::errors::AmqpError;
use config::{Config, Environment, File};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Name announced to the broker for this client's connections.
    pub connection_name: String,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            connection_name: env!("CARGO_PKG_NAME").to_owned(),
        }
    }
}

impl RabbitMQConfigs {
    /// Loads the configuration from the environment only.
    pub fn from_env() -> Result<Self, AmqpError> {
        Self::load(None)
    }

    /// Loads the configuration from `file` (if given) overridden by the environment.
    ///
    /// # Parameters
    /// * `file` - Path of a TOML file; missing keys fall back to defaults
    ///
    /// # Returns
    /// The merged configuration or `AmqpError::ConfigError`
    pub fn load(file: Option<&str>) -> Result<Self, AmqpError> {
        let mut builder = Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        let cfg = builder
            .add_source(Environment::with_prefix("RABBITMQ").try_parsing(true))
            .build()
            .map_err(|err| AmqpError::ConfigError(err.to_string()))?;

        Self::from_config(cfg)
    }

    fn from_config(cfg: Config) -> Result<Self, AmqpError> {
        cfg.try_deserialize()
            .map_err(|err| AmqpError::ConfigError(err.to_string()))
    }

    /// Renders the AMQP URI, percent-encoding slashes in the vhost.
    pub fn uri(&self) -> String {
        let vhost = match self.vhost.as_str() {
            "/" => "%2f".to_owned(),
            other => other.trim_start_matches('/').replace('/', "%2f"),
        };

        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, vhost
        )
    }
}
