// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Configuration
//!
//! Broker connection settings, loaded from `RABBITMQ_*` environment variables with
//! local-development defaults.

use crate::errors::AmqpError;
use config::{Config, Environment};
use serde::Deserialize;
use tracing::error;

/// Environment prefix used by [`AmqpConfig::from_env`].
pub const ENV_PREFIX: &str = "RABBITMQ";

/// RabbitMQ connection parameters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AmqpConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_credential")]
    pub user: String,
    #[serde(default = "default_credential")]
    pub password: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    /// Reported to the broker as the connection name, visible in the management UI.
    #[serde(default = "default_connection_name")]
    pub connection_name: String,
}

fn default_host() -> String {
    "localhost".to_owned()
}

fn default_port() -> u16 {
    5672
}

fn default_credential() -> String {
    "guest".to_owned()
}

fn default_vhost() -> String {
    "/".to_owned()
}

fn default_connection_name() -> String {
    "amqp-relay".to_owned()
}

impl Default for AmqpConfig {
    fn default() -> Self {
        AmqpConfig {
            host: default_host(),
            port: default_port(),
            user: default_credential(),
            password: default_credential(),
            vhost: default_vhost(),
            connection_name: default_connection_name(),
        }
    }
}

impl AmqpConfig {
    /// Loads the configuration from `RABBITMQ_HOST`, `RABBITMQ_PORT`, `RABBITMQ_USER`,
    /// `RABBITMQ_PASSWORD`, `RABBITMQ_VHOST` and `RABBITMQ_CONNECTION_NAME`.
    /// Missing variables fall back to the defaults.
    pub fn from_env() -> Result<AmqpConfig, AmqpError> {
        Config::builder()
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .and_then(|cfg| cfg.try_deserialize::<AmqpConfig>())
            .map_err(|err| {
                error!(error = err.to_string(), "failure to load amqp configuration");
                AmqpError::ConfigurationError(err.to_string())
            })
    }

    pub fn host(mut self, host: &str) -> Self {
        self.host = host.to_owned();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the user and password used for PLAIN authentication.
    pub fn credentials(mut self, user: &str, password: &str) -> Self {
        self.user = user.to_owned();
        self.password = password.to_owned();
        self
    }

    pub fn vhost(mut self, vhost: &str) -> Self {
        self.vhost = vhost.to_owned();
        self
    }

    /// Name shown for the connection in the broker management UI.
    pub fn connection_name(mut self, name: &str) -> Self {
        self.connection_name = name.to_owned();
        self
    }

    /// Builds the `amqp://` URI. The default vhost `/` is percent-encoded as `%2f`.
    pub fn uri(&self) -> String {
        let vhost = match self.vhost.as_str() {
            "/" | "" => "%2f".to_owned(),
            other => other.trim_start_matches('/').to_owned(),
        };

        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, vhost
        )
    }
}
