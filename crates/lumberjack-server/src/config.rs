// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use lumberjack::{ClientConfig, ServerConfig, Version, Versions};

use crate::error::ServerError;
use crate::sink::SinkKind;
use crate::tls;

const DEFAULT_PORT: u16 = 5044;
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_ADDR: &str = "127.0.0.1:5044";
const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, ServerError> {
    match env::var(name) {
        Ok(val) => val.trim().parse::<T>().map_err(|_| {
            ServerError::InvalidConfig(format!("{name} has an invalid value '{val}'"))
        }),
        Err(_) => Ok(default),
    }
}

fn flag_var(name: &str) -> bool {
    env::var(name)
        .map(|val| val.to_lowercase() != "false")
        .unwrap_or(true)
}

/// Configuration for the `lumberjack-server` binary
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Per-operation deadline; 0 disables it
    pub timeout: Duration,
    /// Keepalive interval while a batch is pending; 0 disables it
    pub keepalive: Duration,
    pub v1: bool,
    pub v2: bool,
    /// Capacity of the batch channel shared by all sessions
    pub queue_size: usize,
    /// Events per second published to the sink; 0 means unlimited
    pub rate: u64,
    pub sink: SinkKind,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            timeout: lumberjack::config::DEFAULT_TIMEOUT,
            keepalive: lumberjack::config::DEFAULT_KEEPALIVE,
            v1: true,
            v2: true,
            queue_size: lumberjack::config::DEFAULT_CHANNEL_CAPACITY,
            rate: 0,
            sink: SinkKind::Stdout,
            tls_cert: None,
            tls_key: None,
            log_level: "info".to_string(),
        }
    }
}

impl ServerSettings {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ServerError> {
        let defaults = Self::default();
        let settings = Self {
            host: env::var("LUMBERJACK_HOST").unwrap_or(defaults.host),
            port: parse_var("LUMBERJACK_PORT", defaults.port)?,
            timeout: Duration::from_secs(parse_var(
                "LUMBERJACK_TIMEOUT_SECS",
                defaults.timeout.as_secs(),
            )?),
            keepalive: Duration::from_secs(parse_var(
                "LUMBERJACK_KEEPALIVE_SECS",
                defaults.keepalive.as_secs(),
            )?),
            v1: flag_var("LUMBERJACK_V1"),
            v2: flag_var("LUMBERJACK_V2"),
            queue_size: parse_var("LUMBERJACK_QUEUE_SIZE", defaults.queue_size)?,
            rate: parse_var("LUMBERJACK_RATE", defaults.rate)?,
            sink: match env::var("LUMBERJACK_SINK") {
                Ok(val) => val.parse().map_err(ServerError::InvalidConfig)?,
                Err(_) => defaults.sink,
            },
            tls_cert: env::var_os("LUMBERJACK_TLS_CERT").map(PathBuf::from),
            tls_key: env::var_os("LUMBERJACK_TLS_KEY").map(PathBuf::from),
            log_level: env::var("LUMBERJACK_LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level),
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.port == 0 {
            return Err(ServerError::InvalidConfig(
                "LUMBERJACK_PORT must be greater than 0".to_string(),
            ));
        }

        if self.host.trim().is_empty() {
            return Err(ServerError::InvalidConfig(
                "LUMBERJACK_HOST cannot be empty".to_string(),
            ));
        }

        if !self.v1 && !self.v2 {
            return Err(ServerError::InvalidConfig(
                "at least one of LUMBERJACK_V1 and LUMBERJACK_V2 must be enabled".to_string(),
            ));
        }

        if self.queue_size == 0 {
            return Err(ServerError::InvalidConfig(
                "LUMBERJACK_QUEUE_SIZE must be greater than 0".to_string(),
            ));
        }

        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err(ServerError::InvalidConfig(
                "LUMBERJACK_TLS_CERT and LUMBERJACK_TLS_KEY must be set together".to_string(),
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ServerError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Builds the library configuration, loading TLS material when configured.
    pub fn server_config(&self) -> Result<ServerConfig, ServerError> {
        let tls = match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Some(tls::load_acceptor(cert, key)?),
            _ => None,
        };
        let config = ServerConfig {
            timeout: self.timeout,
            keepalive: self.keepalive,
            versions: Versions {
                v1: self.v1,
                v2: self.v2,
            },
            tls,
            channel_capacity: self.queue_size,
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }
}

/// Configuration for the `lumberjack-send` binary
#[derive(Debug, Clone)]
pub struct SenderSettings {
    pub addr: String,
    pub version: Version,
    pub compression_level: u32,
    pub window: usize,
}

impl Default for SenderSettings {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            version: Version::V2,
            compression_level: lumberjack::config::DEFAULT_COMPRESSION_LEVEL,
            window: lumberjack::config::DEFAULT_MAX_WINDOW,
        }
    }
}

impl SenderSettings {
    pub fn from_env() -> Result<Self, ServerError> {
        let defaults = Self::default();
        let version = match env::var("LUMBERJACK_VERSION").as_deref().map(str::trim) {
            Ok("1") => Version::V1,
            Ok("2") | Err(_) => Version::V2,
            Ok(other) => {
                return Err(ServerError::InvalidConfig(format!(
                    "LUMBERJACK_VERSION must be 1 or 2, got '{other}'"
                )))
            }
        };
        let settings = Self {
            addr: env::var("LUMBERJACK_ADDR").unwrap_or(defaults.addr),
            version,
            compression_level: parse_var("LUMBERJACK_COMPRESSION", defaults.compression_level)?,
            window: parse_var("LUMBERJACK_WINDOW", defaults.window)?,
        };
        settings.client_config()?;
        Ok(settings)
    }

    pub fn client_config(&self) -> Result<ClientConfig, ServerError> {
        let config = ClientConfig {
            version: self.version,
            compression_level: self.compression_level,
            max_window: self.window,
            ..Default::default()
        };
        config
            .validate()
            .map_err(|e| ServerError::InvalidConfig(e.to_string()))?;
        Ok(config)
    }
}
