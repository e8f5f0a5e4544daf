//! # Client Configuration
//!
//! Purpose: Describe everything the client consumes at startup: locators,
//! subscription and serialization settings, timeouts, pool sizing and the
//! retry policy.
//!
//! All fields have defaults, so a JSON file only needs the settings it
//! changes. Durations are expressed in milliseconds on disk.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use gkv_common::DEFAULT_LOCATOR_PORT;

use crate::client::{ClientError, ClientResult};

/// Host and port of a locator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl FromStr for Endpoint {
    type Err = ClientError;

    /// Parses `host:port`, `[v6]:port` or a bare host (default locator port).
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ClientError::InvalidAddress(raw.to_string()));
        }

        if let Some(rest) = raw.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| ClientError::InvalidAddress(raw.to_string()))?;
            let port = match tail.strip_prefix(':') {
                Some(port) => parse_port(raw, port)?,
                None if tail.is_empty() => DEFAULT_LOCATOR_PORT,
                None => return Err(ClientError::InvalidAddress(raw.to_string())),
            };
            return Ok(Endpoint::new(host, port));
        }

        match raw.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && !host.contains(':') => {
                Ok(Endpoint::new(host, parse_port(raw, port)?))
            }
            Some(_) => Err(ClientError::InvalidAddress(raw.to_string())),
            None => Ok(Endpoint::new(raw, DEFAULT_LOCATOR_PORT)),
        }
    }
}

fn parse_port(raw: &str, port: &str) -> ClientResult<u16> {
    port.parse()
        .map_err(|_| ClientError::InvalidAddress(raw.to_string()))
}

impl TryFrom<String> for Endpoint {
    type Error = ClientError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// How application objects are turned into bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SerializationStrategy {
    /// Only explicitly registered types may be written or read.
    #[default]
    Manual,
    /// Types whose name fully matches `pattern` are auto-serialized by field list.
    Auto { pattern: String },
}

/// Exponential backoff for transient transport failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    #[serde(rename = "initial_backoff_ms", with = "millis")]
    pub initial_backoff: Duration,
    /// Upper bound for any single delay.
    #[serde(rename = "max_backoff_ms", with = "millis")]
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay to wait after the given (1-based) failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
        }
    }
}

/// Configuration for the client, its pool and its subscription channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Locator endpoints, tried in order.
    pub locators: Vec<Endpoint>,
    /// Open a subscription channel so continuous queries can run.
    pub subscription_enabled: bool,
    /// Log verbosity for binaries embedding the client (`error` .. `trace`).
    pub log_level: String,
    /// Serialization strategy for application objects.
    pub serialization: SerializationStrategy,
    /// Maximum idle connections kept in the pool.
    pub max_idle: usize,
    /// Maximum total connections (idle + in-use).
    pub max_total: usize,
    /// TCP connect timeout.
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Duration,
    /// TCP read timeout; bounds how long an operation waits for a reply.
    #[serde(rename = "read_timeout_ms", with = "millis")]
    pub read_timeout: Duration,
    /// TCP write timeout.
    #[serde(rename = "write_timeout_ms", with = "millis")]
    pub write_timeout: Duration,
    /// How long `close` waits for the delivery thread to stop.
    #[serde(rename = "close_grace_ms", with = "millis")]
    pub close_grace: Duration,
    /// Retry policy for transient failures.
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            locators: vec![Endpoint::new("127.0.0.1", DEFAULT_LOCATOR_PORT)],
            subscription_enabled: false,
            log_level: "warn".to_string(),
            serialization: SerializationStrategy::Manual,
            max_idle: 8,
            max_total: 16,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            close_grace: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Creates a configuration pointing at a single locator.
    pub fn with_locator(locator: Endpoint) -> Self {
        ClientConfig {
            locators: vec![locator],
            ..ClientConfig::default()
        }
    }

    /// Parses a JSON document; missing fields keep their defaults.
    pub fn from_json_str(raw: &str) -> ClientResult<Self> {
        let config: ClientConfig =
            serde_json::from_str(raw).map_err(|err| ClientError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> ClientResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|err| {
            ClientError::Config(format!("cannot read {}: {}", path.as_ref().display(), err))
        })?;
        Self::from_json_str(&raw)
    }

    /// Rejects settings the client cannot run with.
    pub fn validate(&self) -> ClientResult<()> {
        if self.locators.is_empty() {
            return Err(ClientError::Config("at least one locator is required".into()));
        }
        if self.max_total == 0 {
            return Err(ClientError::Config("max_total must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ClientError::Config("retry.max_attempts must be positive".into()));
        }
        for (name, timeout) in [
            ("connect_timeout", self.connect_timeout),
            ("read_timeout", self.read_timeout),
            ("write_timeout", self.write_timeout),
        ] {
            // A zero socket timeout means "block forever" to the OS.
            if timeout.is_zero() {
                return Err(ClientError::Config(format!("{} must be non-zero", name)));
            }
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
