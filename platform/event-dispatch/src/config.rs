use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};

use crate::error::ConfigError;

pub const DEFAULT_EXCHANGE: &str = "sword_events";
pub const DEFAULT_SOURCE: &str = "event_sim";

/// Broker connection parameters
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub username: String,
    pub password: String,

    /// Heartbeat interval in seconds (0 disables)
    pub heartbeat: u16,
    pub connection_timeout: Duration,

    /// Put the channel in confirm mode so receipts mean "acked by broker"
    pub publisher_confirms: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            vhost: "/".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            heartbeat: 60,
            connection_timeout: Duration::from_millis(3000),
            publisher_confirms: true,
        }
    }
}

// Password stays out of logs.
impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("vhost", &self.vhost)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("heartbeat", &self.heartbeat)
            .field("connection_timeout", &self.connection_timeout)
            .field("publisher_confirms", &self.publisher_confirms)
            .finish()
    }
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (env in production, a map in tests)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let cfg = Self {
            host: lookup("RABBITMQ_HOST").unwrap_or(defaults.host),
            port: parse_or(&lookup, "RABBITMQ_PORT", defaults.port)?,
            vhost: lookup("RABBITMQ_VHOST").unwrap_or(defaults.vhost),
            username: lookup("RABBITMQ_USER").unwrap_or(defaults.username),
            password: lookup("RABBITMQ_PASSWORD").unwrap_or(defaults.password),
            heartbeat: parse_or(&lookup, "RABBITMQ_HEARTBEAT", defaults.heartbeat)?,
            connection_timeout: Duration::from_millis(parse_or(
                &lookup,
                "RABBITMQ_CONNECTION_TIMEOUT_MS",
                defaults.connection_timeout.as_millis() as u64,
            )?),
            publisher_confirms: parse_bool_or(
                &lookup,
                "RABBITMQ_PUBLISHER_CONFIRMS",
                defaults.publisher_confirms,
            )?,
        };

        if cfg.host.is_empty() {
            return Err(ConfigError::Empty("RABBITMQ_HOST"));
        }

        Ok(cfg)
    }

    /// Structured AMQP URI; the vhost goes in verbatim, no percent-encoding needed
    pub fn amqp_uri(&self) -> AMQPUri {
        AMQPUri {
            scheme: AMQPScheme::AMQP,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.username.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.vhost.clone(),
            query: AMQPQueryString {
                heartbeat: Some(self.heartbeat),
                connection_timeout: Some(self.connection_timeout.as_millis() as u64),
                ..Default::default()
            },
        }
    }
}

/// Everything a batch run needs besides the events themselves
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub broker: BrokerConfig,
    pub exchange: String,
    pub source: String,
    pub inter_event_delay: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            exchange: DEFAULT_EXCHANGE.to_string(),
            source: DEFAULT_SOURCE.to_string(),
            inter_event_delay: Duration::from_millis(1500),
        }
    }
}

impl DispatchConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let cfg = Self {
            broker: BrokerConfig::from_lookup(&lookup)?,
            exchange: lookup("EVENT_EXCHANGE").unwrap_or(defaults.exchange),
            source: lookup("EVENT_SOURCE").unwrap_or(defaults.source),
            inter_event_delay: Duration::from_millis(parse_or(
                &lookup,
                "EVENT_DELAY_MS",
                defaults.inter_event_delay.as_millis() as u64,
            )?),
        };

        if cfg.exchange.is_empty() {
            return Err(ConfigError::Empty("EVENT_EXCHANGE"));
        }
        if cfg.source.is_empty() {
            return Err(ConfigError::Empty("EVENT_SOURCE"));
        }

        Ok(cfg)
    }

    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| vars.get(key).cloned())
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        None => Ok(default),
    }
}

fn parse_bool_or<F>(lookup: &F, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid { key, value: raw }),
        },
        None => Ok(default),
    }
}
