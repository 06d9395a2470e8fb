//! Error taxonomy for the dispatcher
//!
//! Setup failures (`ConnectionError`, `TopologyError`) abort a run. Per-event
//! failures (`DispatchError`) are recorded in the event's result slot and never
//! abort sibling dispatches.

use thiserror::Error;

/// Why a connection attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Broker could not be reached (DNS, refused, timeout)
    Unreachable,
    /// Broker rejected the credentials or the virtual host
    Rejected,
    /// Anything else the transport reported during the handshake
    Protocol,
}

/// Failure to open (or keep) a connection to the broker
#[derive(Debug, Clone, Error)]
#[error("connection to amqp://{host}:{port}{vhost} failed ({kind:?}): {detail}")]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub host: String,
    pub port: u16,
    pub vhost: String,
    /// Underlying transport error text
    pub detail: String,
}

impl ConnectionError {
    pub fn is_auth_failure(&self) -> bool {
        self.kind == ConnectionErrorKind::Rejected
    }
}

/// Failure to declare the topic exchange
#[derive(Debug, Clone, Error)]
pub enum TopologyError {
    #[error("exchange '{exchange}' already exists with incompatible settings: {detail}")]
    Conflict { exchange: String, detail: String },

    #[error("invalid exchange name: '{0}'")]
    InvalidName(String),

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("failed to declare exchange '{exchange}': {detail}")]
    Transport { exchange: String, detail: String },
}

/// Failure to publish a single event
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("event name must not be empty")]
    InvalidEventName,

    #[error("failed to serialize envelope: {0}")]
    Serialization(String),

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("exchange '{exchange}' not found: {detail}")]
    ExchangeNotFound { exchange: String, detail: String },

    #[error("broker nacked message for routing key '{routing_key}'")]
    Nacked { routing_key: String },

    #[error("transport error: {0}")]
    Transport(String),
}

impl DispatchError {
    /// True when every later dispatch on the same connection will fail too
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            DispatchError::ConnectionClosed
                | DispatchError::ConnectionLost(_)
                | DispatchError::ChannelClosed(_)
        )
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::Serialization(err.to_string())
    }
}

/// Setup failure that aborts a whole batch run
#[derive(Debug, Clone, Error)]
pub enum SetupError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Topology(#[from] TopologyError),
}

/// Invalid or missing configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}'")]
    Invalid { key: &'static str, value: String },

    #[error("{0} must not be empty")]
    Empty(&'static str),
}
