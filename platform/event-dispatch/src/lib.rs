//! # Event Dispatch
//!
//! Publishes envelope-wrapped JSON events to a durable AMQP topic exchange and
//! reports the outcome of every message individually.
//!
//! ## Implementations
//!
//! - **AmqpBroker**: Production transport over RabbitMQ (lapin), one connection
//!   and one channel, publisher confirms on by default
//! - **InMemoryBroker**: Test/dev transport with topic routing and fault injection
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_dispatch::{run_batch, Connection, DispatchConfig, EventDispatcher, OutboundEvent};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cfg = DispatchConfig::from_env()?;
//! let connection = Connection::connect(&cfg.broker).await?;
//! let dispatcher = EventDispatcher::new(cfg.source.clone());
//!
//! let events = vec![OutboundEvent::new(
//!     "sample.lifecycle.created",
//!     json!({"sample_id": 1, "creator_id": 2}),
//! )?];
//!
//! let report = run_batch(
//!     &connection,
//!     &dispatcher,
//!     &cfg.exchange,
//!     &events,
//!     cfg.inter_event_delay,
//!     None,
//! )
//! .await?;
//! println!("{} of {} dispatched", report.succeeded(), report.len());
//! # Ok(())
//! # }
//! ```

mod amqp_broker;
mod batch;
mod config;
mod dispatcher;
mod envelope;
mod error;
mod inmemory_broker;
pub mod retry;

pub use amqp_broker::AmqpBroker;
pub use batch::{
    connect_and_run, run_batch, BatchOutcome, BatchReport, EventResult, OutboundEvent,
};
pub use config::{BrokerConfig, DispatchConfig, DEFAULT_EXCHANGE, DEFAULT_SOURCE};
pub use dispatcher::{Connection, DispatchReceipt, EventDispatcher};
pub use envelope::{
    validate_envelope_fields, EventEnvelope, Payload, ENVELOPE_FIELDS, TIMESTAMP_FORMAT,
};
pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, DispatchError, SetupError, TopologyError,
};
pub use inmemory_broker::{DeliveredMessage, ExchangeKind, InMemoryBroker};

use async_trait::async_trait;
use std::fmt;

/// MIME type carried by every published message
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// AMQP delivery mode for messages that survive a broker restart
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Per-message metadata handed to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: String,
    pub delivery_mode: u8,
    /// Set to the envelope's event_id
    pub message_id: Option<String>,
    /// Unix seconds
    pub timestamp: Option<u64>,
}

impl MessageProperties {
    /// Persistent JSON message
    pub fn persistent_json() -> Self {
        Self {
            content_type: CONTENT_TYPE_JSON.to_string(),
            delivery_mode: DELIVERY_MODE_PERSISTENT,
            message_id: None,
            timestamp: None,
        }
    }

    pub fn with_message_id(mut self, message_id: String) -> Self {
        self.message_id = Some(message_id);
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn is_persistent(&self) -> bool {
        self.delivery_mode == DELIVERY_MODE_PERSISTENT
    }
}

/// What the broker told us about an accepted publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Broker acked under publisher-confirm mode
    Confirmed,
    /// Handed to the transport without confirm mode
    Sent,
}

/// Transport seam between the dispatcher and a concrete broker
///
/// One implementation owns one connection and one channel. Calls are issued
/// strictly sequentially by the dispatcher.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare a durable topic exchange
    ///
    /// Re-declaring with identical settings must be a no-op. An existing
    /// exchange with another type or durability must yield
    /// `TopologyError::Conflict`.
    async fn declare_topic_exchange(&self, exchange: &str) -> Result<(), TopologyError>;

    /// Publish one message
    ///
    /// # Arguments
    /// * `exchange` - Target exchange name
    /// * `routing_key` - Routing key, used verbatim
    /// * `body` - Serialized envelope
    /// * `properties` - Content type, delivery mode, and ids
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: &MessageProperties,
    ) -> Result<PublishOutcome, DispatchError>;

    /// Release the underlying connection
    async fn close(&self) -> Result<(), ConnectionError>;

    fn is_connected(&self) -> bool;
}

impl fmt::Debug for dyn Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Broker")
    }
}
