//! Connection handle and the event dispatcher
//!
//! A `Connection` owns one broker transport and releases it at most once.
//! An `EventDispatcher` builds envelopes and publishes them over a connection,
//! strictly one at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::amqp_broker::AmqpBroker;
use crate::batch::OutboundEvent;
use crate::config::BrokerConfig;
use crate::envelope::{EventEnvelope, Payload};
use crate::error::{ConnectionError, DispatchError, TopologyError};
use crate::{Broker, MessageProperties, PublishOutcome};

/// Proof that the broker accepted an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchReceipt {
    pub event_id: Uuid,
    /// Routing key the message was published with
    pub event_name: String,
    pub exchange: String,
    pub published_at: DateTime<Utc>,
    /// True when the broker acked under publisher-confirm mode
    pub confirmed: bool,
}

/// Exclusive handle on a broker connection
///
/// `close` is idempotent: the transport is released on the first call and
/// later calls do nothing.
pub struct Connection {
    broker: Arc<dyn Broker>,
    closed: AtomicBool,
}

impl Connection {
    /// Connect to RabbitMQ
    ///
    /// # Errors
    ///
    /// `ConnectionError` carrying the transport's error text when the broker is
    /// unreachable or rejects the credentials.
    pub async fn connect(config: &BrokerConfig) -> Result<Self, ConnectionError> {
        let broker = AmqpBroker::connect(config).await?;
        Ok(Self::from_broker(Arc::new(broker)))
    }

    /// Wrap an already-connected transport (in-memory broker in tests)
    pub fn from_broker(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Release the connection
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("connection already closed");
            return;
        }

        if let Err(e) = self.broker.close().await {
            warn!(error = %e, "error while closing broker connection");
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("closed", &self.is_closed())
            .field("connected", &self.broker.is_connected())
            .finish()
    }
}

/// Builds envelopes and publishes them to a topic exchange
///
/// Timestamps issued by one dispatcher never go backwards, even if the wall
/// clock does.
#[derive(Debug)]
pub struct EventDispatcher {
    source: String,
    last_timestamp: Mutex<Option<DateTime<Utc>>>,
}

impl EventDispatcher {
    /// # Arguments
    /// * `source` - Tag written into every envelope's `source` field
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            last_timestamp: Mutex::new(None),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    fn next_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now().trunc_subsecs(0);
        let mut last = self
            .last_timestamp
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let ts = match *last {
            Some(prev) if prev > now => prev,
            _ => now,
        };
        *last = Some(ts);
        ts
    }

    /// Build an envelope stamped by this dispatcher's clock
    pub fn envelope(
        &self,
        event_name: &str,
        payload: Payload,
    ) -> Result<EventEnvelope, DispatchError> {
        EventEnvelope::stamped(event_name, self.source.as_str(), payload, self.next_timestamp())
    }

    /// Declare the durable topic exchange if absent
    pub async fn ensure_topology(
        &self,
        connection: &Connection,
        exchange: &str,
    ) -> Result<(), TopologyError> {
        if connection.is_closed() {
            return Err(TopologyError::ConnectionClosed);
        }

        connection.broker.declare_topic_exchange(exchange).await?;
        info!(exchange = %exchange, "exchange ready");
        Ok(())
    }

    /// Publish one event
    ///
    /// Routing key is `event_name` verbatim; the message is persistent JSON.
    /// No retry happens here.
    pub async fn dispatch(
        &self,
        connection: &Connection,
        exchange: &str,
        event_name: &str,
        payload: Payload,
    ) -> Result<DispatchReceipt, DispatchError> {
        if connection.is_closed() {
            return Err(DispatchError::ConnectionClosed);
        }

        let envelope = self.envelope(event_name, payload)?;
        let body = envelope.to_json_bytes()?;
        let properties = MessageProperties::persistent_json()
            .with_message_id(envelope.event_id.to_string())
            .with_timestamp(envelope.event_timestamp.timestamp().max(0) as u64);

        let outcome = connection
            .broker
            .publish(exchange, envelope.routing_key(), body, &properties)
            .await;

        match outcome {
            Ok(outcome) => {
                info!(
                    event_name = %envelope.event_name,
                    event_id = %envelope.event_id,
                    exchange = %exchange,
                    "event dispatched"
                );
                Ok(DispatchReceipt {
                    event_id: envelope.event_id,
                    event_name: envelope.event_name,
                    exchange: exchange.to_string(),
                    published_at: Utc::now(),
                    confirmed: outcome == PublishOutcome::Confirmed,
                })
            }
            Err(e) => {
                warn!(
                    event_name = %envelope.event_name,
                    event_id = %envelope.event_id,
                    exchange = %exchange,
                    error = %e,
                    "event dispatch failed"
                );
                Err(e)
            }
        }
    }

    /// Publish events in order, pausing `inter_event_delay` between them
    ///
    /// Returns one result per input, in input order. A failure never stops the
    /// remaining events from being attempted.
    pub async fn dispatch_batch(
        &self,
        connection: &Connection,
        exchange: &str,
        events: &[OutboundEvent],
        inter_event_delay: Duration,
    ) -> Vec<Result<DispatchReceipt, DispatchError>> {
        let mut results = Vec::with_capacity(events.len());

        for (idx, event) in events.iter().enumerate() {
            if idx > 0 && !inter_event_delay.is_zero() {
                tokio::time::sleep(inter_event_delay).await;
            }

            let result = self
                .dispatch(connection, exchange, &event.event_name, event.payload.clone())
                .await;
            results.push(result);
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryBroker;
    use serde_json::json;
    use std::collections::HashSet;

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().expect("object payload")
    }

    async fn setup() -> (InMemoryBroker, Connection, EventDispatcher) {
        let broker = InMemoryBroker::new();
        let connection = Connection::from_broker(Arc::new(broker.clone()));
        let dispatcher = EventDispatcher::new("event_sim");
        dispatcher
            .ensure_topology(&connection, "sword_events")
            .await
            .unwrap();
        (broker, connection, dispatcher)
    }

    #[tokio::test]
    async fn test_dispatch_sets_routing_key_and_properties() {
        let (broker, connection, dispatcher) = setup().await;
        let mut stream = broker.subscribe("sword_events", "#");

        let receipt = dispatcher
            .dispatch(
                &connection,
                "sword_events",
                "user.interaction.follow",
                payload(json!({"user_id": 1, "followed_user_id": 2})),
            )
            .await
            .unwrap();

        let msg = futures::StreamExt::next(&mut stream).await.unwrap();
        assert_eq!(msg.routing_key, "user.interaction.follow");
        assert_eq!(msg.properties.content_type, "application/json");
        assert!(msg.properties.is_persistent());
        assert_eq!(msg.properties.message_id, Some(receipt.event_id.to_string()));
        assert!(receipt.confirmed);
        assert_eq!(receipt.exchange, "sword_events");

        let envelope = EventEnvelope::from_json_slice(&msg.body).unwrap();
        assert_eq!(envelope.event_id, receipt.event_id);
        assert_eq!(envelope.source, "event_sim");
    }

    #[tokio::test]
    async fn test_event_ids_unique() {
        let (_broker, connection, dispatcher) = setup().await;
        let mut ids = HashSet::new();

        for _ in 0..1000 {
            let receipt = dispatcher
                .dispatch(&connection, "sword_events", "a.b", Payload::new())
                .await
                .unwrap();
            assert!(ids.insert(receipt.event_id));
        }
    }

    #[tokio::test]
    async fn test_empty_event_name_not_published() {
        let (broker, connection, dispatcher) = setup().await;

        let err = dispatcher
            .dispatch(&connection, "sword_events", "", Payload::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::InvalidEventName));
        assert_eq!(broker.published_count(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_after_close_fails() {
        let (broker, connection, dispatcher) = setup().await;
        connection.close().await;

        let err = dispatcher
            .dispatch(&connection, "sword_events", "a.b", Payload::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::ConnectionClosed));
        assert_eq!(broker.published_count(), 0);
    }

    #[tokio::test]
    async fn test_close_twice_releases_once() {
        let broker = InMemoryBroker::new();
        let connection = Connection::from_broker(Arc::new(broker.clone()));

        connection.close().await;
        connection.close().await;

        assert!(connection.is_closed());
        assert_eq!(broker.close_count(), 1);
    }

    #[test]
    fn test_timestamps_non_decreasing() {
        let dispatcher = EventDispatcher::new("event_sim");
        let future = Utc::now().trunc_subsecs(0) + chrono::Duration::hours(1);
        *dispatcher.last_timestamp.lock().unwrap() = Some(future);

        let envelope = dispatcher.envelope("a.b", Payload::new()).unwrap();
        assert_eq!(envelope.event_timestamp, future);

        let mut prev = envelope.event_timestamp;
        for _ in 0..10 {
            let next = dispatcher.envelope("a.b", Payload::new()).unwrap().event_timestamp;
            assert!(next >= prev);
            prev = next;
        }
    }

    #[tokio::test]
    async fn test_ensure_topology_on_closed_connection() {
        let broker = InMemoryBroker::new();
        let connection = Connection::from_broker(Arc::new(broker.clone()));
        connection.close().await;

        let err = EventDispatcher::new("s")
            .ensure_topology(&connection, "sword_events")
            .await
            .unwrap_err();
        assert!(matches!(err, TopologyError::ConnectionClosed));
        assert_eq!(broker.exchange_count(), 0);
    }
}
