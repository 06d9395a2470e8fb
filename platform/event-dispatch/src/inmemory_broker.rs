//! In-memory implementation of the Broker trait for testing and development

use crate::error::{ConnectionError, DispatchError, TopologyError};
use crate::{Broker, MessageProperties, PublishOutcome};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::warn;

const SUBSCRIBER_BUFFER: usize = 1000;

/// AMQP exchange types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
    Headers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExchangeSpec {
    kind: ExchangeKind,
    durable: bool,
}

/// A message as routed by the in-memory broker
#[derive(Debug, Clone)]
pub struct DeliveredMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

/// Broker implementation using in-memory channels
///
/// This implementation is suitable for:
/// - Unit tests (no external dependencies)
/// - Local development without a RabbitMQ container
/// - Simulating connection drops, channel closure, and nacks
///
/// It follows the AMQP rules the dispatcher depends on: exchanges must be
/// declared before publish, re-declaring identically is a no-op, a conflicting
/// declaration or a publish to an unknown exchange closes the channel.
///
/// # Example
/// ```rust
/// use event_dispatch::{Broker, InMemoryBroker, MessageProperties};
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = InMemoryBroker::new();
/// broker.declare_topic_exchange("sword_events").await?;
///
/// let mut stream = broker.subscribe("sword_events", "sample.lifecycle.*");
/// broker
///     .publish(
///         "sword_events",
///         "sample.lifecycle.created",
///         b"{}".to_vec(),
///         &MessageProperties::persistent_json(),
///     )
///     .await?;
///
/// let msg = stream.next().await.unwrap();
/// assert_eq!(msg.routing_key, "sample.lifecycle.created");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

struct Inner {
    sender: broadcast::Sender<DeliveredMessage>,
    exchanges: Mutex<HashMap<String, ExchangeSpec>>,
    confirms: bool,
    connected: AtomicBool,
    channel_open: AtomicBool,
    published: AtomicUsize,
    fail_after: Mutex<Option<usize>>,
    nack_next: AtomicBool,
    close_count: AtomicUsize,
}

impl InMemoryBroker {
    /// Create a broker in publisher-confirm mode with a 1000 message buffer
    pub fn new() -> Self {
        Self::build(true)
    }

    /// Publishes report `PublishOutcome::Sent` instead of `Confirmed`
    pub fn without_confirms() -> Self {
        Self::build(false)
    }

    fn build(confirms: bool) -> Self {
        let (sender, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self {
            inner: Arc::new(Inner {
                sender,
                exchanges: Mutex::new(HashMap::new()),
                confirms,
                connected: AtomicBool::new(true),
                channel_open: AtomicBool::new(true),
                published: AtomicUsize::new(0),
                fail_after: Mutex::new(None),
                nack_next: AtomicBool::new(false),
                close_count: AtomicUsize::new(0),
            }),
        }
    }

    fn exchanges(&self) -> MutexGuard<'_, HashMap<String, ExchangeSpec>> {
        self.inner
            .exchanges
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pre-declare an exchange of any kind, as another producer would
    pub fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) {
        self.exchanges()
            .insert(name.to_string(), ExchangeSpec { kind, durable });
    }

    /// Kind and durability of a declared exchange
    pub fn exchange(&self, name: &str) -> Option<(ExchangeKind, bool)> {
        self.exchanges().get(name).map(|spec| (spec.kind, spec.durable))
    }

    pub fn exchange_count(&self) -> usize {
        self.exchanges().len()
    }

    /// Drop the connection after `n` more successful publishes
    pub fn fail_after(&self, n: usize) {
        let limit = self.inner.published.load(Ordering::SeqCst) + n;
        *self
            .inner
            .fail_after
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(limit);
    }

    /// Nack the next publish
    pub fn nack_next(&self) {
        self.inner.nack_next.store(true, Ordering::SeqCst);
    }

    /// Simulate the broker going away
    pub fn drop_connection(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
    }

    pub fn published_count(&self) -> usize {
        self.inner.published.load(Ordering::SeqCst)
    }

    /// Number of times `close` was invoked on this broker
    pub fn close_count(&self) -> usize {
        self.inner.close_count.load(Ordering::SeqCst)
    }

    /// Subscribe as a queue bound to `exchange` with `binding_pattern`
    ///
    /// Messages published before the call are not replayed.
    pub fn subscribe(
        &self,
        exchange: &str,
        binding_pattern: &str,
    ) -> BoxStream<'static, DeliveredMessage> {
        let mut receiver = self.inner.sender.subscribe();
        let exchange = exchange.to_string();
        let pattern = binding_pattern.to_string();

        let stream = async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(msg) => {
                        let routed = msg.exchange == exchange
                            && Self::matches_topic(&msg.routing_key, &pattern);
                        if routed {
                            yield msg;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "in-memory subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
        };

        stream.boxed()
    }

    /// Check if a routing key matches an AMQP topic binding
    ///
    /// - `*` matches exactly one word
    /// - `#` matches zero or more words
    ///
    /// # Examples
    /// - `sample.lifecycle.*` matches `sample.lifecycle.created`
    /// - `sample.#` matches `sample` and `sample.lifecycle.created`
    /// - `sample.*` does NOT match `sample.lifecycle.created` (too many words)
    pub fn matches_topic(routing_key: &str, pattern: &str) -> bool {
        let key: Vec<&str> = routing_key.split('.').collect();
        let pat: Vec<&str> = pattern.split('.').collect();
        Self::match_words(&key, &pat)
    }

    fn match_words(key: &[&str], pattern: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| Self::match_words(&key[skip..], rest)),
            Some((&word, rest)) => match key.split_first() {
                Some((&head, tail)) if word == "*" || word == head => Self::match_words(tail, rest),
                _ => false,
            },
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_topic_exchange(&self, exchange: &str) -> Result<(), TopologyError> {
        if exchange.is_empty() {
            return Err(TopologyError::InvalidName(exchange.to_string()));
        }
        if !self.inner.connected.load(Ordering::SeqCst) {
            return Err(TopologyError::ConnectionClosed);
        }
        if !self.inner.channel_open.load(Ordering::SeqCst) {
            return Err(TopologyError::Transport {
                exchange: exchange.to_string(),
                detail: "channel is closed".to_string(),
            });
        }

        let wanted = ExchangeSpec {
            kind: ExchangeKind::Topic,
            durable: true,
        };

        let mut exchanges = self.exchanges();
        match exchanges.get(exchange).copied() {
            Some(existing) if existing == wanted => Ok(()),
            Some(existing) => {
                self.inner.channel_open.store(false, Ordering::SeqCst);
                Err(TopologyError::Conflict {
                    exchange: exchange.to_string(),
                    detail: format!(
                        "PRECONDITION_FAILED - declared as {:?} (durable={}), \
                         requested topic (durable=true)",
                        existing.kind, existing.durable
                    ),
                })
            }
            None => {
                exchanges.insert(exchange.to_string(), wanted);
                Ok(())
            }
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: &MessageProperties,
    ) -> Result<PublishOutcome, DispatchError> {
        if !self.inner.connected.load(Ordering::SeqCst) {
            return Err(DispatchError::ConnectionLost(
                "connection reset by broker".to_string(),
            ));
        }
        if !self.inner.channel_open.load(Ordering::SeqCst) {
            return Err(DispatchError::ChannelClosed(
                "channel closed by broker".to_string(),
            ));
        }

        {
            let limit = self
                .inner
                .fail_after
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(limit) = *limit {
                if self.inner.published.load(Ordering::SeqCst) >= limit {
                    self.inner.connected.store(false, Ordering::SeqCst);
                    return Err(DispatchError::ConnectionLost(
                        "connection reset by broker".to_string(),
                    ));
                }
            }
        }

        if !self.exchanges().contains_key(exchange) {
            self.inner.channel_open.store(false, Ordering::SeqCst);
            return Err(DispatchError::ExchangeNotFound {
                exchange: exchange.to_string(),
                detail: format!("NOT_FOUND - no exchange '{exchange}'"),
            });
        }

        if self.inner.nack_next.swap(false, Ordering::SeqCst) {
            return Err(DispatchError::Nacked {
                routing_key: routing_key.to_string(),
            });
        }

        let msg = DeliveredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body,
            properties: properties.clone(),
        };

        // No bound subscribers is fine; topic exchanges drop unroutable messages.
        let _ = self.inner.sender.send(msg);
        self.inner.published.fetch_add(1, Ordering::SeqCst);

        Ok(if self.inner.confirms {
            PublishOutcome::Confirmed
        } else {
            PublishOutcome::Sent
        })
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        self.inner.close_count.fetch_add(1, Ordering::SeqCst);
        self.inner.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
            && self.inner.channel_open.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn props() -> MessageProperties {
        MessageProperties::persistent_json()
    }

    #[test]
    fn test_topic_matching() {
        // Exact match
        assert!(InMemoryBroker::matches_topic(
            "sample.lifecycle.created",
            "sample.lifecycle.created"
        ));

        // Single-word wildcard
        assert!(InMemoryBroker::matches_topic("sample.lifecycle.created", "sample.lifecycle.*"));
        assert!(InMemoryBroker::matches_topic("user.interaction.like", "*.interaction.*"));
        assert!(!InMemoryBroker::matches_topic("sample.lifecycle.created", "sample.*"));

        // Multi-word wildcard, including zero words
        assert!(InMemoryBroker::matches_topic("sample.lifecycle.created", "sample.#"));
        assert!(InMemoryBroker::matches_topic("sample", "sample.#"));
        assert!(InMemoryBroker::matches_topic("sample.lifecycle.created", "#.created"));
        assert!(InMemoryBroker::matches_topic("a.b.c.d", "a.#.d"));
        assert!(!InMemoryBroker::matches_topic("user.interaction.like", "sample.#"));

        // Edge cases
        assert!(InMemoryBroker::matches_topic("single", "*"));
        assert!(InMemoryBroker::matches_topic("single", "#"));
        assert!(!InMemoryBroker::matches_topic("one.two", "one"));
    }

    #[tokio::test]
    async fn test_redeclare_is_noop() {
        let broker = InMemoryBroker::new();

        broker.declare_topic_exchange("sword_events").await.unwrap();
        broker.declare_topic_exchange("sword_events").await.unwrap();

        assert_eq!(broker.exchange_count(), 1);
        assert_eq!(broker.exchange("sword_events"), Some((ExchangeKind::Topic, true)));
    }

    #[tokio::test]
    async fn test_conflicting_declaration_closes_channel() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("sword_events", ExchangeKind::Fanout, true);

        let err = broker.declare_topic_exchange("sword_events").await.unwrap_err();
        assert!(matches!(err, TopologyError::Conflict { .. }));

        let publish = broker
            .publish("sword_events", "a.b", b"{}".to_vec(), &props())
            .await;
        assert!(matches!(publish, Err(DispatchError::ChannelClosed(_))));
    }

    #[tokio::test]
    async fn test_non_durable_existing_exchange_conflicts() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("sword_events", ExchangeKind::Topic, false);

        let err = broker.declare_topic_exchange("sword_events").await.unwrap_err();
        assert!(matches!(err, TopologyError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_publish_to_unknown_exchange() {
        let broker = InMemoryBroker::new();

        let err = broker
            .publish("missing", "a.b", b"{}".to_vec(), &props())
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::ExchangeNotFound { .. }));
        assert!(!broker.is_connected());
    }

    #[tokio::test]
    async fn test_subscriber_filters_by_binding() {
        let broker = InMemoryBroker::new();
        broker.declare_topic_exchange("sword_events").await.unwrap();
        let mut stream = broker.subscribe("sword_events", "user.interaction.*");

        broker
            .publish("sword_events", "sample.lifecycle.created", b"1".to_vec(), &props())
            .await
            .unwrap();
        broker
            .publish("sword_events", "user.interaction.like", b"2".to_vec(), &props())
            .await
            .unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timeout")
            .expect("stream ended");
        assert_eq!(msg.routing_key, "user.interaction.like");
        assert_eq!(msg.body, b"2");

        let result = tokio::time::timeout(Duration::from_millis(100), stream.next()).await;
        assert!(result.is_err(), "should timeout, no more messages");
    }

    #[tokio::test]
    async fn test_fail_after_drops_connection() {
        let broker = InMemoryBroker::new();
        broker.declare_topic_exchange("ex").await.unwrap();
        broker.fail_after(2);

        assert!(broker.publish("ex", "a", vec![], &props()).await.is_ok());
        assert!(broker.publish("ex", "a", vec![], &props()).await.is_ok());
        let third = broker.publish("ex", "a", vec![], &props()).await;
        let fourth = broker.publish("ex", "a", vec![], &props()).await;

        assert!(matches!(third, Err(DispatchError::ConnectionLost(_))));
        assert!(matches!(fourth, Err(DispatchError::ConnectionLost(_))));
        assert_eq!(broker.published_count(), 2);
    }

    #[tokio::test]
    async fn test_nack_next_applies_once() {
        let broker = InMemoryBroker::new();
        broker.declare_topic_exchange("ex").await.unwrap();
        broker.nack_next();

        let first = broker.publish("ex", "a.b", vec![], &props()).await;
        let second = broker.publish("ex", "a.b", vec![], &props()).await;

        assert!(matches!(first, Err(DispatchError::Nacked { .. })));
        assert_eq!(second.unwrap(), PublishOutcome::Confirmed);
    }

    #[tokio::test]
    async fn test_without_confirms_reports_sent() {
        let broker = InMemoryBroker::without_confirms();
        broker.declare_topic_exchange("ex").await.unwrap();

        let outcome = broker.publish("ex", "a.b", vec![], &props()).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Sent);
    }
}
