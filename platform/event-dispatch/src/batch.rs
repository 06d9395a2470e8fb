//! Batch runs: what to send, how it went, and scoped connection handling

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::DispatchConfig;
use crate::dispatcher::{Connection, DispatchReceipt, EventDispatcher};
use crate::envelope::Payload;
use crate::error::{DispatchError, SetupError};
use crate::retry::{retry_failed, RetryConfig};

/// One entry of a batch: event name plus payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEvent {
    pub event_name: String,
    #[serde(default)]
    pub payload: Payload,
}

impl OutboundEvent {
    /// Build from a JSON value; the payload must be an object
    pub fn new(
        event_name: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<Self, DispatchError> {
        match payload {
            serde_json::Value::Object(map) => Ok(Self {
                event_name: event_name.into(),
                payload: map,
            }),
            other => Err(DispatchError::Serialization(format!(
                "payload must be a JSON object, got {other}"
            ))),
        }
    }

    /// Parse a JSON array of `{"event_name": ..., "payload": {...}}`
    pub fn list_from_json(bytes: &[u8]) -> Result<Vec<Self>, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Result slot for one event of a batch
#[derive(Debug, Clone)]
pub struct EventResult {
    pub event_name: String,
    pub result: Result<DispatchReceipt, DispatchError>,
}

/// Overall verdict of a batch run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every event was accepted (an empty batch counts as clean)
    Clean,
    /// Some events failed
    Partial,
    /// Every event failed
    Failed,
}

/// Per-event outcomes of a batch, in input order
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub exchange: String,
    entries: Vec<EventResult>,
}

impl BatchReport {
    pub fn new(
        exchange: impl Into<String>,
        events: &[OutboundEvent],
        results: Vec<Result<DispatchReceipt, DispatchError>>,
    ) -> Self {
        let entries = events
            .iter()
            .zip(results)
            .map(|(event, result)| EventResult {
                event_name: event.event_name.clone(),
                result,
            })
            .collect();

        Self {
            exchange: exchange.into(),
            entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[EventResult] {
        &self.entries
    }

    pub fn succeeded(&self) -> usize {
        self.entries.iter().filter(|e| e.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.len() - self.succeeded()
    }

    /// Indices of failed entries, in input order
    pub fn failed_indices(&self) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.result.is_err())
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn outcome(&self) -> BatchOutcome {
        match (self.succeeded(), self.failed()) {
            (_, 0) => BatchOutcome::Clean,
            (0, _) => BatchOutcome::Failed,
            _ => BatchOutcome::Partial,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.outcome() == BatchOutcome::Clean
    }

    /// Replace the result of entry `idx` (used when a caller re-dispatches it)
    pub fn replace(&mut self, idx: usize, result: Result<DispatchReceipt, DispatchError>) {
        if let Some(entry) = self.entries.get_mut(idx) {
            entry.result = result;
        }
    }
}

/// Declare topology, dispatch the batch, and close the connection
///
/// With `retry` set, failed entries are re-dispatched before the close. The
/// connection is closed on every path out of this function, including a
/// topology failure.
pub async fn run_batch(
    connection: &Connection,
    dispatcher: &EventDispatcher,
    exchange: &str,
    events: &[OutboundEvent],
    inter_event_delay: Duration,
    retry: Option<&RetryConfig>,
) -> Result<BatchReport, SetupError> {
    let outcome = async {
        dispatcher.ensure_topology(connection, exchange).await?;

        info!(exchange = %exchange, events = events.len(), "dispatching batch");
        let results = dispatcher
            .dispatch_batch(connection, exchange, events, inter_event_delay)
            .await;
        let mut report = BatchReport::new(exchange, events, results);

        if let Some(retry) = retry {
            if !report.is_clean() {
                retry_failed(&mut report, events, dispatcher, connection, retry).await;
            }
        }

        Ok::<_, SetupError>(report)
    }
    .await;

    connection.close().await;

    match &outcome {
        Ok(report) => info!(
            exchange = %exchange,
            succeeded = report.succeeded(),
            failed = report.failed(),
            outcome = ?report.outcome(),
            "batch finished"
        ),
        Err(e) => warn!(exchange = %exchange, error = %e, "batch aborted during setup"),
    }

    outcome
}

/// Connect to RabbitMQ with `config` and run the batch
pub async fn connect_and_run(
    config: &DispatchConfig,
    events: &[OutboundEvent],
    retry: Option<&RetryConfig>,
) -> Result<BatchReport, SetupError> {
    let connection = Connection::connect(&config.broker).await?;
    let dispatcher = EventDispatcher::new(config.source.clone());

    run_batch(
        &connection,
        &dispatcher,
        &config.exchange,
        events,
        config.inter_event_delay,
        retry,
    )
    .await
}
