//! RabbitMQ implementation of the Broker trait

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions};
use lapin::protocol::{AMQPErrorKind, AMQPHardError, AMQPSoftError};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, ConnectionProperties};
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::error::{ConnectionError, ConnectionErrorKind, DispatchError, TopologyError};
use crate::{Broker, MessageProperties, PublishOutcome};

const REPLY_SUCCESS: u16 = 200;

/// Broker implementation over a single AMQP connection and channel
///
/// # Example
/// ```rust,no_run
/// use event_dispatch::{AmqpBroker, Broker, BrokerConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = AmqpBroker::connect(&BrokerConfig::default()).await?;
/// broker.declare_topic_exchange("sword_events").await?;
/// broker.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct AmqpBroker {
    connection: lapin::Connection,
    channel: Channel,
    confirms: bool,
    address: Address,
}

#[derive(Debug, Clone)]
struct Address {
    host: String,
    port: u16,
    vhost: String,
}

impl AmqpBroker {
    /// Open a connection and one channel
    ///
    /// The channel is put in confirm mode when `publisher_confirms` is set.
    pub async fn connect(config: &BrokerConfig) -> Result<Self, ConnectionError> {
        let address = Address {
            host: config.host.clone(),
            port: config.port,
            vhost: config.vhost.clone(),
        };

        let connection =
            lapin::Connection::connect_uri(config.amqp_uri(), ConnectionProperties::default())
                .await
                .map_err(|e| address.connection_error(&e))?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = connection.close(REPLY_SUCCESS, "channel setup failed").await;
                return Err(address.connection_error(&e));
            }
        };

        if config.publisher_confirms {
            if let Err(e) = channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
            {
                let _ = connection.close(REPLY_SUCCESS, "confirm setup failed").await;
                return Err(address.connection_error(&e));
            }
        }

        info!(
            host = %config.host,
            port = config.port,
            vhost = %config.vhost,
            confirms = config.publisher_confirms,
            "amqp connected"
        );

        Ok(Self {
            connection,
            channel,
            confirms: config.publisher_confirms,
            address,
        })
    }
}

impl Address {
    fn connection_error(&self, err: &lapin::Error) -> ConnectionError {
        let kind = match err {
            lapin::Error::IOError(_) => ConnectionErrorKind::Unreachable,
            lapin::Error::ProtocolError(amqp) => match amqp.kind() {
                AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED)
                | AMQPErrorKind::Hard(AMQPHardError::NOTALLOWED) => ConnectionErrorKind::Rejected,
                _ => ConnectionErrorKind::Protocol,
            },
            _ => ConnectionErrorKind::Protocol,
        };

        ConnectionError {
            kind,
            host: self.host.clone(),
            port: self.port,
            vhost: self.vhost.clone(),
            detail: err.to_string(),
        }
    }
}

fn topology_error(exchange: &str, err: &lapin::Error) -> TopologyError {
    match err {
        lapin::Error::ProtocolError(amqp)
            if matches!(
                amqp.kind(),
                AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
            ) =>
        {
            TopologyError::Conflict {
                exchange: exchange.to_string(),
                detail: err.to_string(),
            }
        }
        _ => TopologyError::Transport {
            exchange: exchange.to_string(),
            detail: err.to_string(),
        },
    }
}

fn dispatch_error(exchange: &str, err: &lapin::Error) -> DispatchError {
    match err {
        lapin::Error::ProtocolError(amqp)
            if matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND)) =>
        {
            DispatchError::ExchangeNotFound {
                exchange: exchange.to_string(),
                detail: err.to_string(),
            }
        }
        lapin::Error::ProtocolError(amqp) if matches!(amqp.kind(), AMQPErrorKind::Hard(_)) => {
            DispatchError::ConnectionLost(err.to_string())
        }
        lapin::Error::IOError(_) | lapin::Error::InvalidConnectionState(_) => {
            DispatchError::ConnectionLost(err.to_string())
        }
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidChannel(_) => {
            DispatchError::ChannelClosed(err.to_string())
        }
        _ => DispatchError::Transport(err.to_string()),
    }
}

fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut props = BasicProperties::default()
        .with_content_type(properties.content_type.as_str().into())
        .with_delivery_mode(properties.delivery_mode);

    if let Some(message_id) = &properties.message_id {
        props = props.with_message_id(message_id.as_str().into());
    }
    if let Some(timestamp) = properties.timestamp {
        props = props.with_timestamp(timestamp);
    }

    props
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_topic_exchange(&self, exchange: &str) -> Result<(), TopologyError> {
        if exchange.is_empty() {
            return Err(TopologyError::InvalidName(exchange.to_string()));
        }
        if !self.connection.status().connected() {
            return Err(TopologyError::ConnectionClosed);
        }

        let options = ExchangeDeclareOptions {
            durable: true,
            ..ExchangeDeclareOptions::default()
        };

        self.channel
            .exchange_declare(
                exchange,
                lapin::ExchangeKind::Topic,
                options,
                FieldTable::default(),
            )
            .await
            .map_err(|e| topology_error(exchange, &e))?;

        debug!(exchange = %exchange, "topic exchange declared");
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: &MessageProperties,
    ) -> Result<PublishOutcome, DispatchError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                to_basic_properties(properties),
            )
            .await
            .map_err(|e| dispatch_error(exchange, &e))?;

        let confirmation = confirm.await.map_err(|e| dispatch_error(exchange, &e))?;

        match confirmation {
            Confirmation::Ack(_) => Ok(PublishOutcome::Confirmed),
            Confirmation::NotRequested if !self.confirms => Ok(PublishOutcome::Sent),
            Confirmation::NotRequested => {
                // Confirm mode was requested at connect but the channel lost it.
                warn!(routing_key = %routing_key, "publish not confirmed despite confirm mode");
                Ok(PublishOutcome::Sent)
            }
            Confirmation::Nack(_) => Err(DispatchError::Nacked {
                routing_key: routing_key.to_string(),
            }),
        }
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        if !self.connection.status().connected() {
            return Ok(());
        }

        self.connection
            .close(REPLY_SUCCESS, "dispatcher closing")
            .await
            .map_err(|e| self.address.connection_error(&e))?;

        info!(host = %self.address.host, "amqp connection closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}
