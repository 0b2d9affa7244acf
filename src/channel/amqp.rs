//! AMQP (RabbitMQ) channel implementation.
//!
//! Messages are published to a direct exchange with the message topic as
//! routing key. Each input channel declares its queue, binds it on the
//! configured routing key and consumes with manual acknowledgement. Header
//! fields travel as AMQP headers; the message id travels as the AMQP
//! `message_id` property.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
        QueuePurgeOptions,
    },
    types::{AMQPValue, FieldTable},
    uri::AMQPUri,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    ChannelBinding, ChannelError, ChannelFactory, MessageChannel, MessageProducer,
    ReceiveOutcome, Result,
};
use crate::broker::{BrokerConfig, BrokerError, ConnectionManager, Connector};
use crate::message::{Message, MessageHeader, MessageType};
use crate::resilience::{ResilienceConfig, ResiliencePolicy};

const HEADER_TOPIC: &str = "topic";
const HEADER_MESSAGE_TYPE: &str = "message_type";
const HEADER_HANDLED_COUNT: &str = "handled_count";
const HEADER_TIMESTAMP: &str = "timestamp";

/// Reply code for a normal AMQP close.
const REPLY_SUCCESS: u16 = 200;

fn broker_error(error: lapin::Error) -> BrokerError {
    match error {
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            BrokerError::AlreadyClosed(error.to_string())
        }
        lapin::Error::ProtocolError(_) => BrokerError::OperationInterrupted(error.to_string()),
        lapin::Error::IOError(_) => BrokerError::Unreachable(error.to_string()),
        other => BrokerError::Protocol(other.to_string()),
    }
}

/// lapin-backed [`Connector`]: one TCP connection, one AMQP channel as session.
pub struct AmqpConnector {
    config: BrokerConfig,
}

impl AmqpConnector {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    type Connection = Connection;
    type Session = Channel;

    async fn connect(&self) -> std::result::Result<Connection, BrokerError> {
        let mut uri: AMQPUri = self
            .config
            .url
            .parse()
            .map_err(|e: String| BrokerError::NotSupported(format!("Invalid broker URL: {e}")))?;
        uri.query.heartbeat = Some(self.config.heartbeat_secs);

        let connection = Connection::connect_uri(uri, ConnectionProperties::default())
            .await
            .map_err(broker_error)?;

        info!(url = %self.config.sanitized_url(), "Connected to AMQP");
        Ok(connection)
    }

    async fn open_session(
        &self,
        connection: &Connection,
    ) -> std::result::Result<Channel, BrokerError> {
        let channel = connection.create_channel().await.map_err(broker_error)?;

        channel
            .basic_qos(self.config.prefetch, BasicQosOptions::default())
            .await
            .map_err(broker_error)?;

        channel
            .exchange_declare(
                &self.config.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: self.config.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(broker_error)?;

        debug!(exchange = %self.config.exchange, "Declared exchange");
        Ok(channel)
    }

    fn is_connection_open(&self, connection: &Connection) -> bool {
        connection.status().connected()
    }

    fn is_session_open(&self, session: &Channel) -> bool {
        session.status().connected()
    }

    async fn close_session(&self, session: Channel) {
        if let Err(e) = session.close(REPLY_SUCCESS, "Bye").await {
            debug!(error = %e, "Ignoring error closing AMQP channel");
        }
    }

    async fn close_connection(&self, connection: Connection) {
        if let Err(e) = connection.close(REPLY_SUCCESS, "Bye").await {
            debug!(error = %e, "Ignoring error closing AMQP connection");
        }
    }
}

fn headers_for(header: &MessageHeader) -> FieldTable {
    let mut headers = FieldTable::default();
    headers.insert(
        HEADER_TOPIC.into(),
        AMQPValue::LongString(header.topic.as_str().into()),
    );
    headers.insert(
        HEADER_MESSAGE_TYPE.into(),
        AMQPValue::LongString(header.message_type.as_str().into()),
    );
    headers.insert(
        HEADER_HANDLED_COUNT.into(),
        AMQPValue::LongInt(i32::try_from(header.handled_count).unwrap_or(i32::MAX)),
    );
    headers.insert(
        HEADER_TIMESTAMP.into(),
        AMQPValue::LongString(header.timestamp.to_rfc3339().into()),
    );
    headers
}

fn string_header(headers: &FieldTable, key: &str) -> Option<String> {
    match headers.inner().get(key)? {
        AMQPValue::LongString(value) => std::str::from_utf8(value.as_bytes())
            .ok()
            .map(str::to_string),
        AMQPValue::ShortString(value) => Some(value.as_str().to_string()),
        _ => None,
    }
}

fn count_header(headers: &FieldTable, key: &str) -> Option<u32> {
    let count = match headers.inner().get(key)? {
        AMQPValue::ShortShortInt(v) => i64::from(*v),
        AMQPValue::ShortShortUInt(v) => i64::from(*v),
        AMQPValue::ShortInt(v) => i64::from(*v),
        AMQPValue::ShortUInt(v) => i64::from(*v),
        AMQPValue::LongInt(v) => i64::from(*v),
        AMQPValue::LongUInt(v) => i64::from(*v),
        AMQPValue::LongLongInt(v) => *v,
        _ => return None,
    };
    u32::try_from(count).ok()
}

/// Rebuild a [`Message`] from a delivery.
///
/// A delivery without a parseable id or message type comes back as
/// `MessageType::Unacceptable` so the pump can reject it.
fn message_from_delivery(delivery: Delivery) -> Message {
    let headers = delivery.properties.headers().clone().unwrap_or_default();

    let id = delivery
        .properties
        .message_id()
        .as_ref()
        .and_then(|id| Uuid::parse_str(id.as_str()).ok());
    let message_type = string_header(&headers, HEADER_MESSAGE_TYPE)
        .map(|kind| MessageType::parse(&kind))
        .unwrap_or(MessageType::Unacceptable);
    let topic = string_header(&headers, HEADER_TOPIC)
        .unwrap_or_else(|| delivery.routing_key.as_str().to_string());

    let header = match id {
        Some(id) => MessageHeader::new(id, topic, message_type),
        None => {
            warn!(routing_key = %delivery.routing_key, "Delivery without a valid message id");
            MessageHeader::new(Uuid::new_v4(), topic, MessageType::Unacceptable)
        }
    };
    let header = header.with_handled_count(count_header(&headers, HEADER_HANDLED_COUNT).unwrap_or(0));
    let header = match string_header(&headers, HEADER_TIMESTAMP)
        .and_then(|ts| DateTime::parse_from_rfc3339(&ts).ok())
    {
        Some(timestamp) => header.with_timestamp(timestamp.with_timezone(&Utc)),
        None => header,
    };

    Message::new(header, delivery.data).with_delivery_tag(delivery.delivery_tag)
}

async fn publish(
    manager: &ConnectionManager<AmqpConnector>,
    message: &Message,
) -> std::result::Result<(), BrokerError> {
    let exchange = manager.connector().config().exchange.clone();
    let properties = BasicProperties::default()
        .with_message_id(message.id().to_string().into())
        .with_headers(headers_for(&message.header));

    let channel = manager.ensure_session().await?;
    let confirm = channel
        .basic_publish(
            &exchange,
            &message.header.topic,
            BasicPublishOptions::default(),
            message.body.as_bytes(),
            properties,
        )
        .await
        .map_err(broker_error)?;
    confirm.await.map_err(broker_error)?;

    debug!(
        exchange = %exchange,
        topic = %message.header.topic,
        message_id = %message.id(),
        "Published message"
    );
    Ok(())
}

/// Publishes to the configured exchange.
pub struct AmqpMessageProducer {
    manager: Arc<ConnectionManager<AmqpConnector>>,
}

impl AmqpMessageProducer {
    pub fn new(manager: Arc<ConnectionManager<AmqpConnector>>) -> Self {
        Self { manager }
    }

    /// Producer with its own connection.
    pub fn connect(config: BrokerConfig, resilience: &ResilienceConfig) -> Self {
        Self::new(Arc::new(ConnectionManager::new(
            AmqpConnector::new(config),
            ResiliencePolicy::new(resilience),
        )))
    }

    pub async fn close(&self) {
        self.manager.close().await;
    }
}

#[async_trait]
impl MessageProducer for AmqpMessageProducer {
    async fn send(&self, message: &Message) -> Result<()> {
        publish(&self.manager, message).await.map_err(|e| {
            error!(message_id = %message.id(), error = %e, "Failed to publish message");
            ChannelError::from(e)
        })
    }
}

/// Input channel over one queue.
///
/// The broker consumer is started lazily on the first receive, and again
/// after the consumer stream ends or fails.
pub struct AmqpMessageConsumer {
    manager: Arc<ConnectionManager<AmqpConnector>>,
    binding: ChannelBinding,
    consumer: Mutex<Option<lapin::Consumer>>,
}

impl AmqpMessageConsumer {
    pub fn new(manager: Arc<ConnectionManager<AmqpConnector>>, binding: ChannelBinding) -> Self {
        Self {
            manager,
            binding,
            consumer: Mutex::new(None),
        }
    }

    fn config(&self) -> &BrokerConfig {
        self.manager.connector().config()
    }

    fn queue_arguments(&self) -> FieldTable {
        let mut arguments = FieldTable::default();
        if self.config().high_availability {
            arguments.insert("x-ha-policy".into(), AMQPValue::LongString("all".into()));
        }
        arguments
    }

    /// Idempotent queue declare and bind. Returns the session used.
    async fn ensure_queue(&self) -> std::result::Result<Channel, BrokerError> {
        let channel = self.manager.ensure_session().await?;

        channel
            .queue_declare(
                &self.binding.queue,
                QueueDeclareOptions {
                    durable: false,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                self.queue_arguments(),
            )
            .await
            .map_err(broker_error)?;

        channel
            .queue_bind(
                &self.binding.queue,
                &self.config().exchange,
                &self.binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(broker_error)?;

        Ok(channel)
    }

    /// Start a manual-ack consumer on the bound queue.
    async fn start_consuming(&self) -> std::result::Result<lapin::Consumer, BrokerError> {
        let channel = self.ensure_queue().await?;
        let consumer = channel
            .basic_consume(
                &self.binding.queue,
                &format!("conveyor-{}", Uuid::new_v4()),
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(broker_error)?;

        info!(
            queue = %self.binding.queue,
            routing_key = %self.binding.routing_key,
            exchange = %self.config().exchange,
            "Consumer bound to queue"
        );
        Ok(consumer)
    }

    fn delivery_tag(message: &Message) -> Result<u64> {
        message
            .delivery_tag()
            .ok_or(ChannelError::NotDelivered(message.id()))
    }

    async fn reject_tag(&self, tag: u64, requeue: bool) -> std::result::Result<(), BrokerError> {
        let channel = self.manager.ensure_session().await?;
        channel
            .basic_reject(tag, BasicRejectOptions { requeue })
            .await
            .map_err(broker_error)
    }
}

#[async_trait]
impl MessageProducer for AmqpMessageConsumer {
    async fn send(&self, message: &Message) -> Result<()> {
        publish(&self.manager, message).await.map_err(ChannelError::from)
    }
}

#[async_trait]
impl MessageChannel for AmqpMessageConsumer {
    fn binding(&self) -> &ChannelBinding {
        &self.binding
    }

    async fn receive(&self, timeout: Duration) -> ReceiveOutcome {
        let mut consumer = self.consumer.lock().await;

        if consumer.is_none() {
            match self.start_consuming().await {
                Ok(started) => *consumer = Some(started),
                Err(e) => {
                    error!(queue = %self.binding.queue, error = %e, "Failed to start consumer");
                    return ReceiveOutcome::ChannelLost(e.into());
                }
            }
        }
        let Some(stream) = consumer.as_mut() else {
            return ReceiveOutcome::TimedOut;
        };

        match tokio::time::timeout(timeout, stream.next()).await {
            Ok(Some(Ok(delivery))) => {
                let message = message_from_delivery(delivery);
                debug!(
                    queue = %self.binding.queue,
                    message_id = %message.id(),
                    handled_count = message.handled_count(),
                    "Received message"
                );
                ReceiveOutcome::Delivered(message)
            }
            Ok(Some(Err(e))) => {
                *consumer = None;
                error!(queue = %self.binding.queue, error = %e, "Consumer delivery error");
                ReceiveOutcome::ChannelLost(broker_error(e).into())
            }
            Ok(None) => {
                *consumer = None;
                info!(queue = %self.binding.queue, "Consumer stream ended");
                ReceiveOutcome::TimedOut
            }
            Err(_) => ReceiveOutcome::TimedOut,
        }
    }

    async fn acknowledge(&self, message: &Message) -> Result<()> {
        let tag = Self::delivery_tag(message)?;
        let channel = self.manager.ensure_session().await?;
        channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(|e| {
                error!(message_id = %message.id(), error = %e, "Failed to acknowledge message");
                ChannelError::from(broker_error(e))
            })?;
        debug!(message_id = %message.id(), "Acknowledged message");
        Ok(())
    }

    async fn reject(&self, message: &Message, requeue: bool) -> Result<()> {
        let tag = Self::delivery_tag(message)?;
        self.reject_tag(tag, requeue).await.map_err(|e| {
            error!(message_id = %message.id(), error = %e, "Failed to reject message");
            ChannelError::from(e)
        })?;
        debug!(message_id = %message.id(), requeue, "Rejected message");
        Ok(())
    }

    async fn requeue(&self, message: &Message) -> Result<()> {
        let tag = Self::delivery_tag(message)?;
        let mut copy = message.detached();
        copy.increment_handled_count();

        debug!(
            message_id = %message.id(),
            handled_count = copy.handled_count(),
            "Requeueing message"
        );
        publish(&self.manager, &copy).await.map_err(|e| {
            error!(message_id = %message.id(), error = %e, "Failed to republish message for requeue");
            e
        })?;
        self.reject_tag(tag, false).await.map_err(|e| {
            error!(message_id = %message.id(), error = %e, "Failed to settle requeued message");
            ChannelError::from(e)
        })?;
        Ok(())
    }

    async fn purge(&self) -> Result<()> {
        let channel = self.ensure_queue().await?;
        let purged = channel
            .queue_purge(&self.binding.queue, QueuePurgeOptions::default())
            .await
            .map_err(broker_error)?;
        debug!(queue = %self.binding.queue, purged, "Purged queue");
        Ok(())
    }

    async fn close(&self) {
        self.consumer.lock().await.take();
        self.manager.close().await;
    }
}

/// Builds one [`AmqpMessageConsumer`] per call, each with its own connection.
pub struct AmqpChannelFactory {
    broker: BrokerConfig,
    resilience: ResilienceConfig,
}

impl AmqpChannelFactory {
    pub fn new(broker: BrokerConfig, resilience: ResilienceConfig) -> Self {
        Self { broker, resilience }
    }
}

impl ChannelFactory for AmqpChannelFactory {
    fn create_input_channel(&self, binding: &ChannelBinding) -> Result<Arc<dyn MessageChannel>> {
        let manager = Arc::new(ConnectionManager::new(
            AmqpConnector::new(self.broker.clone()),
            ResiliencePolicy::new(&self.resilience),
        ));
        Ok(Arc::new(AmqpMessageConsumer::new(manager, binding.clone())))
    }
}
