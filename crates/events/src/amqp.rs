//! AMQP (RabbitMQ) implementations of the broker seams.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{BasicAckOptions, BasicNackOptions, BasicPublishOptions};
use lapin::{BasicProperties, Channel, Connection, Consumer};

use crate::broker::{Acknowledge, DeliveryStream, EventPublisher, InboundDelivery, PublisherFactory};
use crate::connection::{retry_forever, ConnectionManager};
use crate::error::BrokerError;

/// `delivery_mode = 2`: the broker writes the message to disk.
const PERSISTENT: u8 = 2;

/// Consumer side of the long-lived broker connection.
///
/// Holds the connection and channel so they stay open for as long as the
/// consumer is polled.
pub struct AmqpConsumer {
    connection: Connection,
    _channel: Channel,
    consumer: Consumer,
}

impl AmqpConsumer {
    pub(crate) fn new(connection: Connection, channel: Channel, consumer: Consumer) -> Self {
        Self {
            connection,
            _channel: channel,
            consumer,
        }
    }

    /// Close the consumer connection after draining.
    pub async fn close(self) {
        if let Err(e) = self.connection.close(200, "shutdown").await {
            tracing::debug!(error = %e, "Error closing consumer connection");
        }
    }
}

#[async_trait]
impl DeliveryStream for AmqpConsumer {
    async fn next_delivery(&mut self) -> Option<Result<InboundDelivery, BrokerError>> {
        let next = self.consumer.next().await?;
        Some(
            next.map(|delivery| {
                InboundDelivery::new(
                    delivery.routing_key.as_str(),
                    delivery.data,
                    delivery.redelivered,
                    AmqpAcker(delivery.acker),
                )
            })
            .map_err(|e| BrokerError::Consume(e.to_string())),
        )
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledge for AmqpAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }
}

/// A dedicated publisher connection with publisher confirms enabled.
pub struct AmqpPublisher {
    connection: Connection,
    channel: Channel,
    exchange: String,
}

impl AmqpPublisher {
    pub(crate) fn new(connection: Connection, channel: Channel, exchange: String) -> Self {
        Self {
            connection,
            channel,
            exchange,
        }
    }
}

#[async_trait]
impl EventPublisher for AmqpPublisher {
    async fn publish(&mut self, routing_key: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(PERSISTENT);

        let confirmation = self
            .channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;

        if confirmation.is_nack() {
            return Err(BrokerError::Publish(format!(
                "broker nacked message on '{routing_key}'"
            )));
        }
        Ok(())
    }

    async fn close(self: Box<Self>) {
        if let Err(e) = self.connection.close(200, "unit complete").await {
            tracing::debug!(error = %e, "Error closing publisher connection");
        }
    }
}

/// Opens one [`AmqpPublisher`] per unit of work, retrying until the broker
/// accepts the connection.
pub struct AmqpPublisherFactory {
    manager: Arc<ConnectionManager>,
}

impl AmqpPublisherFactory {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl PublisherFactory for AmqpPublisherFactory {
    async fn open(&self) -> Box<dyn EventPublisher> {
        let publisher = retry_forever("publisher", self.manager.retry_interval(), || {
            self.manager.try_open_publisher()
        })
        .await;
        Box::new(publisher)
    }
}
