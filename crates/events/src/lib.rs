//! Event-bus plumbing for the meteomap worker.
//!
//! - [`ConnectionManager`]: connect-with-retry, topology declaration and
//!   consumer setup against RabbitMQ.
//! - [`broker`]: the traits the orchestrator depends on (deliveries,
//!   acknowledgement, per-unit publishers).
//! - [`amqp`]: `lapin` implementations of those traits.
//! - [`memory`]: in-process doubles for tests.

pub mod amqp;
pub mod broker;
pub mod connection;
pub mod error;
pub mod memory;
pub mod topology;

pub use amqp::{AmqpConsumer, AmqpPublisherFactory};
pub use broker::{Acknowledge, DeliveryStream, EventPublisher, InboundDelivery, PublisherFactory};
pub use connection::{amqp_uri, retry_forever, BrokerSettings, ConnectionManager};
pub use error::BrokerError;
pub use topology::{QueueLayout, Topology};
