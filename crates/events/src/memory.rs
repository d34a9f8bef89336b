//! In-memory broker doubles for tests.
//!
//! - [`MemoryBroker`] feeds deliveries into a [`MemoryDeliveryStream`] and
//!   records how each one was settled.
//! - [`MemoryPublisherFactory`] records every published message and counts
//!   opened/closed publisher connections.
//!
//! Not suitable for production: nothing leaves the process.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::broker::{Acknowledge, DeliveryStream, EventPublisher, InboundDelivery, PublisherFactory};
use crate::error::BrokerError;

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Acked,
    Rejected { requeue: bool },
}

type AckLog = Arc<Mutex<Vec<(u64, AckOutcome)>>>;

/// Test broker: push deliveries in, inspect acknowledgements.
pub struct MemoryBroker {
    tx: Option<mpsc::UnboundedSender<Result<InboundDelivery, BrokerError>>>,
    acks: AckLog,
    fail_acks: Arc<AtomicBool>,
    next_tag: AtomicU64,
}

/// Receiving half handed to the orchestrator.
pub struct MemoryDeliveryStream {
    rx: mpsc::UnboundedReceiver<Result<InboundDelivery, BrokerError>>,
}

impl MemoryBroker {
    pub fn new() -> (Self, MemoryDeliveryStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let broker = Self {
            tx: Some(tx),
            acks: Arc::default(),
            fail_acks: Arc::default(),
            next_tag: AtomicU64::new(1),
        };
        (broker, MemoryDeliveryStream { rx })
    }

    /// Enqueue a delivery and return its delivery tag.
    pub fn deliver(&self, routing_key: &str, body: impl Into<Vec<u8>>) -> u64 {
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        let acker = MemoryAcker {
            tag,
            log: Arc::clone(&self.acks),
            fail: Arc::clone(&self.fail_acks),
        };
        self.send(Ok(InboundDelivery::new(
            routing_key,
            body.into(),
            false,
            acker,
        )));
        tag
    }

    /// Enqueue a broker-level failure.
    pub fn fail(&self, error: BrokerError) {
        self.send(Err(error));
    }

    /// Make every subsequent ack/reject fail.
    pub fn fail_acks(&self) {
        self.fail_acks.store(true, Ordering::SeqCst);
    }

    /// End the stream, as if the broker cancelled the consumer.
    pub fn close(&mut self) {
        self.tx = None;
    }

    pub fn acks(&self) -> Vec<(u64, AckOutcome)> {
        self.acks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn outcome(&self, tag: u64) -> Option<AckOutcome> {
        self.acks()
            .into_iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, outcome)| outcome)
    }

    fn send(&self, item: Result<InboundDelivery, BrokerError>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(item);
        }
    }
}

#[async_trait]
impl DeliveryStream for MemoryDeliveryStream {
    async fn next_delivery(&mut self) -> Option<Result<InboundDelivery, BrokerError>> {
        self.rx.recv().await
    }
}

struct MemoryAcker {
    tag: u64,
    log: AckLog,
    fail: Arc<AtomicBool>,
}

impl MemoryAcker {
    fn record(&self, outcome: AckOutcome) -> Result<(), BrokerError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(BrokerError::Ack(format!("delivery {} channel closed", self.tag)));
        }
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((self.tag, outcome));
        Ok(())
    }
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.record(AckOutcome::Acked)
    }

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.record(AckOutcome::Rejected { requeue })
    }
}

/// A message captured by [`MemoryPublisherFactory`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub routing_key: String,
    pub payload: Vec<u8>,
}

#[derive(Default)]
struct PublisherState {
    published: Mutex<Vec<PublishedMessage>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
    fail_publishes: AtomicBool,
}

/// Records publishes in memory.
#[derive(Clone, Default)]
pub struct MemoryPublisherFactory {
    state: Arc<PublisherState>,
}

impl MemoryPublisherFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent publish fail.
    pub fn fail_publishes(&self) {
        self.state.fail_publishes.store(true, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state
            .published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PublisherFactory for MemoryPublisherFactory {
    async fn open(&self) -> Box<dyn EventPublisher> {
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Box::new(MemoryPublisher {
            state: Arc::clone(&self.state),
        })
    }
}

struct MemoryPublisher {
    state: Arc<PublisherState>,
}

#[async_trait]
impl EventPublisher for MemoryPublisher {
    async fn publish(&mut self, routing_key: &str, payload: &[u8]) -> Result<(), BrokerError> {
        if self.state.fail_publishes.load(Ordering::SeqCst) {
            return Err(BrokerError::Publish("publisher connection reset".into()));
        }
        self.state
            .published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PublishedMessage {
                routing_key: routing_key.to_string(),
                payload: payload.to_vec(),
            });
        Ok(())
    }

    async fn close(self: Box<Self>) {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[tokio::test]
    async fn deliveries_flow_and_acks_are_recorded() {
        let (mut broker, mut stream) = MemoryBroker::new();
        let tag = broker.deliver("map.deleted", b"{}".to_vec());
        broker.close();

        let delivery = stream.next_delivery().await.unwrap().unwrap();
        assert_eq!(delivery.routing_key(), "map.deleted");
        delivery.reject(false).await.unwrap();

        assert_eq!(broker.outcome(tag), Some(AckOutcome::Rejected { requeue: false }));
        assert!(stream.next_delivery().await.is_none());
    }

    #[tokio::test]
    async fn failing_acks_surface_errors() {
        let (broker, mut stream) = MemoryBroker::new();
        broker.deliver("map.deleted", b"{}".to_vec());
        broker.fail_acks();

        let delivery = stream.next_delivery().await.unwrap().unwrap();
        assert_matches!(delivery.ack().await, Err(BrokerError::Ack(_)));
        assert!(broker.acks().is_empty());
    }

    #[tokio::test]
    async fn publisher_counts_connections() {
        let factory = MemoryPublisherFactory::new();
        let mut publisher = factory.open().await;
        publisher.publish("map.generated", b"{}").await.unwrap();
        publisher.close().await;

        assert_eq!(factory.opened(), 1);
        assert_eq!(factory.closed(), 1);
        assert_eq!(factory.published().len(), 1);
    }
}
