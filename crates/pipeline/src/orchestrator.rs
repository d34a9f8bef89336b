//! Consumer loop and bounded orchestration of units of work.
//!
//! One delivery becomes one unit: decode, decompose into jobs, warm the
//! decoder index, fan the jobs out to the [`WorkerPool`] and publish the
//! results over a publisher connection owned by the unit. At most
//! `max_in_flight` render units run at once; deliveries beyond that wait
//! for a slot inside their own task so the consumer loop keeps reading.
//! Deletions run as independent tasks outside the admission bound.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;

use futures::FutureExt;

use meteomap_core::{CoreError, DeletionRequest, ForecastAvailableEvent, JobDecomposer, WorkItem};
use meteomap_events::{BrokerError, DeliveryStream, InboundDelivery, PublisherFactory};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::deletion::DeletionHandler;
use crate::pool::{panic_message, WorkerPool};
use crate::publisher::ResultPublisher;
use crate::warmup::WarmupCoordinator;

/// Default number of render units processed concurrently.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 5;

/// When a render delivery is acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AckMode {
    /// After the whole unit has been rendered and published. A crash
    /// mid-unit leaves the message for redelivery.
    #[default]
    Reliable,
    /// As soon as the unit is admitted. A crash mid-unit loses it.
    FireAndForget,
}

impl AckMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckMode::Reliable => "reliable",
            AckMode::FireAndForget => "fire-and-forget",
        }
    }
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AckMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reliable" => Ok(AckMode::Reliable),
            "fire-and-forget" | "fire_and_forget" => Ok(AckMode::FireAndForget),
            other => Err(CoreError::Validation(format!(
                "Unknown ack mode '{other}' (expected 'reliable' or 'fire-and-forget')"
            ))),
        }
    }
}

/// Runtime knobs for the [`Orchestrator`].
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub ack_mode: AckMode,
    /// Upper bound on concurrently processed render units (min 1).
    pub max_in_flight: usize,
    /// Only render events for this model; others are acknowledged and
    /// skipped.
    pub listen_model: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            ack_mode: AckMode::default(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            listen_model: None,
        }
    }
}

/// Owns every component a unit of work needs.
pub struct Orchestrator {
    config: OrchestratorConfig,
    decomposer: JobDecomposer,
    warmup: WarmupCoordinator,
    pool: WorkerPool,
    deletions: DeletionHandler,
    publishers: Arc<dyn PublisherFactory>,
    slots: Semaphore,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        decomposer: JobDecomposer,
        warmup: WarmupCoordinator,
        pool: WorkerPool,
        deletions: DeletionHandler,
        publishers: Arc<dyn PublisherFactory>,
    ) -> Self {
        let slots = Semaphore::new(config.max_in_flight.max(1));
        Self {
            config,
            decomposer,
            warmup,
            pool,
            deletions,
            publishers,
            slots,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Consume `deliveries` until the stream ends or `cancel` fires, then
    /// wait for every in-flight unit.
    ///
    /// A broker error from the stream or from an ack is fatal: remaining
    /// units are aborted and the error is returned.
    pub async fn run<S>(
        self: Arc<Self>,
        deliveries: &mut S,
        cancel: CancellationToken,
    ) -> Result<(), BrokerError>
    where
        S: DeliveryStream + ?Sized,
    {
        let mut tasks: JoinSet<Result<(), BrokerError>> = JoinSet::new();

        tracing::info!(
            ack_mode = %self.config.ack_mode,
            max_in_flight = self.config.max_in_flight,
            workers = self.pool.size(),
            jobs_per_event = self.decomposer.jobs_per_event(),
            "Orchestrator started",
        );

        let outcome = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    tracing::info!("Shutdown requested, no longer consuming");
                    break Ok(());
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = settle(joined) {
                        break Err(e);
                    }
                }
                next = deliveries.next_delivery() => match next {
                    Some(Ok(delivery)) => {
                        if let Err(e) = self.dispatch(delivery, &mut tasks).await {
                            break Err(e);
                        }
                    }
                    Some(Err(e)) => break Err(e),
                    None => {
                        tracing::warn!("Delivery stream ended");
                        break Ok(());
                    }
                },
            }
        };

        if let Err(e) = outcome {
            tracing::error!(error = %e, in_flight = tasks.len(), "Broker failure, aborting in-flight units");
            tasks.shutdown().await;
            return Err(e);
        }

        tracing::info!(in_flight = tasks.len(), "Draining in-flight units");
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = settle(joined) {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Route one delivery. Only broker errors are returned.
    async fn dispatch(
        self: &Arc<Self>,
        delivery: InboundDelivery,
        tasks: &mut JoinSet<Result<(), BrokerError>>,
    ) -> Result<(), BrokerError> {
        match WorkItem::decode(delivery.routing_key(), delivery.body()) {
            Ok(WorkItem::Render(event)) => {
                if let Some(model) = &self.config.listen_model {
                    if !event.model.eq_ignore_ascii_case(model) {
                        tracing::info!(
                            model = %event.model,
                            listen_model = %model,
                            "Skipping event for another model",
                        );
                        return delivery.ack().await;
                    }
                }
                // In fire-and-forget mode the ack precedes anything that can panic.
                let acked_on_admission = self.config.ack_mode == AckMode::FireAndForget;
                let this = Arc::clone(self);
                tasks.spawn(async move {
                    let unit = this.process_unit(event, &delivery);
                    contain_panic(unit, &delivery, acked_on_admission).await
                });
            }
            Ok(WorkItem::Delete(request)) => {
                let this = Arc::clone(self);
                tasks.spawn(async move {
                    let unit = this.process_deletion(request, &delivery);
                    contain_panic(unit, &delivery, false).await
                });
            }
            Err(CoreError::UnknownRoutingKey(key)) => {
                tracing::warn!(routing_key = %key, "Ignoring message with unknown routing key");
                delivery.ack().await?;
            }
            Err(e) => {
                tracing::warn!(
                    routing_key = %delivery.routing_key(),
                    redelivered = delivery.redelivered(),
                    error = %e,
                    "Rejecting malformed message",
                );
                delivery.reject(false).await?;
            }
        }
        Ok(())
    }

    async fn process_unit(
        &self,
        event: ForecastAvailableEvent,
        delivery: &InboundDelivery,
    ) -> Result<(), BrokerError> {
        let span = tracing::info_span!(
            "unit",
            unit_id = %Uuid::now_v7(),
            model = %event.model,
            run_date = %event.run_date,
            run_hour = %event.run_hour,
        );

        async move {
            let _slot = self
                .slots
                .acquire()
                .await
                .map_err(|_| BrokerError::Consume("admission closed".into()))?;

            if self.config.ack_mode == AckMode::FireAndForget {
                delivery.ack().await?;
            }

            let jobs = self.decomposer.decompose(&event);
            tracing::info!(source = %event.source_ref, jobs = jobs.len(), "Unit admitted");

            self.warmup.warmup(&event.source_ref, &jobs).await;

            let results = self.pool.submit(jobs);
            let publisher = self.publishers.open().await;
            ResultPublisher::new(publisher).drain(results).await;

            if self.config.ack_mode == AckMode::Reliable {
                delivery.ack().await?;
            }
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn process_deletion(
        &self,
        request: DeletionRequest,
        delivery: &InboundDelivery,
    ) -> Result<(), BrokerError> {
        if let Err(e) = self.deletions.handle(&request).await {
            tracing::error!(key = %request.object_key, error = %e, "Failed to delete map");
        }
        delivery.ack().await
    }
}

/// Await one unit. If it panics, the delivery is rejected without requeue
/// unless it was already acknowledged, so it is never left outstanding.
async fn contain_panic<F>(
    unit: F,
    delivery: &InboundDelivery,
    already_acked: bool,
) -> Result<(), BrokerError>
where
    F: Future<Output = Result<(), BrokerError>>,
{
    match AssertUnwindSafe(unit).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => {
            tracing::error!(
                routing_key = %delivery.routing_key(),
                panic = %panic_message(panic.as_ref()),
                "Unit panicked",
            );
            if already_acked {
                Ok(())
            } else {
                delivery.reject(false).await
            }
        }
    }
}

/// Unwrap a finished unit task. Panics are logged; broker errors are
/// returned.
fn settle(joined: Result<Result<(), BrokerError>, JoinError>) -> Result<(), BrokerError> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => {
            tracing::error!(error = %e, "Unit task panicked");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parses_ack_modes() {
        assert_eq!("reliable".parse::<AckMode>().unwrap(), AckMode::Reliable);
        assert_eq!(" Fire-And-Forget ".parse::<AckMode>().unwrap(), AckMode::FireAndForget);
        assert_eq!("fire_and_forget".parse::<AckMode>().unwrap(), AckMode::FireAndForget);
        assert_matches!("at-most-once".parse::<AckMode>(), Err(CoreError::Validation(_)));
    }

    #[test]
    fn defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.ack_mode, AckMode::Reliable);
        assert_eq!(config.max_in_flight, 5);
        assert!(config.listen_model.is_none());
        assert_eq!(AckMode::FireAndForget.to_string(), "fire-and-forget");
    }
}
