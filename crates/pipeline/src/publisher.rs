//! Publishes one unit's results as they complete.

use meteomap_core::messages::ROUTING_KEY_MAP_GENERATED;
use meteomap_core::{JobResult, MapGeneratedEvent};
use meteomap_events::EventPublisher;
use tokio::sync::mpsc;

/// Per-unit counters logged after the drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub published: usize,
    pub publish_failed: usize,
}

/// Drains a result channel onto a dedicated publisher connection.
pub struct ResultPublisher {
    publisher: Box<dyn EventPublisher>,
}

impl ResultPublisher {
    pub fn new(publisher: Box<dyn EventPublisher>) -> Self {
        Self { publisher }
    }

    /// Publish one `map.generated` event per success until the channel
    /// closes, then close the connection.
    ///
    /// Failed jobs and publish errors are logged; neither stops the drain.
    pub async fn drain(mut self, mut results: mpsc::Receiver<JobResult>) -> DrainSummary {
        let mut summary = DrainSummary::default();

        while let Some(result) = results.recv().await {
            match result {
                JobResult::Succeeded(map) => {
                    summary.succeeded += 1;
                    let event = MapGeneratedEvent::from(&map);
                    let outcome = match serde_json::to_vec(&event) {
                        Ok(payload) => self
                            .publisher
                            .publish(ROUTING_KEY_MAP_GENERATED, &payload)
                            .await
                            .map_err(|e| e.to_string()),
                        Err(e) => Err(e.to_string()),
                    };
                    match outcome {
                        Ok(()) => summary.published += 1,
                        Err(e) => {
                            summary.publish_failed += 1;
                            tracing::warn!(key = %map.object_key, error = %e, "Failed to publish map event");
                        }
                    }
                }
                JobResult::Failed { job, kind, message } => {
                    summary.failed += 1;
                    tracing::warn!(job = %job, kind = %kind, error = %message, "Render job failed");
                }
            }
        }

        self.publisher.close().await;

        tracing::info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            published = summary.published,
            publish_failed = summary.publish_failed,
            "Unit drained",
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use meteomap_core::{ForecastHour, JobErrorKind, Parameter, RenderJob, RenderedMap};
    use meteomap_events::memory::MemoryPublisherFactory;
    use meteomap_events::PublisherFactory;

    use super::*;

    fn job(parameter: Parameter) -> RenderJob {
        RenderJob {
            source_ref: "/data/gfs.f006".into(),
            model: "gfs".into(),
            run_date: "20250101".into(),
            run_hour: "00".into(),
            parameter,
            region: None,
            forecast_hour: ForecastHour::from_hours(6),
        }
    }

    async fn feed(results: Vec<JobResult>) -> mpsc::Receiver<JobResult> {
        let (tx, rx) = mpsc::channel(results.len().max(1));
        for result in results {
            tx.send(result).await.unwrap();
        }
        rx
    }

    #[tokio::test]
    async fn publishes_successes_and_skips_failures() {
        let factory = MemoryPublisherFactory::new();
        let rx = feed(vec![
            JobResult::Succeeded(RenderedMap::from_job(&job(Parameter::T2m))),
            JobResult::failed(job(Parameter::Apcp), JobErrorKind::Render, "boom"),
        ])
        .await;

        let summary = ResultPublisher::new(factory.open().await).drain(rx).await;

        assert_eq!(
            summary,
            DrainSummary { succeeded: 1, failed: 1, published: 1, publish_failed: 0 }
        );
        let published = factory.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].routing_key, "map.generated");
        let body: serde_json::Value = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(body["url"], "gfs/20250101/00/t2m/006.png");
        assert_eq!(body["forecast_hour"], "006");
        assert!(body.get("region").is_none());
        assert_eq!(factory.closed(), 1);
    }

    #[tokio::test]
    async fn publish_errors_do_not_stop_the_drain() {
        let factory = MemoryPublisherFactory::new();
        factory.fail_publishes();
        let rx = feed(vec![
            JobResult::Succeeded(RenderedMap::from_job(&job(Parameter::T2m))),
            JobResult::Succeeded(RenderedMap::from_job(&job(Parameter::Synoptic))),
        ])
        .await;

        let summary = ResultPublisher::new(factory.open().await).drain(rx).await;

        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.publish_failed, 2);
        assert_eq!(factory.closed(), 1);
    }
}
