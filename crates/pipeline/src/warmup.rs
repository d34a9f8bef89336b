//! Decoder index warm-up.
//!
//! The GRIB decoder writes a side-car index next to the source file the
//! first time the file is opened under a given filter. Concurrent jobs
//! opening a cold file would race on that write. The warm-up pass opens the
//! file once per distinct filter, one after another, before any job is dispatched,
//! so every job afterwards only reads the index.

use std::collections::BTreeSet;
use std::sync::Arc;

use meteomap_core::RenderJob;

use crate::renderer::Renderer;

/// Outcome of one warm-up pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WarmupReport {
    pub attempted: usize,
    pub failed: usize,
}

/// Runs the serial index pass for one job set.
pub struct WarmupCoordinator {
    renderer: Arc<dyn Renderer>,
}

impl WarmupCoordinator {
    pub fn new(renderer: Arc<dyn Renderer>) -> Self {
        Self { renderer }
    }

    /// Build the index for every distinct filter `jobs` need.
    ///
    /// Failures are logged and the pass continues; callers dispatch
    /// regardless of the report.
    pub async fn warmup(&self, source_ref: &str, jobs: &[RenderJob]) -> WarmupReport {
        let filters = distinct_filters(jobs);
        if filters.is_empty() {
            return WarmupReport::default();
        }

        let attempted = filters.len();
        let mut failed = 0;
        for filter in filters {
            if let Err(e) = self.renderer.build_index(source_ref, filter).await {
                failed += 1;
                tracing::warn!(
                    source = %source_ref,
                    filter = filter.unwrap_or("none"),
                    error = %e,
                    "Index warm-up failed",
                );
            }
        }

        tracing::debug!(source = %source_ref, attempted, failed, "Index warm-up finished");
        WarmupReport { attempted, failed }
    }
}

fn distinct_filters(jobs: &[RenderJob]) -> BTreeSet<Option<&'static str>> {
    jobs.iter().map(|job| job.parameter.index_filter()).collect()
}
