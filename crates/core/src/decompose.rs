//! Expansion of a forecast notification into its job set.

use crate::forecast::forecast_hour;
use crate::job::RenderJob;
use crate::messages::ForecastAvailableEvent;
use crate::parameter::Parameter;
use crate::region::Region;

/// Builds the parameter × region job matrix for a forecast file.
#[derive(Debug, Clone)]
pub struct JobDecomposer {
    parameters: Vec<Parameter>,
    regions: Vec<Region>,
}

impl JobDecomposer {
    /// An empty `regions` list renders one unbounded map per parameter.
    pub fn new(parameters: Vec<Parameter>, regions: Vec<Region>) -> Self {
        Self {
            parameters,
            regions,
        }
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Number of jobs every event expands into.
    pub fn jobs_per_event(&self) -> usize {
        self.parameters.len() * self.regions.len().max(1)
    }

    pub fn decompose(&self, event: &ForecastAvailableEvent) -> Vec<RenderJob> {
        let hour = forecast_hour(&event.model, &event.source_ref);
        let regions: Vec<Option<&Region>> = if self.regions.is_empty() {
            vec![None]
        } else {
            self.regions.iter().map(Some).collect()
        };

        let mut jobs = Vec::with_capacity(self.jobs_per_event());
        for &parameter in &self.parameters {
            for region in &regions {
                jobs.push(RenderJob {
                    source_ref: event.source_ref.clone(),
                    model: event.model.clone(),
                    run_date: event.run_date.clone(),
                    run_hour: event.run_hour.clone(),
                    parameter,
                    region: region.cloned(),
                    forecast_hour: hour.clone(),
                });
            }
        }
        jobs
    }
}
