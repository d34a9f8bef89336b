//! Render jobs, their results, and the object-key layout.

use std::fmt;

use crate::forecast::ForecastHour;
use crate::parameter::Parameter;
use crate::region::Region;

/// Build the storage key for one rendered map.
///
/// Layout: `{model}/{run_date}/{run_hour}/{parameter}/{forecast_hour}[_{region}].png`.
/// The key is a pure function of its inputs, so re-rendering the same
/// forecast file overwrites instead of duplicating.
pub fn object_key(
    model: &str,
    run_date: &str,
    run_hour: &str,
    parameter: Parameter,
    forecast_hour: &ForecastHour,
    region: Option<&str>,
) -> String {
    match region {
        Some(region) => {
            format!("{model}/{run_date}/{run_hour}/{parameter}/{forecast_hour}_{region}.png")
        }
        None => format!("{model}/{run_date}/{run_hour}/{parameter}/{forecast_hour}.png"),
    }
}

/// One cell of the parameter × region matrix for a forecast file.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderJob {
    pub source_ref: String,
    pub model: String,
    pub run_date: String,
    pub run_hour: String,
    pub parameter: Parameter,
    /// `None` renders the unbounded (global) map.
    pub region: Option<Region>,
    pub forecast_hour: ForecastHour,
}

impl RenderJob {
    pub fn region_name(&self) -> Option<&str> {
        self.region.as_ref().map(|r| r.name.as_str())
    }

    pub fn object_key(&self) -> String {
        object_key(
            &self.model,
            &self.run_date,
            &self.run_hour,
            self.parameter,
            &self.forecast_hour,
            self.region_name(),
        )
    }
}

impl fmt::Display for RenderJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}@{}",
            self.model,
            self.run_date,
            self.run_hour,
            self.parameter,
            self.region_name().unwrap_or("global"),
        )
    }
}

/// A rendered map that has been uploaded.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedMap {
    pub object_key: String,
    pub model: String,
    pub run_date: String,
    pub run_hour: String,
    pub parameter: Parameter,
    pub forecast_hour: ForecastHour,
    pub region: Option<String>,
}

impl RenderedMap {
    pub fn from_job(job: &RenderJob) -> Self {
        Self {
            object_key: job.object_key(),
            model: job.model.clone(),
            run_date: job.run_date.clone(),
            run_hour: job.run_hour.clone(),
            parameter: job.parameter,
            forecast_hour: job.forecast_hour.clone(),
            region: job.region_name().map(str::to_owned),
        }
    }
}

/// Which stage of a job failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobErrorKind {
    /// The renderer could not produce the image.
    Render,
    /// The image was produced but could not be stored.
    Storage,
    /// The job never ran to completion (worker task panicked or the pool
    /// was shut down).
    Aborted,
}

impl JobErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobErrorKind::Render => "render",
            JobErrorKind::Storage => "storage",
            JobErrorKind::Aborted => "aborted",
        }
    }
}

impl fmt::Display for JobErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of exactly one [`RenderJob`].
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    Succeeded(RenderedMap),
    Failed {
        job: RenderJob,
        kind: JobErrorKind,
        message: String,
    },
}

impl JobResult {
    pub fn failed(job: RenderJob, kind: JobErrorKind, message: impl Into<String>) -> Self {
        JobResult::Failed {
            job,
            kind,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobResult::Succeeded(_))
    }
}
