//! Domain types for the meteomap render orchestrator.
//!
//! Pure functions only: forecast-hour extraction, job decomposition, the
//! object-key layout, and the event-bus message bodies. No I/O.

pub mod decompose;
pub mod error;
pub mod forecast;
pub mod job;
pub mod messages;
pub mod parameter;
pub mod region;

pub use decompose::JobDecomposer;
pub use error::CoreError;
pub use forecast::{forecast_hour, try_forecast_hour, ForecastHour};
pub use job::{object_key, JobErrorKind, JobResult, RenderJob, RenderedMap};
pub use messages::{DeletionRequest, ForecastAvailableEvent, MapGeneratedEvent, WorkItem};
pub use parameter::Parameter;
pub use region::{Region, RegionBounds};
