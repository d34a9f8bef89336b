//! Render pipeline: turns forecast notifications into published maps.
//!
//! - [`Orchestrator`] consumes deliveries and runs bounded units of work.
//! - [`WarmupCoordinator`] builds the decoder index before dispatch.
//! - [`WorkerPool`] renders and uploads jobs with fixed parallelism.
//! - [`ResultPublisher`] announces every rendered map.
//! - [`DeletionHandler`] removes maps on request.

pub mod deletion;
pub mod orchestrator;
pub mod pool;
pub mod publisher;
pub mod renderer;
pub mod warmup;

pub use deletion::DeletionHandler;
pub use orchestrator::{AckMode, Orchestrator, OrchestratorConfig, DEFAULT_MAX_IN_FLIGHT};
pub use pool::WorkerPool;
pub use publisher::{DrainSummary, ResultPublisher};
pub use renderer::{CommandRenderer, RenderError, RenderRequest, Renderer};
pub use warmup::{WarmupCoordinator, WarmupReport};
