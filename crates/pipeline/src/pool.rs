//! Fixed-size render worker pool.
//!
//! Each job takes a permit, renders, releases the permit and uploads the
//! result. Every submitted job yields exactly one [`JobResult`] on the
//! returned channel, in completion order. A failing or panicking job never
//! affects its siblings. Dropping the receiver aborts the jobs still
//! running, which kills their renderer processes.

use std::any::Any;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use meteomap_core::{JobErrorKind, JobResult, RenderJob, RenderedMap};
use meteomap_storage::ObjectStore;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::renderer::{RenderRequest, Renderer};

/// Number of render slots when none is configured.
pub fn default_size() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

struct PoolShared {
    renderer: Arc<dyn Renderer>,
    store: Arc<dyn ObjectStore>,
    permits: Semaphore,
    work_dir: PathBuf,
}

/// Renders jobs with bounded parallelism and uploads the results.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    size: usize,
}

impl WorkerPool {
    /// `size` is clamped to at least one slot. Rendered files are written
    /// under `work_dir`, which is created on demand.
    pub fn new(
        renderer: Arc<dyn Renderer>,
        store: Arc<dyn ObjectStore>,
        size: usize,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        let size = size.max(1);
        Self {
            shared: Arc::new(PoolShared {
                renderer,
                store,
                permits: Semaphore::new(size),
                work_dir: work_dir.into(),
            }),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Start every job and return the channel their results arrive on.
    ///
    /// The channel closes once the last job has reported.
    pub fn submit(&self, jobs: Vec<RenderJob>) -> mpsc::Receiver<JobResult> {
        let (tx, rx) = mpsc::channel(jobs.len().max(1));

        let mut running = JoinSet::new();
        for job in jobs {
            let shared = Arc::clone(&self.shared);
            running.spawn(async move { shared.run(job).await });
        }
        tokio::spawn(forward(running, tx));

        rx
    }
}

/// Send each result as its job finishes. Stops, aborting what is left, once
/// the receiver is gone.
async fn forward(mut running: JoinSet<JobResult>, tx: mpsc::Sender<JobResult>) {
    loop {
        let joined = tokio::select! {
            _ = tx.closed() => {
                if !running.is_empty() {
                    tracing::warn!(remaining = running.len(), "Result receiver dropped, aborting render jobs");
                }
                running.shutdown().await;
                return;
            }
            joined = running.join_next() => joined,
        };

        match joined {
            None => return,
            Some(Ok(result)) => {
                if tx.send(result).await.is_err() {
                    running.shutdown().await;
                    return;
                }
            }
            // Panics are caught inside the job, so only cancellation lands here.
            Some(Err(e)) => tracing::error!(error = %e, "Render job task failed"),
        }
    }
}

impl PoolShared {
    /// Run one job, turning a panic into an [`JobErrorKind::Aborted`] result.
    async fn run(&self, job: RenderJob) -> JobResult {
        let output = self.work_dir.join(format!("{}.png", Uuid::now_v7()));

        match AssertUnwindSafe(self.execute(job.clone(), &output))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                remove_quietly(&output).await;
                let message = panic_message(panic.as_ref());
                tracing::error!(job = %job, panic = %message, "Render job panicked");
                JobResult::failed(job, JobErrorKind::Aborted, format!("Job panicked: {message}"))
            }
        }
    }

    async fn execute(&self, job: RenderJob, output: &Path) -> JobResult {
        let started = Instant::now();
        let key = job.object_key();

        if let Err(e) = tokio::fs::create_dir_all(&self.work_dir).await {
            return JobResult::failed(
                job,
                JobErrorKind::Render,
                format!("Cannot create work dir {}: {e}", self.work_dir.display()),
            );
        }

        let permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => return JobResult::failed(job, JobErrorKind::Aborted, "Worker pool closed"),
        };

        let request = RenderRequest {
            source_ref: &job.source_ref,
            parameter: job.parameter,
            bounds: job.region.as_ref().map(|r| &r.bounds),
            output,
        };
        let rendered = self.renderer.render(&request).await;
        drop(permit);

        if let Err(e) = rendered {
            remove_quietly(output).await;
            tracing::warn!(job = %job, error = %e, "Render failed");
            return JobResult::failed(job, JobErrorKind::Render, e.to_string());
        }

        let uploaded = self.store.put(output, &key).await;
        remove_quietly(output).await;

        if let Err(e) = uploaded {
            tracing::warn!(job = %job, key = %key, error = %e, "Upload failed");
            return JobResult::failed(job, JobErrorKind::Storage, e.to_string());
        }

        tracing::info!(
            job = %job,
            key = %key,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Map rendered",
        );
        JobResult::Succeeded(RenderedMap::from_job(&job))
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::debug!(path = %path.display(), error = %e, "Could not remove render output");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use meteomap_core::{ForecastHour, Parameter, Region, RegionBounds};
    use meteomap_storage::{InMemoryObjectStore, StorageError};

    use super::*;
    use crate::renderer::RenderError;

    /// Writes a fake PNG unless the job's parameter is `fail`.
    struct StubRenderer {
        fail: Option<Parameter>,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl StubRenderer {
        fn new(fail: Option<Parameter>) -> Self {
            Self {
                fail,
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Renderer for StubRenderer {
        async fn render(&self, request: &RenderRequest<'_>) -> Result<(), RenderError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            if Some(request.parameter) == self.fail {
                return Err(RenderError::Failed {
                    status: "exit status: 1".into(),
                    stderr: "no such field".into(),
                });
            }
            std::fs::write(request.output, b"\x89PNG").map_err(|source| RenderError::Spawn {
                program: "stub".into(),
                source,
            })
        }

        async fn build_index(&self, _source_ref: &str, _filter: Option<&str>) -> Result<(), RenderError> {
            Ok(())
        }
    }

    /// Never finishes a render; counts renders started and renders dropped.
    #[derive(Default)]
    struct HangingRenderer {
        started: AtomicUsize,
        dropped: AtomicUsize,
    }

    struct CountOnDrop<'a>(&'a AtomicUsize);

    impl Drop for CountOnDrop<'_> {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Renderer for HangingRenderer {
        async fn render(&self, _request: &RenderRequest<'_>) -> Result<(), RenderError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            let _guard = CountOnDrop(&self.dropped);
            std::future::pending::<()>().await;
            Ok(())
        }

        async fn build_index(&self, _source_ref: &str, _filter: Option<&str>) -> Result<(), RenderError> {
            Ok(())
        }
    }

    /// Panics while uploading precipitation maps.
    struct PanickingStore {
        inner: InMemoryObjectStore,
    }

    #[async_trait]
    impl ObjectStore for PanickingStore {
        async fn put(&self, local_path: &Path, key: &str) -> Result<(), StorageError> {
            if key.contains("/apcp/") {
                panic!("upload client poisoned for {key}");
            }
            self.inner.put(local_path, key).await
        }

        async fn delete(&self, key: &str) -> Result<(), StorageError> {
            self.inner.delete(key).await
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl ObjectStore for BrokenStore {
        async fn put(&self, _local_path: &Path, key: &str) -> Result<(), StorageError> {
            Err(StorageError::Upload {
                key: key.to_string(),
                message: "connection refused".into(),
            })
        }

        async fn delete(&self, _key: &str) -> Result<(), StorageError> {
            Ok(())
        }
    }

    fn jobs() -> Vec<RenderJob> {
        let regions = [
            Region::new("israel", RegionBounds::new(34.0, 36.5, 29.0, 33.5)),
            Region::new("europe", RegionBounds::new(-10.0, 40.0, 25.0, 70.0)),
        ];
        let mut jobs = Vec::new();
        for parameter in Parameter::ALL {
            for region in &regions {
                jobs.push(RenderJob {
                    source_ref: "/data/gfs.t12z.pgrb2.0p25.f003".into(),
                    model: "gfs".into(),
                    run_date: "20250101".into(),
                    run_hour: "12".into(),
                    parameter,
                    region: Some(region.clone()),
                    forecast_hour: ForecastHour::from_hours(3),
                });
            }
        }
        jobs
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within five seconds");
    }

    async fn collect(mut rx: mpsc::Receiver<JobResult>) -> Vec<JobResult> {
        let mut results = Vec::new();
        while let Some(result) = rx.recv().await {
            results.push(result);
        }
        results
    }

    #[tokio::test]
    async fn every_job_yields_one_result_and_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryObjectStore::new());
        let pool = WorkerPool::new(Arc::new(StubRenderer::new(None)), store.clone(), 2, dir.path());

        let results = collect(pool.submit(jobs())).await;

        assert_eq!(results.len(), 6);
        assert!(results.iter().all(JobResult::is_success));
        assert_eq!(store.keys().len(), 6);
        assert!(store.contains("gfs/20250101/12/apcp/003_europe.png"));
        // Local render files are removed after upload.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn parallelism_is_bounded_by_pool_size() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = Arc::new(StubRenderer::new(None));
        let pool = WorkerPool::new(
            renderer.clone(),
            Arc::new(InMemoryObjectStore::new()),
            2,
            dir.path(),
        );

        collect(pool.submit(jobs())).await;

        assert!(renderer.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn render_failure_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryObjectStore::new());
        let pool = WorkerPool::new(
            Arc::new(StubRenderer::new(Some(Parameter::Apcp))),
            store.clone(),
            4,
            dir.path(),
        );

        let results = collect(pool.submit(jobs())).await;

        let failures: Vec<_> = results.iter().filter(|r| !r.is_success()).collect();
        assert_eq!(failures.len(), 2);
        for failure in failures {
            assert_matches!(
                failure,
                JobResult::Failed { job, kind: JobErrorKind::Render, .. } if job.parameter == Parameter::Apcp
            );
        }
        assert_eq!(store.keys().len(), 4);
    }

    #[tokio::test]
    async fn upload_failure_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let pool = WorkerPool::new(Arc::new(StubRenderer::new(None)), Arc::new(BrokenStore), 2, dir.path());

        let results = collect(pool.submit(jobs())).await;

        assert_eq!(results.len(), 6);
        assert!(results
            .iter()
            .all(|r| matches!(r, JobResult::Failed { kind: JobErrorKind::Storage, .. })));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn empty_submission_closes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let pool = WorkerPool::new(
            Arc::new(StubRenderer::new(None)),
            Arc::new(InMemoryObjectStore::new()),
            0,
            dir.path(),
        );
        assert_eq!(pool.size(), 1);
        assert!(collect(pool.submit(Vec::new())).await.is_empty());
    }

    #[tokio::test]
    async fn panicking_job_still_reports_aborted() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(PanickingStore {
            inner: InMemoryObjectStore::new(),
        });
        let pool = WorkerPool::new(Arc::new(StubRenderer::new(None)), store.clone(), 3, dir.path());

        let results = collect(pool.submit(jobs())).await;

        assert_eq!(results.len(), 6);
        let aborted: Vec<_> = results
            .iter()
            .filter(|r| matches!(r, JobResult::Failed { kind: JobErrorKind::Aborted, .. }))
            .collect();
        assert_eq!(aborted.len(), 2);
        for result in aborted {
            assert_matches!(
                result,
                JobResult::Failed { job, message, .. }
                    if job.parameter == Parameter::Apcp && message.contains("upload client poisoned")
            );
        }
        assert_eq!(store.inner.keys().len(), 4);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn dropping_the_receiver_aborts_running_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = Arc::new(HangingRenderer::default());
        let pool = WorkerPool::new(
            renderer.clone(),
            Arc::new(InMemoryObjectStore::new()),
            2,
            dir.path(),
        );

        let rx = pool.submit(jobs());
        wait_for(|| renderer.started.load(Ordering::SeqCst) == 2).await;
        drop(rx);

        wait_for(|| renderer.dropped.load(Ordering::SeqCst) == 2).await;
        assert_eq!(renderer.started.load(Ordering::SeqCst), 2);
    }
}
