//! Shared fixtures for pipeline integration tests.
//!
//! Wires an [`Orchestrator`] to the in-memory broker, publisher and object
//! store, with a scripted renderer that records every call.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use meteomap_core::{JobDecomposer, Parameter, Region, RegionBounds};
use meteomap_events::memory::{MemoryBroker, MemoryDeliveryStream, MemoryPublisherFactory};
use meteomap_events::BrokerError;
use meteomap_pipeline::{
    DeletionHandler, Orchestrator, OrchestratorConfig, RenderError, RenderRequest, Renderer,
    WarmupCoordinator, WorkerPool,
};
use meteomap_storage::InMemoryObjectStore;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One recorded renderer call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Index(Option<String>),
    Render(Parameter),
}

/// Renderer double: writes a fake PNG, optionally failing or blocking.
pub struct ScriptedRenderer {
    calls: Mutex<Vec<Call>>,
    fail_index: AtomicBool,
    panic_index: AtomicBool,
    fail_parameter: Option<Parameter>,
    gate: watch::Sender<bool>,
}

impl ScriptedRenderer {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_index: AtomicBool::new(false),
            panic_index: AtomicBool::new(false),
            fail_parameter: None,
            gate: watch::Sender::new(true),
        }
    }

    /// Every index build fails.
    pub fn failing_index(self) -> Self {
        self.fail_index.store(true, Ordering::SeqCst);
        self
    }

    /// Every index build panics.
    pub fn panicking_index(self) -> Self {
        self.panic_index.store(true, Ordering::SeqCst);
        self
    }

    /// Every render of `parameter` fails.
    pub fn failing(mut self, parameter: Parameter) -> Self {
        self.fail_parameter = Some(parameter);
        self
    }

    /// Renders block until [`ScriptedRenderer::open_gate`] is called.
    pub fn gated(self) -> Self {
        self.gate.send_replace(false);
        self
    }

    pub fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn render_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Render(_)))
            .count()
    }
}

#[async_trait]
impl Renderer for ScriptedRenderer {
    async fn render(&self, request: &RenderRequest<'_>) -> Result<(), RenderError> {
        self.calls.lock().unwrap().push(Call::Render(request.parameter));

        let mut gate = self.gate.subscribe();
        gate.wait_for(|open| *open).await.unwrap();

        if Some(request.parameter) == self.fail_parameter {
            return Err(RenderError::Failed {
                status: "exit status: 1".into(),
                stderr: format!("cannot plot {}", request.parameter),
            });
        }
        std::fs::write(request.output, b"\x89PNG\r\n").map_err(|source| RenderError::Spawn {
            program: "scripted".into(),
            source,
        })
    }

    async fn build_index(&self, _source_ref: &str, filter: Option<&str>) -> Result<(), RenderError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Index(filter.map(str::to_string)));
        if self.panic_index.load(Ordering::SeqCst) {
            panic!("decoder crashed opening index");
        }
        if self.fail_index.load(Ordering::SeqCst) {
            return Err(RenderError::Failed {
                status: "exit status: 2".into(),
                stderr: "index locked".into(),
            });
        }
        Ok(())
    }
}

pub fn test_regions() -> Vec<Region> {
    vec![
        Region::new("israel", RegionBounds::new(34.0, 36.5, 29.0, 33.5)),
        Region::new("europe", RegionBounds::new(-10.0, 40.0, 25.0, 70.0)),
    ]
}

pub fn gfs_event() -> Vec<u8> {
    data_event("/data/gfs/gfs.t12z.pgrb2.0p25.f003", "gfs", "20250101", "12")
}

pub fn data_event(source: &str, model: &str, run_date: &str, run_hour: &str) -> Vec<u8> {
    serde_json::json!({
        "file_path": source,
        "model": model,
        "run_date": run_date,
        "run_hour": run_hour,
    })
    .to_string()
    .into_bytes()
}

pub fn deletion(key: &str) -> Vec<u8> {
    serde_json::json!({ "url": key }).to_string().into_bytes()
}

/// Everything an orchestrator test needs, already wired together.
pub struct Harness {
    pub broker: MemoryBroker,
    pub publishers: MemoryPublisherFactory,
    pub store: Arc<InMemoryObjectStore>,
    pub renderer: Arc<ScriptedRenderer>,
    pub orchestrator: Arc<Orchestrator>,
    pub cancel: CancellationToken,
    stream: Option<MemoryDeliveryStream>,
    _work_dir: TempDir,
}

impl Harness {
    pub fn new(renderer: ScriptedRenderer, config: OrchestratorConfig) -> Self {
        let (broker, stream) = MemoryBroker::new();
        let publishers = MemoryPublisherFactory::new();
        let store = Arc::new(InMemoryObjectStore::new());
        let renderer = Arc::new(renderer);
        let work_dir = tempfile::tempdir().unwrap();

        let orchestrator = Orchestrator::new(
            config,
            JobDecomposer::new(Parameter::ALL.to_vec(), test_regions()),
            WarmupCoordinator::new(renderer.clone()),
            WorkerPool::new(renderer.clone(), store.clone(), 4, work_dir.path()),
            DeletionHandler::new(store.clone()),
            Arc::new(publishers.clone()),
        );

        Self {
            broker,
            publishers,
            store,
            renderer,
            orchestrator: Arc::new(orchestrator),
            cancel: CancellationToken::new(),
            stream: Some(stream),
            _work_dir: work_dir,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ScriptedRenderer::new(), OrchestratorConfig::default())
    }

    /// Start the consumer loop in the background.
    pub fn spawn(&mut self) -> JoinHandle<Result<(), BrokerError>> {
        let mut stream = self.stream.take().expect("consumer already started");
        let orchestrator = Arc::clone(&self.orchestrator);
        let cancel = self.cancel.clone();
        tokio::spawn(async move { orchestrator.run(&mut stream, cancel).await })
    }

    /// Close the stream and wait for every queued delivery to be processed.
    pub async fn run_to_completion(&mut self) -> Result<(), BrokerError> {
        let handle = self.spawn();
        self.broker.close();
        handle.await.unwrap()
    }

    pub fn published_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .publishers
            .published()
            .iter()
            .map(|m| {
                let body: serde_json::Value = serde_json::from_slice(&m.payload).unwrap();
                body["url"].as_str().unwrap().to_string()
            })
            .collect();
        keys.sort();
        keys
    }
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
