//! Recognition engine lifecycle.
//!
//! The engine is a process-wide singleton that is expensive to build and not
//! assumed re-entrant. [`RecognitionEngineManager`] owns it behind one async
//! mutex; callers get an [`EngineLease`] that holds the lock for as long as
//! they recognise with it.
//!
//! ## State machine
//!
//! ```text
//!                 acquire()                      incompatibility
//! Uninitialized ───────────▶ Ready ─────────────────────────────┐
//!       ▲                     │ ▲   (degraded == false)         │
//!       │   invalidate()      │ └── rebuild compatible, retry ──┘
//!       └─────────────────────┘     page once, degraded = true
//!       ▲
//!       └── engine panicked
//! ```
//!
//! Once `degraded` is set, further incompatibility signals become page
//! failures. There is never a second automatic rebuild for the same cause.
//!
//! A recognition call runs on the blocking pool and keeps running if the
//! caller's future is dropped. The engine therefore sits behind its own
//! lock, shared with that task: the slot never gives the engine away, and the
//! next lease waits for the orphaned call to finish before using it.

use crate::config::{DevicePreference, PipelineConfig};
use crate::error::{EngineError, PageFailure, PageFailureKind, RecognitionFault};
use crate::ocr::device::DeviceProbe;
use crate::ocr::models::{ModelArtifactSet, ModelRepository};
use crate::pipeline::image::PageImage;
use image::DynamicImage;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// A constructed recognition backend. Used from one thread at a time.
pub trait RecognitionEngine: Send {
    fn recognize(&mut self, image: &DynamicImage) -> Result<String, RecognitionFault>;
}

/// Execution device of a built engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    Accelerated,
    Cpu,
}

/// Construction parameters handed to an [`EngineFactory`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineParams {
    pub device: DeviceMode,
    pub threads: usize,
    pub batch_size: usize,
    /// Native optimized kernels allowed. Off in compatible mode.
    pub optimized: bool,
    pub languages: Vec<String>,
}

impl EngineParams {
    /// Most broadly compatible parameters: CPU, one thread, generic kernels.
    pub fn compatible(languages: Vec<String>) -> Self {
        Self {
            device: DeviceMode::Cpu,
            threads: 1,
            batch_size: 1,
            optimized: false,
            languages,
        }
    }
}

/// Builds engines. Blocking; called on the blocking pool.
pub trait EngineFactory: Send + Sync {
    fn build(
        &self,
        params: &EngineParams,
        artifacts: &ModelArtifactSet,
    ) -> Result<Box<dyn RecognitionEngine>, EngineError>;
}

/// The subset of [`PipelineConfig`] the manager needs.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub device: DevicePreference,
    pub model_id: String,
    pub languages: Vec<String>,
    pub cpu_threads: usize,
    pub accelerated_batch_size: usize,
    pub optimized: bool,
}

impl EngineSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            device: config.device,
            model_id: config.model_id(),
            languages: config.languages.clone(),
            cpu_threads: config.cpu_threads,
            accelerated_batch_size: config.accelerated_batch_size,
            optimized: config.optimized,
        }
    }

    fn params(&self, device: DeviceMode) -> EngineParams {
        let batch_size = match device {
            DeviceMode::Accelerated => self.accelerated_batch_size,
            DeviceMode::Cpu => 1,
        };
        EngineParams {
            device,
            threads: self.cpu_threads,
            batch_size,
            optimized: self.optimized,
            languages: self.languages.clone(),
        }
    }
}

/// Engine handle shared between the slot and in-flight blocking calls.
/// Poisoned once a recognition call panics.
type SharedEngine = Arc<StdMutex<Box<dyn RecognitionEngine>>>;

struct Slot {
    engine: SharedEngine,
    params: EngineParams,
    artifacts: ModelArtifactSet,
}

impl Slot {
    fn new(engine: Box<dyn RecognitionEngine>, params: EngineParams, artifacts: ModelArtifactSet) -> Self {
        Self {
            engine: Arc::new(StdMutex::new(engine)),
            params,
            artifacts,
        }
    }
}

/// Guarded manager state.
struct ManagerState {
    slot: Option<Slot>,
    degraded: bool,
    settings: EngineSettings,
}

/// Owns the recognition engine singleton.
pub struct RecognitionEngineManager {
    state: Arc<Mutex<ManagerState>>,
    probe: Arc<DeviceProbe>,
    models: Arc<ModelRepository>,
    factory: Arc<dyn EngineFactory>,
    acquisitions: AtomicUsize,
    builds: Arc<AtomicUsize>,
}

impl RecognitionEngineManager {
    pub fn new(
        settings: EngineSettings,
        probe: Arc<DeviceProbe>,
        models: Arc<ModelRepository>,
        factory: Arc<dyn EngineFactory>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(ManagerState {
                slot: None,
                degraded: false,
                settings,
            })),
            probe,
            models,
            factory,
            acquisitions: AtomicUsize::new(0),
            builds: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Exclusive access to the engine, building it on first use.
    ///
    /// Waits while another caller holds a lease. `on_download` is invoked if
    /// model artifacts have to be fetched first.
    pub async fn acquire(
        &self,
        on_download: &(dyn Fn(&str) + Send + Sync),
    ) -> Result<EngineLease, EngineError> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        let mut state = Arc::clone(&self.state).lock_owned().await;
        if state.slot.as_ref().is_some_and(|slot| slot.engine.is_poisoned()) {
            warn!("recognition engine lost to a panic; rebuilding");
            state.slot = None;
        }
        if state.slot.is_none() {
            self.initialize(&mut state, on_download).await?;
        }
        Ok(EngineLease {
            state,
            factory: Arc::clone(&self.factory),
            builds: Arc::clone(&self.builds),
        })
    }

    async fn initialize(
        &self,
        state: &mut ManagerState,
        on_download: &(dyn Fn(&str) + Send + Sync),
    ) -> Result<(), EngineError> {
        let settings = state.settings.clone();
        let device = match settings.device {
            DevicePreference::Cpu => DeviceMode::Cpu,
            preference => {
                if self.probe.is_available(false).await {
                    DeviceMode::Accelerated
                } else {
                    if preference == DevicePreference::Gpu {
                        warn!("accelerated device requested but unavailable; using CPU");
                    }
                    DeviceMode::Cpu
                }
            }
        };

        let artifacts = self
            .models
            .ensure_ready(&settings.model_id, on_download)
            .await?;

        let params = if state.degraded {
            EngineParams::compatible(settings.languages.clone())
        } else {
            settings.params(device)
        };

        let built = build(&self.factory, &self.builds, &params, &artifacts).await;
        let (engine, params) = match built {
            Ok(engine) => (engine, params),
            Err(e) if params.device == DeviceMode::Accelerated && !state.degraded => {
                warn!(error = %e, "accelerated engine construction failed; falling back to CPU");
                state.degraded = true;
                let cpu = settings.params(DeviceMode::Cpu);
                (build(&self.factory, &self.builds, &cpu, &artifacts).await?, cpu)
            }
            Err(e) => return Err(e),
        };

        info!(
            device = ?params.device,
            threads = params.threads,
            batch_size = params.batch_size,
            optimized = params.optimized,
            model = %artifacts.id,
            "recognition engine ready"
        );
        state.slot = Some(Slot::new(engine, params, artifacts));
        Ok(())
    }

    /// Drop the engine and reset the downgrade. The next `acquire` rebuilds.
    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        state.slot = None;
        state.degraded = false;
        debug!("recognition engine invalidated");
    }

    /// [`invalidate`](Self::invalidate) and rebuild with new settings, e.g.
    /// another device preference or model tier.
    pub async fn invalidate_with(&self, settings: EngineSettings) {
        let mut state = self.state.lock().await;
        info!(device = ?settings.device, model = %settings.model_id, "recognition engine reconfigured");
        state.settings = settings;
        state.slot = None;
        state.degraded = false;
    }

    /// Settings the next build will use.
    pub async fn settings(&self) -> EngineSettings {
        self.state.lock().await.settings.clone()
    }

    pub async fn is_degraded(&self) -> bool {
        self.state.lock().await.degraded
    }

    /// Active device, if an engine is built.
    pub async fn device(&self) -> Option<DeviceMode> {
        self.state.lock().await.slot.as_ref().map(|s| s.params.device)
    }

    /// Number of `acquire` calls so far.
    pub fn acquire_count(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// Number of engine constructions so far, including failed ones.
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

async fn build(
    factory: &Arc<dyn EngineFactory>,
    builds: &AtomicUsize,
    params: &EngineParams,
    artifacts: &ModelArtifactSet,
) -> Result<Box<dyn RecognitionEngine>, EngineError> {
    builds.fetch_add(1, Ordering::SeqCst);
    let factory = Arc::clone(factory);
    let params = params.clone();
    let artifacts = artifacts.clone();
    tokio::task::spawn_blocking(move || factory.build(&params, &artifacts))
        .await
        .map_err(|e| EngineError::Panicked(e.to_string()))?
}

/// Exclusive, lock-holding access to the engine.
pub struct EngineLease {
    state: OwnedMutexGuard<ManagerState>,
    factory: Arc<dyn EngineFactory>,
    builds: Arc<AtomicUsize>,
}

impl EngineLease {
    pub fn device(&self) -> Option<DeviceMode> {
        self.state.slot.as_ref().map(|s| s.params.device)
    }

    pub fn is_degraded(&self) -> bool {
        self.state.degraded
    }

    /// Recognise one page.
    ///
    /// An incompatibility before the downgrade is spent rebuilds the engine
    /// in compatible mode and retries this page once.
    pub async fn recognize(&mut self, page: &PageImage) -> Result<String, PageFailure> {
        let mut retried = false;
        loop {
            let fault = match self.run_once(page).await? {
                Ok(text) => return Ok(text),
                Err(fault) => fault,
            };
            match fault {
                RecognitionFault::Failed(detail) => {
                    return Err(failure(page, PageFailureKind::Recognition, detail))
                }
                RecognitionFault::Incompatible(detail) if self.state.degraded || retried => {
                    warn!(page = page.page, %detail, "incompatibility after downgrade; page failed");
                    return Err(failure(page, PageFailureKind::Incompatible, detail));
                }
                RecognitionFault::Incompatible(detail) => {
                    warn!(page = page.page, %detail, "engine incompatibility; downgrading to compatible mode");
                    self.downgrade(page).await?;
                    retried = true;
                }
            }
        }
    }

    /// One attempt on the blocking pool. The outer error means the engine
    /// was lost (panic); the inner one is the engine's own verdict.
    async fn run_once(
        &mut self,
        page: &PageImage,
    ) -> Result<Result<String, RecognitionFault>, PageFailure> {
        let engine = self
            .state
            .slot
            .as_ref()
            .map(|slot| Arc::clone(&slot.engine))
            .ok_or_else(|| failure(page, PageFailureKind::Recognition, "engine not initialized".into()))?;

        let image = Arc::clone(&page.image);
        let joined = tokio::task::spawn_blocking(move || {
            let mut guard = engine.lock().ok()?;
            let outcome = guard.recognize(&image);
            Some(outcome)
        })
        .await;

        match joined {
            Ok(Some(outcome)) => Ok(outcome),
            Ok(None) => {
                warn!(page = page.page, "engine poisoned by an earlier panic; engine reset");
                self.state.slot = None;
                Err(failure(page, PageFailureKind::Recognition, "engine lost to an earlier panic".into()))
            }
            Err(e) => {
                warn!(page = page.page, error = %e, "recognition panicked; engine reset");
                self.state.slot = None;
                Err(failure(page, PageFailureKind::Recognition, format!("engine panicked: {e}")))
            }
        }
    }

    async fn downgrade(&mut self, page: &PageImage) -> Result<(), PageFailure> {
        self.state.degraded = true;
        // Cleared before the rebuild await so a cancelled rebuild leaves the
        // next `acquire` to build in compatible mode.
        let Some(slot) = self.state.slot.take() else {
            return Err(failure(page, PageFailureKind::Incompatible, "engine lost".into()));
        };
        let params = EngineParams::compatible(slot.params.languages.clone());
        let artifacts = slot.artifacts;
        let built = build(&self.factory, &self.builds, &params, &artifacts).await;
        match built {
            Ok(engine) => {
                info!("recognition engine rebuilt in compatible mode");
                self.state.slot = Some(Slot::new(engine, params, artifacts));
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "compatible engine construction failed");
                self.state.slot = None;
                Err(failure(page, PageFailureKind::Incompatible, e.to_string()))
            }
        }
    }
}

fn failure(page: &PageImage, kind: PageFailureKind, detail: String) -> PageFailure {
    PageFailure {
        page: page.page,
        kind,
        detail,
    }
}
