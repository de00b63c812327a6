use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde_json::Value;
use tracing::{debug, info, info_span, warn, Span};

use crate::camera::{
    apply_properties, Camera, CameraOpener, FocusSweep, FocusTuning, FocusTuningFailure,
    PropertyReport,
};
use crate::capture;
use crate::config::{CameraConfig, DetectorConfig, FinishLine, Settings};
use crate::detector::{self, EngineBuilder, MarkerEngine};
use crate::error::Error;
use crate::lap_timer::LapEvent;
use crate::lock::PortLock;
use crate::scene::{ResetScope, Scene};
use crate::MarkerId;

const JOIN_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) type EngineHandle = Arc<Mutex<Box<dyn MarkerEngine>>>;

#[inline]
pub(crate) fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[inline]
pub(crate) fn read<T: ?Sized>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

#[inline]
pub(crate) fn write<T: ?Sized>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the control surface and the capture thread.
pub(crate) struct Shared {
    pub running: AtomicBool,
    pub enabled: AtomicBool,
    pub epoch: Instant,
    pub scene: Mutex<Scene>,
    pub config: RwLock<DetectorConfig>,
    pub allowed: RwLock<Option<Arc<HashSet<MarkerId>>>>,
    pub engine: RwLock<EngineHandle>,
    pub camera: Mutex<Option<Box<dyn Camera>>>,
    pub latest_frame: Mutex<Option<Arc<[u8]>>>,
    pub laps: Sender<LapEvent>,
}

impl Shared {
    /// Seconds since the detector was created.
    #[inline]
    pub fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }
}

/// Device and detector factories.
pub struct Backend {
    pub camera: CameraOpener,
    pub engine: EngineBuilder,
}

#[cfg(feature = "camera")]
impl Backend {
    /// OpenCV capture with AprilTag detection.
    pub fn opencv() -> Self {
        Self {
            camera: crate::opencv_camera::OpenCvCamera::opener(),
            engine: crate::detector::AprilTagEngine::builder(),
        }
    }
}

struct Session {
    port_lock: PortLock,
    alive: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

/// Runtime control surface of the lap timing detector.
///
/// Every operation is idempotent and may be called from any thread.
pub struct LapDetector {
    shared: Arc<Shared>,
    backend: Backend,
    camera_config: Mutex<CameraConfig>,
    lock_port: u16,
    session: Mutex<Option<Session>>,
    laps: Receiver<LapEvent>,
    focus: FocusSweep,
    span: Span,
}

impl LapDetector {
    pub fn new(settings: Settings, backend: Backend) -> Result<Self, Error> {
        settings.detector.validate()?;

        let engine = (backend.engine)(&settings.detector.engine)?;
        let (tx, rx) = crossbeam_channel::bounded(settings.lap_queue.max(1));
        let span = info_span!("lap_detector", camera = settings.camera.index);

        let shared = Shared {
            running: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
            epoch: Instant::now(),
            scene: Mutex::new(Scene::new(settings.finish_line)),
            config: RwLock::new(settings.detector),
            allowed: RwLock::new(None),
            engine: RwLock::new(Arc::new(Mutex::new(engine))),
            camera: Mutex::new(None),
            latest_frame: Mutex::new(None),
            laps: tx,
        };

        Ok(Self {
            shared: Arc::new(shared),
            backend,
            camera_config: Mutex::new(settings.camera),
            lock_port: settings.lock_port,
            session: Mutex::new(None),
            laps: rx,
            focus: FocusSweep::default(),
            span,
        })
    }

    /// Routes this detector's logs through `span` instead of the default
    /// `lap_detector` span.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn with_focus_sweep(mut self, sweep: FocusSweep) -> Self {
        self.focus = sweep;
        self
    }

    /// Takes the camera and starts the capture loop. Returns the property
    /// report of the freshly opened device, or an empty report when the loop
    /// was already running.
    pub fn start(&self) -> Result<PropertyReport, Error> {
        let _enter = self.span.enter();
        let mut session = lock(&self.session);

        if session.is_some() {
            debug!("start requested while running");
            return Ok(PropertyReport::default());
        }

        let port_lock = PortLock::acquire(self.lock_port).map_err(|err| {
            warn!(error = %err, "not starting, camera is owned by another process");
            err
        })?;

        let camera_config = lock(&self.camera_config).clone();
        let mut camera = (self.backend.camera)(&camera_config).map_err(|err| {
            warn!(error = %err, "camera could not be opened");
            match err {
                Error::CameraUnavailable(reason) => Error::CameraUnavailable(reason),
                other => Error::CameraUnavailable(other.to_string()),
            }
        })?;

        let report = apply_properties(camera.as_mut(), &camera_config.properties());
        if !report.is_clean() {
            warn!(failed = report.failed.len(), "some camera properties were not applied");
        }

        *lock(&self.shared.camera) = Some(camera);

        let alive = Arc::new(AtomicBool::new(true));
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);

        let spawned = {
            let shared = self.shared.clone();
            let alive = alive.clone();
            let span = self.span.clone();

            thread::Builder::new()
                .name("laptrack-capture".into())
                .spawn(move || capture::run(shared, alive, span, done_tx))
        };

        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                if let Some(mut camera) = lock(&self.shared.camera).take() {
                    camera.release();
                }
                return Err(err.into());
            }
        };

        self.shared.enabled.store(true, Ordering::SeqCst);
        self.shared.running.store(true, Ordering::SeqCst);

        *session = Some(Session {
            port_lock,
            alive,
            handle,
            done: done_rx,
        });

        info!(camera = camera_config.index, port = self.lock_port, "detector started");

        Ok(report)
    }

    /// Stops the loop and releases the camera and the lock. Safe to call at
    /// any time.
    pub fn stop(&self) {
        let _enter = self.span.enter();

        // no lap may slip out once stop was requested
        self.shared.enabled.store(false, Ordering::SeqCst);

        let mut session = lock(&self.session);
        if let Some(s) = session.as_ref() {
            s.alive.store(false, Ordering::SeqCst);
        }
        self.shared.running.store(false, Ordering::SeqCst);

        if let Some(mut camera) = lock(&self.shared.camera).take() {
            camera.release();
        }

        let Some(Session {
            port_lock,
            handle,
            done,
            ..
        }) = session.take()
        else {
            return;
        };

        drop(port_lock);

        match done.recv_timeout(JOIN_TIMEOUT) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = handle.join();
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("capture loop did not exit in time, detaching it");
            }
        }

        info!("detector stopped");
    }

    #[inline]
    pub fn status(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
    }

    /// Hides or shows lap events without touching the timing state.
    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::SeqCst);
    }

    /// `None` lets every marker through.
    pub fn set_allowed_markers(&self, ids: Option<HashSet<MarkerId>>) {
        debug!(parent: &self.span, count = ids.as_ref().map(HashSet::len), "allowed markers replaced");
        *write(&self.shared.allowed) = ids.map(Arc::new);
    }

    pub fn allowed_markers(&self) -> Option<HashSet<MarkerId>> {
        read(&self.shared.allowed).as_deref().cloned()
    }

    pub fn detector_config(&self) -> DetectorConfig {
        read(&self.shared.config).clone()
    }

    /// Thresholds plus the allowed markers as one key-value map.
    pub fn config_snapshot(&self) -> Value {
        let mut snapshot = read(&self.shared.config).snapshot();

        if let Some(fields) = snapshot.as_object_mut() {
            let mut allowed: Option<Vec<MarkerId>> =
                self.allowed_markers().map(|ids| ids.into_iter().collect());
            if let Some(ids) = allowed.as_mut() {
                ids.sort_unstable();
            }
            fields.insert("allowed_markers".into(), serde_json::json!(allowed));
        }

        snapshot
    }

    /// Merges a partial config. Engine parameters that changed produce a new
    /// engine; if it cannot be built the previous engine and its parameters
    /// stay in place.
    pub fn update_detector_config(&self, patch: &Value) -> Result<Value, Error> {
        let _enter = self.span.enter();
        let mut config = write(&self.shared.config);
        let mut merged = config.merge(patch)?;

        if let Some(change) = detector::reconfigure(&config.engine, &merged.engine) {
            match (self.backend.engine)(&change.params) {
                Ok(engine) => {
                    *write(&self.shared.engine) = Arc::new(Mutex::new(engine));
                    info!(params = ?change.params, "detection engine replaced");
                }
                Err(err) => {
                    let err = Error::EngineReconfiguration(err.to_string());
                    warn!(error = %err, "keeping previous detection engine");
                    merged.engine = config.engine.clone();
                }
            }
        }

        *config = merged;
        debug!(config = ?*config, "detector config updated");

        Ok(config.snapshot())
    }

    pub fn finish_line(&self) -> FinishLine {
        *lock(&self.shared.scene).finish_line()
    }

    pub fn set_finish_line(&self, line: FinishLine) {
        info!(parent: &self.span, line = ?line, "finish line replaced");
        lock(&self.shared.scene).set_finish_line(line);
    }

    pub fn camera_config(&self) -> CameraConfig {
        lock(&self.camera_config).clone()
    }

    /// Stores new camera settings; a running detector is restarted so they
    /// take effect.
    pub fn set_camera_config(&self, config: CameraConfig) -> Result<PropertyReport, Error> {
        *lock(&self.camera_config) = config;

        if !self.status() {
            return Ok(PropertyReport::default());
        }

        let enabled = self.is_enabled();
        self.stop();
        let report = self.start()?;
        self.set_enabled(enabled);

        Ok(report)
    }

    /// Clears tracked positions and lap clocks, for one marker or all.
    pub fn reset(&self, scope: ResetScope) {
        debug!(parent: &self.span, ?scope, "timing state reset");
        lock(&self.shared.scene).reset(scope);
    }

    /// Sweeps manual focus and keeps the sharpest setting. Only possible
    /// while the camera is running; the capture loop pauses meanwhile.
    pub fn auto_tune_focus(&self) -> Result<FocusTuning, FocusTuningFailure> {
        let _enter = self.span.enter();

        if !self.status() {
            return Err(FocusTuningFailure::CameraNotOpen);
        }

        let mut guard = lock(&self.shared.camera);
        let camera = guard.as_mut().ok_or(FocusTuningFailure::CameraNotOpen)?;

        self.focus.run(camera.as_mut())
    }

    /// Most recent annotated JPEG, if any frame was encoded yet.
    pub fn latest_frame(&self) -> Option<Arc<[u8]>> {
        lock(&self.shared.latest_frame).clone()
    }

    /// Lap events; every receiver clone competes for the same queue.
    pub fn laps(&self) -> Receiver<LapEvent> {
        self.laps.clone()
    }

    /// Seconds on the detector clock, the time base of lap timestamps.
    pub fn now(&self) -> f64 {
        self.shared.now()
    }
}

impl Drop for LapDetector {
    fn drop(&mut self) {
        self.stop();
    }
}
