use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Sender, TrySendError};
use tracing::{debug, info, warn, Span};

use crate::control::{lock, read, Shared};
use crate::error::Error;
use crate::frame::Frame;

const FRAME_PAUSE: Duration = Duration::from_millis(5);
const RETRY_PAUSE: Duration = Duration::from_millis(10);
const NO_CAMERA_PAUSE: Duration = Duration::from_millis(50);

enum Step {
    Processed,
    NoFrame,
    NoCamera,
}

/// Body of the capture thread. Runs until `alive` is cleared; no error ends
/// it early.
pub(crate) fn run(shared: Arc<Shared>, alive: Arc<AtomicBool>, span: Span, done: Sender<()>) {
    let _enter = span.enter();
    info!("capture loop started");

    while alive.load(Ordering::SeqCst) {
        let pause = match step(&shared, &alive) {
            Ok(Step::Processed) => FRAME_PAUSE,
            Ok(Step::NoFrame) => RETRY_PAUSE,
            Ok(Step::NoCamera) => NO_CAMERA_PAUSE,
            Err(Error::FrameAcquisition(reason)) => {
                debug!(%reason, "frame acquisition failed");
                RETRY_PAUSE
            }
            Err(err) => {
                warn!(error = %err, "capture iteration failed");
                RETRY_PAUSE
            }
        };

        thread::sleep(pause);
    }

    info!("capture loop finished");
    let _ = done.send(());
}

fn step(shared: &Shared, alive: &AtomicBool) -> Result<Step, Error> {
    let gray = {
        let mut camera = lock(&shared.camera);
        match camera.as_mut() {
            Some(camera) => camera.read()?,
            None => return Ok(Step::NoCamera),
        }
    };

    let Some(mut gray) = gray else {
        return Ok(Step::NoFrame);
    };

    let timestamp = shared.now();
    let config = read(&shared.config).clone();

    if config.enhance_contrast {
        gray.equalize();
    }

    // in-flight detection keeps the engine it started with
    let engine = read(&shared.engine).clone();
    let observations = lock(&engine).detect(&gray)?;

    let frame = Frame {
        dims: (gray.width(), gray.height()),
        observations,
        timestamp,
    };

    let allowed = read(&shared.allowed).clone();
    let report = {
        let mut scene = lock(&shared.scene);

        // a loop detached by stop() must not touch the next session's state
        if !alive.load(Ordering::SeqCst) {
            return Ok(Step::NoFrame);
        }
        scene.update(&frame, &config, allowed.as_deref())
    };

    if alive.load(Ordering::SeqCst) && shared.enabled.load(Ordering::SeqCst) {
        for lap in report.laps {
            match shared.laps.try_send(lap) {
                Ok(()) => {}
                Err(TrySendError::Full(lap)) => {
                    warn!(id = lap.marker_id, duration = lap.duration, "lap queue full, dropping lap")
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
    }

    let jpeg = match lock(&shared.camera).as_mut() {
        Some(camera) => camera.encode(&report.overlay)?,
        None => return Ok(Step::Processed),
    };

    *lock(&shared.latest_frame) = Some(jpeg.into());

    Ok(Step::Processed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Mutex, RwLock};
    use std::time::Instant;

    use crossbeam_channel::Receiver;
    use nalgebra as na;
    use ndarray::Array2;

    use crate::camera::{Camera, CameraProperty};
    use crate::config::{DetectorConfig, FinishLine};
    use crate::detection::MarkerObservation;
    use crate::detector::MarkerEngine;
    use crate::frame::GrayFrame;
    use crate::lap_timer::LapEvent;
    use crate::scene::{Overlay, Scene};

    struct StillCamera;

    impl Camera for StillCamera {
        fn read(&mut self) -> Result<Option<GrayFrame>, Error> {
            Ok(Some(GrayFrame::new(Array2::zeros((8, 8)))))
        }

        fn set_property(&mut self, _property: CameraProperty, _value: f64) -> Result<(), Error> {
            Ok(())
        }

        fn encode(&mut self, _overlay: &Overlay) -> Result<Vec<u8>, Error> {
            Ok(vec![0xff, 0xd8])
        }

        fn release(&mut self) {}
    }

    /// Marker 1 alternates sides of the default finish line every frame.
    struct Shuttle {
        below: bool,
    }

    impl MarkerEngine for Shuttle {
        fn detect(&mut self, _frame: &GrayFrame) -> Result<Vec<MarkerObservation>, Error> {
            self.below = !self.below;
            let y = if self.below { 260.0 } else { 200.0 };

            Ok(vec![MarkerObservation::square(1, na::Point2::new(320.0, y), 20.0, 50.0)])
        }
    }

    fn shared() -> (Shared, Receiver<LapEvent>) {
        let (tx, rx) = crossbeam_channel::bounded(16);
        let config = DetectorConfig {
            min_detection_frames: 1,
            allow_quick_pass: false,
            min_lap_time: 1e-6,
            ..DetectorConfig::default()
        };

        let engine: Box<dyn MarkerEngine> = Box::new(Shuttle { below: false });
        let shared = Shared {
            running: AtomicBool::new(true),
            enabled: AtomicBool::new(true),
            epoch: Instant::now(),
            scene: Mutex::new(Scene::new(FinishLine::default())),
            config: RwLock::new(config),
            allowed: RwLock::new(None::<Arc<HashSet<_>>>),
            engine: RwLock::new(Arc::new(Mutex::new(engine))),
            camera: Mutex::new(Some(Box::new(StillCamera) as Box<dyn Camera>)),
            latest_frame: Mutex::new(None),
            laps: tx,
        };

        (shared, rx)
    }

    #[test]
    fn live_step_feeds_scene_and_laps() {
        let (shared, laps) = shared();
        let alive = AtomicBool::new(true);

        for _ in 0..3 {
            assert!(matches!(step(&shared, &alive), Ok(Step::Processed)));
            thread::sleep(Duration::from_millis(2));
        }

        assert!(laps.try_recv().is_ok());
        assert!(lock(&shared.latest_frame).is_some());
    }

    #[test]
    fn detached_step_leaves_scene_alone() {
        let (shared, laps) = shared();
        let alive = AtomicBool::new(false);

        for _ in 0..3 {
            assert!(matches!(step(&shared, &alive), Ok(Step::NoFrame)));
        }

        assert!(laps.try_recv().is_err());
        assert!(lock(&shared.scene).tracker().is_empty());
        assert!(lock(&shared.latest_frame).is_none());
    }
}
