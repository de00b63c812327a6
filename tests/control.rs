use std::collections::{HashSet, VecDeque};
use std::net::{Ipv4Addr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use laptrack::camera::CameraOpener;
use laptrack::detector::EngineBuilder;
use laptrack::scene::Overlay;
use laptrack::{
    Backend, Camera, CameraProperty, Error, FocusTuningFailure, GrayFrame, LapDetector,
    MarkerEngine, MarkerObservation, ResetScope, Settings,
};
use nalgebra as na;
use ndarray::Array2;
use serde_json::json;

/// Marker positions handed out one frame at a time.
#[derive(Clone, Default)]
struct Script {
    frames: Arc<Mutex<VecDeque<Vec<MarkerObservation>>>>,
}

impl Script {
    /// Queues one frame per `y`, marker 1 at x = 320 (the default finish line
    /// runs along y = 240).
    fn push(&self, ys: &[f32]) {
        let mut frames = self.frames.lock().unwrap();
        for &y in ys {
            frames.push_back(vec![MarkerObservation::square(
                1,
                na::Point2::new(320.0, y),
                20.0,
                50.0,
            )]);
        }
    }

    fn wait_drained(&self) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !self.frames.lock().unwrap().is_empty() {
            assert!(Instant::now() < deadline, "script was not consumed");
            thread::sleep(Duration::from_millis(5));
        }

        // let the last popped frame go through the scene
        thread::sleep(Duration::from_millis(50));
    }
}

struct ScriptedEngine {
    script: Script,
}

impl MarkerEngine for ScriptedEngine {
    fn detect(&mut self, _frame: &GrayFrame) -> Result<Vec<MarkerObservation>, Error> {
        Ok(self.script.frames.lock().unwrap().pop_front().unwrap_or_default())
    }
}

struct FakeCamera {
    released: Arc<AtomicBool>,
}

impl Camera for FakeCamera {
    fn read(&mut self) -> Result<Option<GrayFrame>, Error> {
        thread::sleep(Duration::from_millis(10));
        Ok(Some(GrayFrame::new(Array2::zeros((48, 64)))))
    }

    fn set_property(&mut self, property: CameraProperty, value: f64) -> Result<(), Error> {
        match property {
            CameraProperty::Gain => Err(Error::PropertyRejected { property, value }),
            _ => Ok(()),
        }
    }

    fn encode(&mut self, overlay: &Overlay) -> Result<Vec<u8>, Error> {
        Ok(format!("jpeg:{}", overlay.markers.len()).into_bytes())
    }

    fn release(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

struct Rig {
    script: Script,
    released: Arc<AtomicBool>,
    opened: Arc<AtomicUsize>,
    built: Arc<AtomicUsize>,
}

impl Rig {
    fn new() -> Self {
        Self {
            script: Script::default(),
            released: Arc::new(AtomicBool::new(false)),
            opened: Arc::new(AtomicUsize::new(0)),
            built: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Engines with 99 threads refuse to build.
    fn backend(&self) -> Backend {
        let released = self.released.clone();
        let opened = self.opened.clone();
        let camera: CameraOpener = Box::new(move |_config| {
            opened.fetch_add(1, Ordering::SeqCst);
            released.store(false, Ordering::SeqCst);
            Ok(Box::new(FakeCamera {
                released: released.clone(),
            }) as Box<dyn Camera>)
        });

        let script = self.script.clone();
        let built = self.built.clone();
        let engine: EngineBuilder = Box::new(move |params| {
            if params.threads == 99 {
                return Err(Error::EngineReconfiguration("too many threads".into()));
            }

            built.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedEngine {
                script: script.clone(),
            }) as Box<dyn MarkerEngine>)
        });

        Backend { camera, engine }
    }
}

fn free_port() -> u16 {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    listener.local_addr().unwrap().port()
}

fn port_is_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

fn settings(port: u16) -> Settings {
    let mut settings = Settings::default();
    settings.lock_port = port;
    settings.camera.gain = Some(3);
    settings.detector.min_detection_frames = 1;
    settings.detector.allow_quick_pass = false;
    settings.detector.min_lap_time = 0.01;
    settings
}

#[test]
fn start_is_idempotent_and_stop_frees_the_port() {
    let rig = Rig::new();
    let port = free_port();
    let detector = LapDetector::new(settings(port), rig.backend()).unwrap();

    assert!(!detector.status());

    let report = detector.start().unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, CameraProperty::Gain);
    assert!(detector.status());
    assert!(!port_is_free(port));

    let again = detector.start().unwrap();
    assert!(again.applied.is_empty() && again.failed.is_empty());
    assert_eq!(rig.opened.load(Ordering::SeqCst), 1);

    detector.stop();
    assert!(!detector.status());
    assert!(rig.released.load(Ordering::SeqCst));
    assert!(port_is_free(port));

    detector.stop();
    assert!(!detector.status());

    detector.start().unwrap();
    assert!(detector.status());
    assert!(!port_is_free(port));
    assert_eq!(rig.opened.load(Ordering::SeqCst), 2);
}

#[test]
fn second_instance_cannot_take_the_camera() {
    let port = free_port();
    let first_rig = Rig::new();
    let second_rig = Rig::new();

    let first = LapDetector::new(settings(port), first_rig.backend()).unwrap();
    let second = LapDetector::new(settings(port), second_rig.backend()).unwrap();

    first.start().unwrap();

    assert!(matches!(second.start(), Err(Error::CameraUnavailable(_))));
    assert!(!second.status());
    assert_eq!(second_rig.opened.load(Ordering::SeqCst), 0);

    first.stop();
    second.start().unwrap();
    assert!(second.status());
}

#[test]
fn failed_open_leaves_detector_stopped() {
    let port = free_port();
    let camera: CameraOpener =
        Box::new(|config| Err(Error::CameraUnavailable(format!("no device {}", config.index))));
    let backend = Backend {
        camera,
        engine: Rig::new().backend().engine,
    };

    let detector = LapDetector::new(settings(port), backend).unwrap();

    assert!(matches!(detector.start(), Err(Error::CameraUnavailable(_))));
    assert!(!detector.status());
    assert!(port_is_free(port));
}

#[test]
fn crossings_become_lap_events() {
    let rig = Rig::new();
    let detector = LapDetector::new(settings(free_port()), rig.backend()).unwrap();
    let laps = detector.laps();

    detector.start().unwrap();
    rig.script.push(&[200.0, 260.0, 200.0]);

    let lap = laps.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(lap.marker_id, 1);
    assert!(lap.duration >= 0.01);
    assert!(lap.timestamp <= detector.now());

    rig.script.wait_drained();
    assert!(laps.try_recv().is_err());

    let frame = detector.latest_frame().unwrap();
    assert!(frame.starts_with(b"jpeg:"));
}

#[test]
fn disabled_detector_keeps_timing_but_hides_laps() {
    let rig = Rig::new();
    let detector = LapDetector::new(settings(free_port()), rig.backend()).unwrap();
    let laps = detector.laps();

    detector.start().unwrap();
    detector.set_enabled(false);
    assert!(!detector.is_enabled());

    rig.script.push(&[200.0, 260.0]);
    rig.script.wait_drained();
    thread::sleep(Duration::from_millis(300));
    rig.script.push(&[200.0]);
    rig.script.wait_drained();

    assert!(laps.try_recv().is_err());

    detector.set_enabled(true);
    rig.script.push(&[260.0]);

    // measured from the hidden lap, not from the start crossing
    let lap = laps.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(lap.duration < 0.25, "duration {}", lap.duration);
}

#[test]
fn excluded_markers_are_not_timed() {
    let rig = Rig::new();
    let detector = LapDetector::new(settings(free_port()), rig.backend()).unwrap();
    let laps = detector.laps();

    detector.set_allowed_markers(Some([7].into_iter().collect()));
    assert_eq!(detector.allowed_markers(), Some(HashSet::from([7])));
    assert_eq!(detector.config_snapshot()["allowed_markers"], json!([7]));

    detector.start().unwrap();
    rig.script.push(&[200.0, 260.0, 200.0, 260.0]);
    rig.script.wait_drained();

    assert!(laps.try_recv().is_err());

    detector.set_allowed_markers(None);
    assert_eq!(detector.config_snapshot()["allowed_markers"], json!(null));
}

#[test]
fn reset_restarts_the_lap_clock() {
    let rig = Rig::new();
    let detector = LapDetector::new(settings(free_port()), rig.backend()).unwrap();
    let laps = detector.laps();

    detector.start().unwrap();
    rig.script.push(&[200.0, 260.0]);
    rig.script.wait_drained();

    detector.reset(ResetScope::All);

    // first crossing after the reset only starts the clock again
    rig.script.push(&[200.0, 260.0]);
    rig.script.wait_drained();
    assert!(laps.try_recv().is_err());

    rig.script.push(&[200.0]);
    assert!(laps.recv_timeout(Duration::from_secs(5)).is_ok());
}

#[test]
fn config_updates_merge_and_rebuild_the_engine() {
    let rig = Rig::new();
    let detector = LapDetector::new(settings(free_port()), rig.backend()).unwrap();
    assert_eq!(rig.built.load(Ordering::SeqCst), 1);

    let snapshot = detector
        .update_detector_config(&json!({ "min_lap_time": 3.0, "bogus": true }))
        .unwrap();
    assert_eq!(snapshot["min_lap_time"], 3.0);
    assert!(snapshot.get("bogus").is_none());
    assert_eq!(rig.built.load(Ordering::SeqCst), 1);

    detector
        .update_detector_config(&json!({ "threads": 2 }))
        .unwrap();
    assert_eq!(detector.detector_config().engine.threads, 2);
    assert_eq!(rig.built.load(Ordering::SeqCst), 2);

    let kept = detector
        .update_detector_config(&json!({ "threads": 99, "max_hamming": 1 }))
        .unwrap();
    assert_eq!(kept["threads"], 2);
    assert_eq!(kept["max_hamming"], 1);
    assert_eq!(rig.built.load(Ordering::SeqCst), 2);

    assert!(matches!(
        detector.update_detector_config(&json!({ "min_lap_time": -1.0 })),
        Err(Error::InvalidConfig(_))
    ));
    assert_eq!(detector.detector_config().min_lap_time, 3.0);
}

#[test]
fn finish_line_and_camera_settings_are_replaceable() {
    let rig = Rig::new();
    let detector = LapDetector::new(settings(free_port()), rig.backend()).unwrap();

    let line = laptrack::FinishLine::new(na::Point2::new(0.0, 0.0), na::Point2::new(10.0, 10.0))
        .unwrap();
    detector.set_finish_line(line);
    assert_eq!(detector.finish_line(), line);

    let mut camera = detector.camera_config();
    camera.index = 4;
    detector.set_camera_config(camera.clone()).unwrap();
    assert_eq!(rig.opened.load(Ordering::SeqCst), 0);

    detector.start().unwrap();
    detector.set_camera_config(camera).unwrap();
    assert!(detector.status());
    assert_eq!(rig.opened.load(Ordering::SeqCst), 2);
    assert_eq!(detector.camera_config().index, 4);
}

#[test]
fn camera_restart_keeps_emission_switch() {
    let rig = Rig::new();
    let detector = LapDetector::new(settings(free_port()), rig.backend()).unwrap();
    let laps = detector.laps();

    detector.start().unwrap();
    detector.set_enabled(false);

    detector.set_camera_config(detector.camera_config()).unwrap();
    assert!(detector.status());
    assert!(!detector.is_enabled());

    rig.script.push(&[200.0, 260.0, 200.0]);
    rig.script.wait_drained();
    assert!(laps.try_recv().is_err());

    detector.set_enabled(true);
    detector.set_camera_config(detector.camera_config()).unwrap();
    assert!(detector.is_enabled());
}

#[test]
fn focus_tuning_needs_a_running_camera() {
    let rig = Rig::new();
    let detector = LapDetector::new(settings(free_port()), rig.backend()).unwrap();

    assert_eq!(
        detector.auto_tune_focus(),
        Err(FocusTuningFailure::CameraNotOpen)
    );
}

#[test]
fn invalid_settings_are_refused() {
    let rig = Rig::new();
    let mut settings = settings(free_port());
    settings.detector.min_lap_time = 0.0;

    assert!(matches!(
        LapDetector::new(settings, rig.backend()),
        Err(Error::InvalidConfig(_))
    ));
}

#[test]
fn detector_is_shareable_across_threads() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<LapDetector>();

    let rig = Rig::new();
    let detector = Arc::new(LapDetector::new(settings(free_port()), rig.backend()).unwrap());

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let detector = detector.clone();
            thread::spawn(move || {
                detector.start().unwrap();
                detector.set_enabled(true);
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert!(detector.status());
    assert_eq!(rig.opened.load(Ordering::SeqCst), 1);
    detector.stop();
}
