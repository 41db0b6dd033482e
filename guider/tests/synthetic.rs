//! End-to-end guiding scenarios on synthetic star frames, with fake mount
//! and frame-source implementations standing in for the hardware.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use guider::calibration::{calibrate, CalibrationTiming};
use guider::config::GuideMethod;
use guider::{FrameSource, Guider, MountCommander, PulseDirection};
use shared::{Frame, StatusLog};

/// Render a Gaussian star on a mildly noisy background.
fn star_frame(width: usize, height: usize, x: f64, y: f64, sigma: f64, peak: f64) -> Array2<u8> {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let mut frame = Array2::<f64>::zeros((height, width));
    for ((py, px), v) in frame.indexed_iter_mut() {
        let dx = px as f64 - x;
        let dy = py as f64 - y;
        *v = peak * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp();
        *v += rng.gen_range(0.0..4.0);
    }
    frame.mapv(|v| v.round().clamp(0.0, 255.0) as u8)
}

struct FakeFrames {
    frame: Mutex<Option<Arc<Frame>>>,
    seq: AtomicU64,
}

impl FakeFrames {
    fn new() -> Self {
        Self {
            frame: Mutex::new(None),
            seq: AtomicU64::new(0),
        }
    }

    fn publish(&self, pixels: Array2<u8>) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        *self.frame.lock().unwrap() = Some(Arc::new(Frame::new_gray(pixels, seq)));
    }
}

impl FrameSource for FakeFrames {
    fn current_frame(&self) -> Option<Arc<Frame>> {
        self.frame.lock().unwrap().clone()
    }
}

#[derive(Default)]
struct MountLogs {
    pulses: Vec<(PulseDirection, f64)>,
    movements: Vec<(i32, i32)>,
    stops: u32,
    backlash: Vec<(u16, u16)>,
}

/// Recording mount; when wired to a frame source it also moves the
/// synthetic star in response to pulses, so calibration sees realistic
/// displacements.
struct FakeMount {
    logs: Mutex<MountLogs>,
    quiet: Mutex<bool>,
    /// Pixels per second of eastward motion, (dx, dy).
    east_rate: (f64, f64),
    star: Mutex<(f64, f64)>,
    frames: Mutex<Option<Arc<FakeFrames>>>,
    frame_size: (usize, usize),
}

impl FakeMount {
    fn new() -> Self {
        Self {
            logs: Mutex::new(MountLogs::default()),
            quiet: Mutex::new(false),
            east_rate: (0.0, 0.0),
            star: Mutex::new((0.0, 0.0)),
            frames: Mutex::new(None),
            frame_size: (640, 480),
        }
    }

    fn with_motion(east_rate: (f64, f64), star: (f64, f64), frames: Arc<FakeFrames>) -> Self {
        Self {
            logs: Mutex::new(MountLogs::default()),
            quiet: Mutex::new(false),
            east_rate,
            star: Mutex::new(star),
            frames: Mutex::new(Some(frames)),
            frame_size: (640, 480),
        }
    }

    fn render(&self) {
        if let Some(frames) = self.frames.lock().unwrap().as_ref() {
            let (x, y) = *self.star.lock().unwrap();
            let (w, h) = self.frame_size;
            frames.publish(star_frame(w, h, x, y, 2.0, 200.0));
        }
    }
}

impl MountCommander for FakeMount {
    fn correction_pulse(&self, direction: PulseDirection, seconds: f64) -> Result<(), String> {
        self.logs.lock().unwrap().pulses.push((direction, seconds));
        let (ex, ey) = self.east_rate;
        {
            let mut star = self.star.lock().unwrap();
            match direction {
                PulseDirection::East => {
                    star.0 += ex * seconds;
                    star.1 += ey * seconds;
                }
                PulseDirection::West => {
                    star.0 -= ex * seconds;
                    star.1 -= ey * seconds;
                }
                // DEC moves along the axis orthogonal to east in the field.
                PulseDirection::North => {
                    star.0 -= ey * seconds;
                    star.1 += ex * seconds;
                }
                PulseDirection::South => {
                    star.0 += ey * seconds;
                    star.1 -= ex * seconds;
                }
            }
        }
        self.render();
        Ok(())
    }

    fn start_movement(&self, ra_speed: i32, dec_speed: i32) -> Result<(), String> {
        self.logs.lock().unwrap().movements.push((ra_speed, dec_speed));
        Ok(())
    }

    fn stop_all(&self) -> Result<(), String> {
        self.logs.lock().unwrap().stops += 1;
        Ok(())
    }

    fn set_guide_rate(&self) -> Result<(), String> {
        Ok(())
    }

    fn set_backlash(&self, ra: u16, dec: u16) -> Result<(), String> {
        self.logs.lock().unwrap().backlash.push((ra, dec));
        Ok(())
    }

    fn set_quiet(&self, quiet: bool) {
        *self.quiet.lock().unwrap() = quiet;
    }

    fn quiet(&self) -> bool {
        *self.quiet.lock().unwrap()
    }

    fn declination_deg(&self) -> f64 {
        0.0
    }
}

fn test_guider(mount: Arc<FakeMount>, frames: Arc<FakeFrames>) -> (Guider, Arc<StatusLog>) {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(StatusLog::new(dir.path().to_path_buf()));
    // The tempdir handle is dropped here; the log lazily recreates files
    // and the tests only read last_status.
    let guider = Guider::new(mount, frames, Arc::clone(&log));
    guider.set_gray_threshold(128);
    guider.set_star_size(4.0).unwrap();
    guider.set_max_distance(20.0).unwrap();
    (guider, log)
}

#[test]
fn acquire_and_hold() {
    let frames = Arc::new(FakeFrames::new());
    frames.publish(star_frame(640, 480, 321.7, 240.3, 2.0, 200.0));
    let mount = Arc::new(FakeMount::new());
    let (guider, _log) = test_guider(mount, Arc::clone(&frames));

    let (cx, cy) = guider.acquire(None).expect("acquire failed");
    assert!((cx - 321.7).abs() <= 0.2, "cx = {cx}");
    assert!((cy - 240.3).abs() <= 0.2, "cy = {cy}");

    // An identical frame produces a (near) zero correction.
    frames.publish(star_frame(640, 480, 321.7, 240.3, 2.0, 200.0));
    let frame = frames.current_frame().unwrap();
    guider.guide_iteration(&frame);

    let snapshot = guider.snapshot();
    assert!(snapshot.star_locked);
    assert!(snapshot.last_correction.ra_px.abs() < 0.2);
    assert!(snapshot.last_correction.dec_px.abs() < 0.2);
    assert_eq!(snapshot.last_correction.ra, 0);
    assert_eq!(snapshot.last_correction.dec, 0);
}

#[test]
fn pulse_mode_correction_issues_one_west_pulse() {
    let frames = Arc::new(FakeFrames::new());
    frames.publish(star_frame(640, 480, 321.7, 240.3, 2.0, 200.0));
    let mount = Arc::new(FakeMount::new());
    let (guider, _log) = test_guider(Arc::clone(&mount), Arc::clone(&frames));

    guider.set_max_drift(10.0).unwrap();
    guider.set_rotation_angle(0.0).unwrap();
    guider.set_pixel_scale(3.6).unwrap();
    guider.set_guide_pulse(0.4).unwrap();
    guider.set_guide_method(GuideMethod::Pulse);

    guider.acquire(None).expect("acquire failed");
    guider.enable_guiding(true).unwrap();

    // The star drifted 10 px east in frame coordinates.
    frames.publish(star_frame(640, 480, 331.7, 240.3, 2.0, 200.0));
    let frame = frames.current_frame().unwrap();
    guider.guide_iteration(&frame);

    let snapshot = guider.snapshot();
    assert!(
        (snapshot.last_correction.ra_arcsec - 36.0).abs() < 1.0,
        "ra_arcsec = {}",
        snapshot.last_correction.ra_arcsec
    );
    assert_eq!(snapshot.last_correction.ra, -1);
    assert_eq!(snapshot.last_correction.dec, 0);

    // Exactly one RA pulse of guide_pulse seconds.
    for _ in 0..100 {
        if !mount.logs.lock().unwrap().pulses.is_empty() {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    let logs = mount.logs.lock().unwrap();
    assert_eq!(logs.pulses, vec![(PulseDirection::West, 0.4)]);
}

#[test]
fn lost_tracking_reports_and_stops() {
    let frames = Arc::new(FakeFrames::new());
    frames.publish(star_frame(640, 480, 321.7, 240.3, 2.0, 200.0));
    let mount = Arc::new(FakeMount::new());
    let (guider, log) = test_guider(Arc::clone(&mount), Arc::clone(&frames));

    guider.set_guide_method(GuideMethod::Speed);
    guider.acquire(None).expect("acquire failed");
    guider.enable_guiding(true).unwrap();

    // No contour exceeds star_size in a dark frame.
    frames.publish(Array2::zeros((480, 640)));
    let frame = frames.current_frame().unwrap();
    guider.guide_iteration(&frame);

    let snapshot = guider.snapshot();
    assert!(!snapshot.star_locked);
    assert!(snapshot.last_correction.is_zero());
    assert!(log.last_status().contains("LOST TRACKING"));

    // With guiding on, a zero-speed command halts the motion.
    let logs = mount.logs.lock().unwrap();
    assert!(logs.movements.contains(&(0, 0)));
}

#[test]
fn missing_slot_keeps_previous_current_centroid() {
    let frames = Arc::new(FakeFrames::new());
    frames.publish(star_frame(640, 480, 100.0, 100.0, 2.0, 200.0));
    let mount = Arc::new(FakeMount::new());
    let (guider, _log) = test_guider(mount, Arc::clone(&frames));

    guider.acquire(None).expect("acquire failed");
    let before = guider.snapshot().current.clone();

    frames.publish(Array2::zeros((480, 640)));
    let frame = frames.current_frame().unwrap();
    guider.guide_iteration(&frame);

    assert_eq!(guider.snapshot().current, before);
}

#[test]
fn acquire_rejects_star_already_tracked_nearby() {
    let frames = Arc::new(FakeFrames::new());
    frames.publish(star_frame(640, 480, 200.0, 200.0, 2.0, 200.0));
    let mount = Arc::new(FakeMount::new());
    let (guider, _log) = test_guider(mount, Arc::clone(&frames));

    guider.acquire(Some((201.0, 199.0))).expect("acquire failed");
    let err = guider.acquire(Some((202.0, 198.0)));
    assert!(err.is_err());
    assert_eq!(guider.snapshot().tracked.len(), 1);
}

#[test]
fn calibration_recovers_field_rotation() {
    let frames = Arc::new(FakeFrames::new());
    // East motion carries the star (+100, +50) px over the 30 s between
    // the first and third detection.
    let mount = Arc::new(FakeMount::with_motion(
        (100.0 / 30.0, 50.0 / 30.0),
        (200.0, 200.0),
        Arc::clone(&frames),
    ));
    mount.render();

    let (guider, _log) = test_guider(Arc::clone(&mount), Arc::clone(&frames));
    guider.acquire(None).expect("acquire failed");

    let timing = CalibrationTiming {
        settle: Duration::from_millis(0),
        move_scale: 1.0,
    };
    let result = calibrate(&guider, false, &timing).expect("calibration failed");

    let expected = -(50.0f64).atan2(100.0).to_degrees();
    assert!(
        (result.rotation_angle - expected).abs() < 0.2,
        "angle = {}, expected {expected}",
        result.rotation_angle
    );
    assert_eq!(guider.snapshot().rotation.rotation_angle, result.rotation_angle);

    // Guiding flag and quiet mode restored.
    assert!(!guider.guiding());
    assert!(!mount.quiet());
    assert!(!guider.is_calibrating());
}

#[test]
fn calibration_without_star_fails_without_mutation() {
    let frames = Arc::new(FakeFrames::new());
    frames.publish(star_frame(640, 480, 100.0, 100.0, 2.0, 200.0));
    let mount = Arc::new(FakeMount::new());
    let (guider, _log) = test_guider(Arc::clone(&mount), Arc::clone(&frames));

    let before = guider.snapshot().rotation.clone();
    let timing = CalibrationTiming {
        settle: Duration::from_millis(0),
        move_scale: 1.0,
    };
    assert!(calibrate(&guider, false, &timing).is_err());
    assert_eq!(guider.snapshot().rotation, before);
    assert!(mount.logs.lock().unwrap().pulses.is_empty());
}

#[test]
fn pid_method_clamps_speed_output() {
    let frames = Arc::new(FakeFrames::new());
    frames.publish(star_frame(640, 480, 100.0, 100.0, 2.0, 200.0));
    let mount = Arc::new(FakeMount::new());
    let (guider, _log) = test_guider(Arc::clone(&mount), Arc::clone(&frames));

    guider.set_guide_method(GuideMethod::Pid);
    guider.set_pixel_scale(10.0).unwrap();
    guider.set_pid_gains(10.0, 0.0, 0.0);
    guider.acquire(None).expect("acquire failed");
    guider.enable_guiding(true).unwrap();

    // 15 px drift at 10 arcsec/px with Kp=10 would be -1500 without the
    // clamp.
    frames.publish(star_frame(640, 480, 115.0, 100.0, 2.0, 200.0));
    let frame = frames.current_frame().unwrap();
    guider.guide_iteration(&frame);

    let snapshot = guider.snapshot();
    assert_eq!(snapshot.last_correction.ra_speed, -99);
    let logs = mount.logs.lock().unwrap();
    assert_eq!(logs.movements.last(), Some(&(-99, 0)));
}
